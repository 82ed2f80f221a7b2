//! Upload endpoints.
//!
//! Every endpoint shares one flow: stream the `file` part into a transient file, wait for a
//! conversion slot, then run the kernel pipeline on the blocking pool. The transient file and the
//! slot move into the blocking task together, so the file is deleted and the slot released only
//! once the kernel is done with them, even if the client has gone away in the meantime.

use std::path::Path;
use std::time::Instant;

use axum::{
    Json,
    extract::{
        Multipart, State,
        multipart::{MultipartError, MultipartRejection},
    },
    http::StatusCode,
};
use tokio::task::JoinError;
use tracing::{Span, info, instrument};
use uuid::Uuid;

use crate::AppState;
use crate::api::models::conversions::{ConversionResponse, MeshResponse};
use crate::convert::{Dispatch, convert, export};
use crate::errors::{Error, Result};
use crate::format::{Format, extension_of};
use crate::kernel::GeometryKernel;
use crate::transient::{TransientFile, TransientUpload};

const FILE_FIELD: &str = "file";

#[utoipa::path(
    post,
    path = "/upload-step/",
    tag = "conversions",
    summary = "Convert a STEP upload",
    description = "Reads the uploaded file as STEP whatever its name, tessellates it and returns the number of faces.

The route path is configurable; this is the default.",
    request_body(
        content_type = "multipart/form-data",
        description = "A single `file` part holding the STEP data"
    ),
    responses(
        (status = 200, description = "File converted", body = ConversionResponse),
        (status = 400, description = "Malformed multipart body or missing `file` part", body = crate::errors::ErrorResponse),
        (status = 413, description = "Upload exceeds the configured size limit", body = crate::errors::ErrorResponse),
        (status = 429, description = "No conversion slot available", body = crate::errors::ErrorResponse),
        (status = 500, description = "The file could not be read or processed", body = crate::errors::ErrorResponse),
    )
)]
pub async fn upload_step(
    State(state): State<AppState>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Json<ConversionResponse>> {
    handle_upload(&state, Dispatch::StepOnly, multipart?, count_faces).await.map(Json)
}

#[utoipa::path(
    post,
    path = "/api/convert-step",
    tag = "conversions",
    summary = "Convert a CAD upload",
    description = "Dispatches on the filename suffix: `.step` and `.stp` are read as STEP, `.stl` as STL. \
`.obj` is recognized but not implemented yet. Every other suffix is rejected.

The route path is configurable; this is the default.",
    request_body(
        content_type = "multipart/form-data",
        description = "A single `file` part; its filename selects the reader"
    ),
    responses(
        (status = 200, description = "File converted", body = ConversionResponse),
        (status = 400, description = "Malformed multipart body or missing `file` part", body = crate::errors::ErrorResponse),
        (status = 413, description = "Upload exceeds the configured size limit", body = crate::errors::ErrorResponse),
        (status = 429, description = "No conversion slot available", body = crate::errors::ErrorResponse),
        (status = 500, description = "Unsupported or unimplemented format, or the file could not be read or processed", body = crate::errors::ErrorResponse),
    )
)]
pub async fn convert_upload(
    State(state): State<AppState>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Json<ConversionResponse>> {
    handle_upload(&state, Dispatch::MultiFormat, multipart?, count_faces).await.map(Json)
}

#[utoipa::path(
    post,
    path = "/api/convert-mesh",
    tag = "conversions",
    summary = "Tessellate a CAD upload",
    description = "Dispatches on the filename suffix like the face-count endpoint, tessellates the shape and \
returns its triangles. Vertices with identical coordinates are listed once and shared between triangles.

Disabled unless `routes.mesh.enabled` is set. The route path is configurable; this is the default.",
    request_body(
        content_type = "multipart/form-data",
        description = "A single `file` part; its filename selects the reader"
    ),
    responses(
        (status = 200, description = "File tessellated", body = MeshResponse),
        (status = 400, description = "Malformed multipart body or missing `file` part", body = crate::errors::ErrorResponse),
        (status = 413, description = "Upload exceeds the configured size limit", body = crate::errors::ErrorResponse),
        (status = 429, description = "No conversion slot available", body = crate::errors::ErrorResponse),
        (status = 500, description = "Unsupported or unimplemented format, or the file could not be read or processed", body = crate::errors::ErrorResponse),
    )
)]
pub async fn convert_mesh(
    State(state): State<AppState>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Json<MeshResponse>> {
    handle_upload(&state, Dispatch::MultiFormat, multipart?, export_mesh).await.map(Json)
}

fn count_faces(kernel: &dyn GeometryKernel, dispatch: Dispatch, format: &Format, path: &Path, linear_deflection: f64) -> Result<ConversionResponse> {
    let faces = convert(kernel, dispatch, format, path, linear_deflection)?;
    info!(faces, "Faces counted");
    Ok(ConversionResponse::ok(faces))
}

fn export_mesh(kernel: &dyn GeometryKernel, dispatch: Dispatch, format: &Format, path: &Path, linear_deflection: f64) -> Result<MeshResponse> {
    let mesh = export(kernel, dispatch, format, path, linear_deflection)?;
    info!(vertices = mesh.vertices.len(), triangles = mesh.faces.len(), "Mesh exported");
    Ok(mesh.into())
}

impl From<MultipartRejection> for Error {
    fn from(rejection: MultipartRejection) -> Self {
        Error::BadRequest {
            message: rejection.body_text(),
        }
    }
}

fn multipart_error(err: MultipartError, max_file_size: u64) -> Error {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        too_large(max_file_size)
    } else {
        Error::BadRequest {
            message: format!("Failed to parse multipart data: {}", err.body_text()),
        }
    }
}

fn too_large(max_file_size: u64) -> Error {
    Error::PayloadTooLarge {
        message: format!(
            "File size exceeds maximum allowed size of {} bytes ({} MB)",
            max_file_size,
            max_file_size / (1024 * 1024)
        ),
    }
}

fn join_error(err: JoinError) -> Error {
    if err.is_panic() {
        Error::KernelProcessing {
            message: "Geometry kernel failed while processing the file".to_string(),
        }
    } else {
        Error::Internal {
            operation: format!("join conversion task: {err}"),
        }
    }
}

/// The received `file` part, already on disk.
struct Received {
    filename: String,
    format: Format,
    file: TransientFile,
}

/// Stream the `file` part to disk. Other parts are skipped.
async fn receive(state: &AppState, multipart: &mut Multipart) -> Result<Received> {
    let max_file_size = state.config.uploads.max_file_size;
    let mut received: Option<Received> = None;

    while let Some(mut field) = multipart.next_field().await.map_err(|e| multipart_error(e, max_file_size))? {
        if field.name() != Some(FILE_FIELD) {
            tracing::debug!(field = ?field.name(), "Skipping multipart field");
            continue;
        }
        if received.is_some() {
            return Err(Error::BadRequest {
                message: format!("Only one '{FILE_FIELD}' field may be uploaded"),
            });
        }

        let filename = field.file_name().unwrap_or_default().to_string();
        let mut upload = TransientUpload::create(state.config.uploads.temp_dir.as_deref(), &extension_of(&filename))?;

        while let Some(chunk) = field.chunk().await.map_err(|e| multipart_error(e, max_file_size))? {
            if upload.written() + chunk.len() as u64 > max_file_size {
                tracing::warn!(
                    filename = %filename,
                    written = upload.written(),
                    max_file_size,
                    "File size limit exceeded, aborting upload"
                );
                // The partial file goes with `upload`.
                return Err(too_large(max_file_size));
            }
            upload.write_chunk(&chunk).await?;
        }

        received = Some(Received {
            format: Format::from_filename(&filename),
            filename,
            file: upload.finish().await?,
        });
    }

    received.ok_or_else(|| Error::BadRequest {
        message: format!("Missing '{FILE_FIELD}' field in multipart upload"),
    })
}

/// Receive the upload, then run `pipeline` on it in the blocking pool.
#[instrument(skip_all, fields(upload_id = %Uuid::new_v4(), dispatch = ?dispatch))]
async fn handle_upload<T, F>(state: &AppState, dispatch: Dispatch, mut multipart: Multipart, pipeline: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn GeometryKernel, Dispatch, &Format, &Path, f64) -> Result<T> + Send + 'static,
{
    let started = Instant::now();

    let Received { filename, format, file } = receive(state, &mut multipart).await?;
    info!(filename = %filename, %format, size = file.size(), "Upload received");

    let permit = match &state.conversion_limiter {
        Some(limiter) => Some(limiter.acquire().await?),
        None => None,
    };

    let kernel = state.kernel.clone();
    let linear_deflection = state.config.conversion.linear_deflection;
    let span = Span::current();

    let output = tokio::task::spawn_blocking(move || {
        let _entered = span.enter();
        let _permit = permit;

        let result = pipeline(kernel.as_ref(), dispatch, &format, file.path(), linear_deflection);
        file.close();
        result
    })
    .await
    .map_err(join_error)??;

    info!(elapsed_ms = started.elapsed().as_millis() as u64, "Conversion finished");
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::TruckKernel;
    use crate::test_utils::{
        FakeKernel, binary_stl, create_test_config, create_test_server_with, create_test_state, step_cube, test_server,
    };
    use std::sync::Arc;
    use axum_test::multipart::{MultipartForm, Part};
    use serde_json::Value;

    fn file_form(filename: &str, content: impl Into<Vec<u8>>) -> MultipartForm {
        MultipartForm::new().add_part("file", Part::bytes(content.into()).file_name(filename))
    }

    #[test_log::test(tokio::test)]
    async fn test_step_only_counts_faces() {
        let (server, _dir) = create_test_server_with(create_test_config(), FakeKernel::default());

        let response = server.post("/upload-step/").multipart(file_form("cube.step", "FACES=6")).await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body, serde_json::json!({ "status": "ok", "faces": 6 }));
    }

    #[test_log::test(tokio::test)]
    async fn test_step_only_ignores_suffix() {
        let kernel = FakeKernel::default();
        let (server, _dir) = create_test_server_with(create_test_config(), kernel.clone());

        let response = server.post("/upload-step/").multipart(file_form("cube.obj", "FACES=3")).await;

        response.assert_status_ok();
        assert_eq!(response.json::<Value>()["faces"], 3);
        assert_eq!(kernel.step_reads(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_multi_format_dispatch() {
        let kernel = FakeKernel::default();
        let (server, _dir) = create_test_server_with(create_test_config(), kernel.clone());

        for name in ["part.step", "part.STP"] {
            let response = server.post("/api/convert-step").multipart(file_form(name, "FACES=2")).await;
            response.assert_status_ok();
            assert_eq!(response.json::<Value>()["faces"], 2);
        }
        assert_eq!(kernel.step_reads(), 2);

        let response = server.post("/api/convert-step").multipart(file_form("scan.stl", "FACES=9")).await;
        response.assert_status_ok();
        assert_eq!(response.json::<Value>()["faces"], 9);
        assert_eq!(kernel.stl_reads(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_obj_and_unknown_formats() {
        let kernel = FakeKernel::default();
        let (server, _dir) = create_test_server_with(create_test_config(), kernel.clone());

        let response = server.post("/api/convert-step").multipart(file_form("mesh.obj", "v 0 0 0")).await;
        response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.json::<Value>(),
            serde_json::json!({ "error": "OBJ format support is not yet implemented" })
        );

        let response = server.post("/api/convert-step").multipart(file_form("drawing.xyz", "data")).await;
        response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.json::<Value>()["error"], "Unsupported file format: .xyz");

        assert_eq!(kernel.calls(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_kernel_failure_is_500_and_cleans_up() {
        let (server, dir) = create_test_server_with(create_test_config(), FakeKernel::default());

        let response = server.post("/api/convert-step").multipart(file_form("broken.step", "garbage")).await;

        response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.json::<Value>()["error"].as_str().is_some_and(|m| !m.is_empty()));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_kernel_panic_is_500_and_cleans_up() {
        let (server, dir) = create_test_server_with(create_test_config(), FakeKernel::default());

        let response = server.post("/upload-step/").multipart(file_form("boom.step", "PANIC")).await;

        response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.json::<Value>()["error"],
            "Geometry kernel failed while processing the file"
        );
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_transient_files_removed_after_every_outcome() {
        let (server, dir) = create_test_server_with(create_test_config(), FakeKernel::default());

        server.post("/api/convert-step").multipart(file_form("ok.step", "FACES=1")).await.assert_status_ok();
        server.post("/api/convert-step").multipart(file_form("bad.step", "nope")).await;
        server.post("/api/convert-step").multipart(file_form("mesh.obj", "v 0 0 0")).await;
        server.post("/api/convert-step").multipart(file_form("x.xyz", "?")).await;

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_missing_file_field() {
        let (server, _dir) = create_test_server_with(create_test_config(), FakeKernel::default());

        let form = MultipartForm::new().add_text("comment", "no file here");
        let response = server.post("/api/convert-step").multipart(form).await;

        response.assert_status_bad_request();
        assert_eq!(response.json::<Value>()["error"], "Missing 'file' field in multipart upload");
    }

    #[test_log::test(tokio::test)]
    async fn test_duplicate_file_field() {
        let (server, dir) = create_test_server_with(create_test_config(), FakeKernel::default());

        let form = MultipartForm::new()
            .add_part("file", Part::bytes(b"FACES=1".to_vec()).file_name("a.step"))
            .add_part("file", Part::bytes(b"FACES=2".to_vec()).file_name("b.step"));
        let response = server.post("/api/convert-step").multipart(form).await;

        response.assert_status_bad_request();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_extra_fields_are_ignored() {
        let (server, _dir) = create_test_server_with(create_test_config(), FakeKernel::default());

        let form = MultipartForm::new()
            .add_text("units", "mm")
            .add_part("file", Part::bytes(b"FACES=4".to_vec()).file_name("part.step"));
        let response = server.post("/api/convert-step").multipart(form).await;

        response.assert_status_ok();
        assert_eq!(response.json::<Value>()["faces"], 4);
    }

    #[test_log::test(tokio::test)]
    async fn test_not_multipart_is_bad_request() {
        let (server, _dir) = create_test_server_with(create_test_config(), FakeKernel::default());

        let response = server.post("/api/convert-step").text("FACES=1").await;

        response.assert_status_bad_request();
        assert!(response.json::<Value>()["error"].is_string());
    }

    #[test_log::test(tokio::test)]
    async fn test_oversized_upload_rejected() {
        let mut config = create_test_config();
        config.uploads.max_file_size = 16;
        let (server, dir) = create_test_server_with(config, FakeKernel::default());

        let response = server
            .post("/api/convert-step")
            .multipart(file_form("big.step", vec![b'x'; 1024]))
            .await;

        response.assert_status(StatusCode::PAYLOAD_TOO_LARGE);
        assert!(response.json::<Value>()["error"].as_str().unwrap().contains("16 bytes"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_real_kernel_stl_upload() {
        let (server, dir) = create_test_server_with(create_test_config(), TruckKernel::new());

        let response = server.post("/api/convert-step").multipart(file_form("scan.stl", binary_stl(5))).await;

        response.assert_status_ok();
        assert_eq!(response.json::<Value>(), serde_json::json!({ "status": "ok", "faces": 5 }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_real_kernel_step_cube_on_both_routes() {
        let (server, dir) = create_test_server_with(create_test_config(), TruckKernel::new());

        let uploads = [
            ("/upload-step/", "cube.step"),
            ("/api/convert-step", "cube.step"),
            ("/api/convert-step", "cube.stp"),
        ];
        for (route, name) in uploads {
            let response = server.post(route).multipart(file_form(name, step_cube())).await;

            response.assert_status_ok();
            assert_eq!(response.json::<Value>(), serde_json::json!({ "status": "ok", "faces": 6 }), "{route} {name}");
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_mesh_route_stl() {
        let mut config = create_test_config();
        config.routes.mesh.enabled = true;
        let (server, dir) = create_test_server_with(config, TruckKernel::new());

        let response = server.post("/api/convert-mesh").multipart(file_form("strip.stl", binary_stl(3))).await;

        response.assert_status_ok();
        let body: Value = response.json();
        let faces = body["faces"].as_array().unwrap();
        assert_eq!(faces.len(), 3);
        assert_eq!(body["vertices"].as_array().unwrap().len(), 7);

        // Each facet's second corner is the next facet's first.
        for pair in faces.windows(2) {
            assert_eq!(pair[0][1], pair[1][0]);
        }
        let shared = faces[0][1].as_u64().unwrap() as usize;
        assert_eq!(body["vertices"][shared], serde_json::json!([1.0, 0.0, 0.0]));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_mesh_route_step_cube() {
        let mut config = create_test_config();
        config.routes.mesh.enabled = true;
        let (server, dir) = create_test_server_with(config, TruckKernel::new());

        let response = server.post("/api/convert-mesh").multipart(file_form("cube.step", step_cube())).await;

        response.assert_status_ok();
        let body: Value = response.json();
        let vertices = body["vertices"].as_array().unwrap();
        let faces = body["faces"].as_array().unwrap();
        assert!(vertices.len() >= 8);
        assert!(faces.len() >= 12);
        assert!(
            faces
                .iter()
                .flat_map(|f| f.as_array().unwrap())
                .all(|i| (i.as_u64().unwrap() as usize) < vertices.len())
        );
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_mesh_route_rejects_like_multi_format() {
        let mut config = create_test_config();
        config.routes.mesh.enabled = true;
        let kernel = FakeKernel::default();
        let (server, dir) = create_test_server_with(config, kernel.clone());

        let response = server.post("/api/convert-mesh").multipart(file_form("mesh.obj", "v 0 0 0")).await;
        response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.json::<Value>()["error"], "OBJ format support is not yet implemented");

        let response = server.post("/api/convert-mesh").multipart(file_form("drawing.xyz", "data")).await;
        response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.json::<Value>()["error"], "Unsupported file format: .xyz");

        assert_eq!(kernel.calls(), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_storage_failure_does_not_leak_path() {
        let root = tempfile::tempdir().unwrap();
        let mut config = create_test_config();
        config.uploads.temp_dir = Some(root.path().join("missing"));

        let state = AppState::new(config, Arc::new(FakeKernel::default()));
        let server = test_server(&state);

        let response = server.post("/api/convert-step").multipart(file_form("part.step", "FACES=1")).await;

        response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.json::<Value>(), serde_json::json!({ "error": "Failed to store upload" }));
    }

    #[test_log::test(tokio::test)]
    async fn test_real_kernel_malformed_step() {
        let (server, _dir) = create_test_server_with(create_test_config(), TruckKernel::new());

        let response = server
            .post("/upload-step/")
            .multipart(file_form("broken.step", "not an exchange file"))
            .await;

        response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.json::<Value>()["error"].is_string());
    }

    #[test_log::test(tokio::test)]
    async fn test_concurrent_uploads_are_independent() {
        let (server, dir) = create_test_server_with(create_test_config(), FakeKernel::default());
        let server = &server;

        let requests = (1..=8u64).map(|n| async move {
            let response = server
                .post("/api/convert-step")
                .multipart(file_form(&format!("part-{n}.step"), format!("FACES={n}")))
                .await;
            response.assert_status_ok();
            response.json::<Value>()["faces"].as_u64().unwrap()
        });
        let faces = futures::future::join_all(requests).await;

        assert_eq!(faces, (1..=8).collect::<Vec<u64>>());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_saturated_limiter_is_429() {
        let mut config = create_test_config();
        config.limits.max_concurrent_conversions = 1;
        config.limits.max_wait = std::time::Duration::ZERO;

        let (state, dir) = create_test_state(config, FakeKernel::default());
        let server = test_server(&state);

        let held = state.conversion_limiter.as_ref().unwrap().acquire().await.unwrap();

        let response = server.post("/api/convert-step").multipart(file_form("part.step", "FACES=1")).await;
        response.assert_status(StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        drop(held);
        server
            .post("/api/convert-step")
            .multipart(file_form("part.step", "FACES=1"))
            .await
            .assert_status_ok();
    }
}
