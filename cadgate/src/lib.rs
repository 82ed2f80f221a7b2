//! # cadgate: upload gateway for CAD files
//!
//! `cadgate` accepts a CAD file over HTTP, hands it to a geometry kernel and answers with the
//! number of faces of the tessellated shape. It is a thin bridge: parsing, meshing and topology
//! traversal all belong to the kernel.
//!
//! ## Endpoints
//!
//! Two face-count endpoints share one pipeline and differ only in dispatch:
//!
//! - `POST /upload-step/` reads every upload as STEP.
//! - `POST /api/convert-step` picks the reader from the filename suffix: `.step`/`.stp` as STEP,
//!   `.stl` as STL. `.obj` is recognized but not implemented yet, everything else is rejected.
//!
//! Both take `multipart/form-data` with a `file` part and answer `{"status":"ok","faces":n}` on
//! success or `{"error":"..."}` with a non-2xx status.
//!
//! `POST /api/convert-mesh`, off by default, dispatches like `/api/convert-step` and answers
//! `{"vertices":[[x,y,z],...],"faces":[[i,j,k],...]}` with coincident vertices merged. Paths and
//! which endpoints are mounted come from [`config`].
//!
//! ## Request Flow
//!
//! The `file` part is streamed into a uniquely named transient file ([`transient`]) carrying the
//! original suffix. Once the part is complete the request waits for a slot in the
//! [`limits::ConversionLimiter`], then moves the file into a blocking task that runs
//! [`convert::convert`]: read, mesh with the configured linear deflection, count faces. The
//! transient file is deleted when that task finishes, whatever the outcome.
//!
//! The kernel sits behind the [`kernel::GeometryKernel`] trait; [`kernel::TruckKernel`] is the
//! production implementation.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use cadgate::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = cadgate::config::Args::parse();
//!     let config = Config::load(&args)?;
//!
//!     cadgate::telemetry::init_telemetry(config.enable_otel_export)?;
//!
//!     let app = Application::new(config).await?;
//!     app.serve(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//!
//!     Ok(())
//! }
//! ```
pub mod api;
pub mod config;
pub mod convert;
pub mod errors;
pub mod format;
pub mod kernel;
pub mod limits;
mod openapi;
pub mod telemetry;
pub mod transient;

#[cfg(test)]
mod test_utils;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use axum::{
    Json, Router, http,
    routing::{get, post},
};
use axum_prometheus::PrometheusMetricLayer;
use bon::Builder;
pub use config::Config;
use config::CorsOrigin;
use kernel::{GeometryKernel, TruckKernel};
use limits::ConversionLimiter;
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, debug, info, instrument};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

use crate::openapi::ApiDoc;

/// Allowance on top of `uploads.max_file_size` for multipart boundaries and part headers.
const MULTIPART_OVERHEAD: u64 = 64 * 1024;

/// Application state shared across all request handlers.
///
/// ```ignore
/// let state = AppState::builder()
///     .config(config)
///     .kernel(Arc::new(TruckKernel::new()))
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub kernel: Arc<dyn GeometryKernel>,
    /// None when conversions are not limited.
    pub conversion_limiter: Option<Arc<ConversionLimiter>>,
}

impl AppState {
    /// State with the limiter derived from `config.limits`.
    pub fn new(config: Config, kernel: Arc<dyn GeometryKernel>) -> Self {
        AppState::builder()
            .maybe_conversion_limiter(ConversionLimiter::new(&config.limits).map(Arc::new))
            .config(config)
            .kernel(kernel)
            .build()
    }
}

/// Create CORS layer from configuration
fn create_cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let cors_config = &config.cors;

    // A wildcard anywhere in the list opens the gateway to every origin.
    let allow_origin = if cors_config.allowed_origins.iter().any(|o| matches!(o, CorsOrigin::Wildcard)) {
        AllowOrigin::any()
    } else {
        let mut origins = Vec::new();
        for origin in &cors_config.allowed_origins {
            if let CorsOrigin::Url(url) = origin {
                origins.push(url.as_str().trim_end_matches('/').parse::<HeaderValue>()?);
            }
        }
        AllowOrigin::list(origins)
    };

    let mut cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(vec![http::header::CONTENT_TYPE]);

    if let Some(max_age) = cors_config.max_age {
        cors = cors.max_age(std::time::Duration::from_secs(max_age));
    }

    Ok(cors)
}

fn upload_body_limit(max_file_size: u64) -> DefaultBodyLimit {
    let limit = usize::try_from(max_file_size.saturating_add(MULTIPART_OVERHEAD)).unwrap_or(usize::MAX);
    DefaultBodyLimit::max(limit)
}

/// Build the router: the enabled upload routes, health and documentation endpoints, optional
/// Prometheus metrics, CORS and request tracing.
#[instrument(skip_all)]
pub fn build_router(state: &AppState) -> anyhow::Result<Router> {
    let routes = &state.config.routes;
    let body_limit = upload_body_limit(state.config.uploads.max_file_size);

    let mut uploads = Router::new();
    if routes.step_only.enabled {
        debug!(path = %routes.step_only.path, "Mounting STEP-only upload route");
        uploads = uploads.route(
            &routes.step_only.path,
            post(api::handlers::conversions::upload_step).layer(body_limit.clone()),
        );
    }
    if routes.multi_format.enabled {
        debug!(path = %routes.multi_format.path, "Mounting multi-format upload route");
        uploads = uploads.route(
            &routes.multi_format.path,
            post(api::handlers::conversions::convert_upload).layer(body_limit.clone()),
        );
    }
    if routes.mesh.enabled {
        debug!(path = %routes.mesh.path, "Mounting mesh export route");
        uploads = uploads.route(
            &routes.mesh.path,
            post(api::handlers::conversions::convert_mesh).layer(body_limit),
        );
    }

    let router = Router::new()
        .route("/healthz", get(|| async { "OK" }))
        .route("/api-docs/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .merge(uploads)
        .with_state(state.clone())
        .merge(Scalar::with_url("/docs", ApiDoc::openapi()));

    let mut router = router.layer(create_cors_layer(&state.config)?);

    if state.config.enable_metrics {
        let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

        router = router
            .route("/internal/metrics", get(|| async move { metric_handle.render() }))
            .layer(prometheus_layer);
    }

    let router = router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    Ok(router)
}

pub struct Application {
    router: Router,
    config: Config,
}

impl Application {
    /// Create a new application backed by [`TruckKernel`].
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        Self::with_kernel(config, Arc::new(TruckKernel::new())).await
    }

    /// Create a new application with an explicit geometry kernel.
    pub async fn with_kernel(config: Config, kernel: Arc<dyn GeometryKernel>) -> anyhow::Result<Self> {
        debug!("Starting gateway with configuration: {:#?}", config);

        if let Some(dir) = &config.uploads.temp_dir {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to create upload directory {}: {}", dir.display(), e))?;
        }

        let state = AppState::new(config.clone(), kernel);
        let router = build_router(&state)?;

        Ok(Self { router, config })
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> axum_test::TestServer {
        axum_test::TestServer::new(self.router).expect("Failed to create test server")
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "Upload gateway listening on http://{}, available at http://localhost:{}",
            bind_addr,
            listener.local_addr()?.port()
        );

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}
