//! OpenAPI document for the upload endpoints.
//!
//! Served as JSON at `/api-docs/openapi.json` and rendered with Scalar at `/docs`.

use utoipa::OpenApi;

use crate::api;
use crate::errors::ErrorResponse;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "cadgate",
        description = "Upload a STEP or STL file and get back the number of faces of its tessellated shape, or the tessellation itself."
    ),
    paths(
        api::handlers::conversions::upload_step,
        api::handlers::conversions::convert_upload,
        api::handlers::conversions::convert_mesh,
    ),
    components(schemas(
        api::models::conversions::ConversionResponse,
        api::models::conversions::ConversionStatus,
        api::models::conversions::MeshResponse,
        ErrorResponse,
    )),
    tags(
        (name = "conversions", description = "CAD upload, face counting and mesh export"),
    )
)]
pub struct ApiDoc;
