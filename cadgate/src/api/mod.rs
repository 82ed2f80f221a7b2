//! HTTP surface of the gateway.
//!
//! - **[`handlers`]**: the upload endpoints
//! - **[`models`]**: response bodies
//!
//! Every endpoint accepts `multipart/form-data` with a single `file` part and answers with a face
//! count, a mesh or an `{"error": ...}` body. They are documented with `utoipa`; the rendered
//! reference is served at `/docs`.

pub mod handlers;
pub mod models;
