//! Axum route handlers.

pub mod conversions;
