//! Response bodies written by the upload endpoints.
//!
//! Errors share [`crate::errors::ErrorResponse`].

pub mod conversions;
