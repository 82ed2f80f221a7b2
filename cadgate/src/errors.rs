use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;
use utoipa::ToSchema;

use crate::kernel::KernelError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Upload suffix is not in the dispatch table
    #[error("Unsupported file format: {extension}")]
    UnsupportedFormat { extension: String },

    /// Upload suffix is recognized but conversion is not available
    #[error("{format} format support is not yet implemented")]
    UnimplementedFormat { format: &'static str },

    /// The geometry kernel rejected the file content
    #[error("{message}")]
    KernelRead { message: String },

    /// Meshing or topology traversal failed inside the geometry kernel
    #[error("{message}")]
    KernelProcessing { message: String },

    /// Writing the transient upload copy failed
    #[error("Failed to store upload: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed multipart body or missing file field
    #[error("{message}")]
    BadRequest { message: String },

    /// Upload exceeds the configured size limit
    #[error("{message}")]
    PayloadTooLarge { message: String },

    /// No conversion slot became available
    #[error("{message}")]
    TooManyRequests { message: String },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },
}

/// Body written for every error response.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Human-readable description of what went wrong
    pub error: String,
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::UnsupportedFormat { .. }
            | Error::UnimplementedFormat { .. }
            | Error::KernelRead { .. }
            | Error::KernelProcessing { .. }
            | Error::Io(_)
            | Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    /// Message written to the response body.
    ///
    /// Conversion failures carry the kernel's own message so callers can tell a corrupt file from
    /// an unsupported one. I/O causes stay in the log since they name server paths.
    pub fn user_message(&self) -> String {
        match self {
            Error::Io(_) => "Failed to store upload".to_string(),
            Error::Internal { .. } => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details for debugging - different log levels based on severity
        match &self {
            Error::Io(_) | Error::Internal { .. } | Error::KernelProcessing { .. } => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::KernelRead { .. } | Error::TooManyRequests { .. } => {
                tracing::warn!("Conversion rejected: {}", self);
            }
            Error::UnsupportedFormat { .. }
            | Error::UnimplementedFormat { .. }
            | Error::BadRequest { .. }
            | Error::PayloadTooLarge { .. } => {
                tracing::debug!("Client error: {}", self);
            }
        }

        let status = self.status_code();
        let body = ErrorResponse {
            error: self.user_message(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<KernelError> for Error {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::Read(message) => Error::KernelRead { message },
            KernelError::Processing(message) => Error::KernelProcessing { message },
        }
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;
