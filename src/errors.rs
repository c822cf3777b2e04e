use std::path::PathBuf;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Boxed error source that can cross the blocking-pool boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Structured error types for the segmentation server.
///
/// `Validation` is the only client-facing variant: it carries the offending
/// field so the HTTP layer can report it the way schema validators do.
/// Every other variant is an internal failure and surfaces as a 500.
#[derive(Error, Debug)]
pub enum InstanSegError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Image processing error: {operation} failed (file: {path})")]
    ImageProcessing {
        path: String,
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Model error: {operation} failed")]
    Model {
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Server error: {operation} failed")]
    Server {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },
}

pub type Result<T> = std::result::Result<T, InstanSegError>;

impl InstanSegError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Model error without an underlying library error.
    pub fn model(operation: impl Into<String>, message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self::Model {
            operation: operation.into(),
            source: message.into(),
        }
    }

    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}

impl IntoResponse for InstanSegError {
    fn into_response(self) -> Response {
        match self {
            Self::Validation { field, reason } => {
                let body = json!({
                    "detail": [{
                        "loc": ["body", field],
                        "msg": reason,
                        "type": "value_error",
                    }]
                });
                (StatusCode::UNPROCESSABLE_ENTITY, Json(body)).into_response()
            }
            err => {
                tracing::error!(error = ?err, "request failed");
                let body = json!({ "detail": "Internal Server Error" });
                (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
            }
        }
    }
}

/// Convert I/O errors to filesystem errors.
///
/// Code that knows the path and operation should build
/// `InstanSegError::FileSystem` itself.
impl From<std::io::Error> for InstanSegError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<image::ImageError> for InstanSegError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageProcessing {
            path: "unknown".to_string(),
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<ort::Error> for InstanSegError {
    fn from(err: ort::Error) -> Self {
        Self::Model {
            operation: "ort operation".to_string(),
            source: Box::new(err),
        }
    }
}

/// Shape errors come out of tensor reshaping around inference, so they are
/// reported as model errors.
impl From<ndarray::ShapeError> for InstanSegError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Model {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_maps_to_unprocessable_entity() {
        let response = InstanSegError::validation("pixel_size", "out of range").into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_internal_errors_map_to_server_error() {
        let response = InstanSegError::model("inference", "boom").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let response = InstanSegError::from(io).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_display_names_field() {
        let err = InstanSegError::validation("model_name", "is not a known model");
        assert_eq!(
            err.to_string(),
            "Validation error: model_name is not a known model"
        );
        assert!(err.is_validation());
    }
}
