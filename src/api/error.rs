//! Unified API error handling with structured responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::auth::TokenError;
use crate::segmentation::SegmentError;

/// API error type with structured responses.
///
/// Messages are safe to show to clients; server-side detail is logged where
/// the error is created.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("{0}")]
    Busy(String),

    #[error("{0}")]
    Decode(String),

    #[error("{0}")]
    Pipeline(String),

    #[error("{0}")]
    Filesystem(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub(crate) fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Busy(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Decode(_) | Self::Pipeline(_) | Self::Filesystem(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub(crate) fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            Self::Busy(_) => "BUSY",
            Self::Decode(_) => "DECODE_ERROR",
            Self::Pipeline(_) => "PIPELINE_ERROR",
            Self::Filesystem(_) => "FILESYSTEM_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Structured error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        match status {
            StatusCode::INTERNAL_SERVER_ERROR => {
                error!(error_code = code, message = %message, "API error");
            }
            StatusCode::SERVICE_UNAVAILABLE => {
                warn!(error_code = code, message = %message, "Service unavailable");
            }
            _ => {
                debug!(error_code = code, message = %message, "Client error");
            }
        }

        let body = ErrorResponse {
            error: message,
            code,
        };

        (status, Json(body)).into_response()
    }
}

/// Full detail goes to the log; the client gets a fixed message per kind.
impl From<SegmentError> for ApiError {
    fn from(err: SegmentError) -> Self {
        match &err {
            SegmentError::Busy => {}
            other => error!(error_code = other.code(), "Segmentation failed: {}", other),
        }
        match err {
            SegmentError::Busy => {
                ApiError::Busy("Segmentation capacity exhausted, retry later".to_string())
            }
            SegmentError::Decode(_) => {
                ApiError::Decode("Uploaded file is not a readable NIfTI image".to_string())
            }
            SegmentError::Pipeline(_) => {
                ApiError::Pipeline("Segmentation pipeline failed".to_string())
            }
            SegmentError::Filesystem(_) => {
                ApiError::Filesystem("Server storage error".to_string())
            }
            SegmentError::Internal(_) => ApiError::Internal("Internal server error".to_string()),
        }
    }
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Missing => ApiError::forbidden("Download token required"),
            TokenError::Expired => ApiError::forbidden("Download token has expired"),
            TokenError::Invalid(_) | TokenError::WrongSession => {
                ApiError::forbidden("Invalid download token")
            }
            TokenError::Signing(msg) => {
                error!("Failed to sign download token: {}", msg);
                ApiError::internal("Internal server error")
            }
        }
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::CodecError;
    use crate::pipeline::PipelineError;

    #[test]
    fn test_error_response_status_codes() {
        assert_eq!(ApiError::not_found("").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::bad_request("").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::forbidden("").status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            ApiError::internal("").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_segment_errors_keep_their_kind() {
        let cases = [
            (SegmentError::Busy, StatusCode::SERVICE_UNAVAILABLE, "BUSY"),
            (
                SegmentError::Decode(CodecError::not_nifti("bad magic")),
                StatusCode::INTERNAL_SERVER_ERROR,
                "DECODE_ERROR",
            ),
            (
                SegmentError::Pipeline(PipelineError::Failed {
                    status: "exit status: 1".into(),
                    stderr: "CUDA out of memory".into(),
                }),
                StatusCode::INTERNAL_SERVER_ERROR,
                "PIPELINE_ERROR",
            ),
            (
                SegmentError::Filesystem("/tmp/segserver: permission denied".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
                "FILESYSTEM_ERROR",
            ),
        ];

        for (err, status, code) in cases {
            let api = ApiError::from(err);
            assert_eq!(api.status_code(), status);
            assert_eq!(api.error_code(), code);
        }
    }

    #[test]
    fn test_segment_error_messages_are_sanitized() {
        let api = ApiError::from(SegmentError::Pipeline(PipelineError::Failed {
            status: "exit status: 1".into(),
            stderr: "Traceback: /opt/models/secret/path.py".into(),
        }));
        assert!(!api.to_string().contains("/opt"));

        let api = ApiError::from(SegmentError::Filesystem("/tmp/segserver/abc".into()));
        assert!(!api.to_string().contains("/tmp"));
    }

    #[test]
    fn test_token_errors_are_forbidden() {
        for err in [
            TokenError::Missing,
            TokenError::Expired,
            TokenError::WrongSession,
            TokenError::Invalid("bad signature".into()),
        ] {
            assert_eq!(ApiError::from(err).status_code(), StatusCode::FORBIDDEN);
        }
    }
}
