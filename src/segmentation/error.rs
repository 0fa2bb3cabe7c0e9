use thiserror::Error;

use crate::imaging::CodecError;
use crate::pipeline::PipelineError;
use crate::session::SessionError;

/// Why a segmentation request failed.
#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("segmentation queue is full")]
    Busy,

    #[error("input decode failed: {0}")]
    Decode(#[source] CodecError),

    #[error("segmentation failed: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SegmentError {
    /// Stable machine-readable tag.
    pub fn code(&self) -> &'static str {
        match self {
            SegmentError::Busy => "BUSY",
            SegmentError::Decode(_) => "DECODE_ERROR",
            SegmentError::Pipeline(_) => "PIPELINE_ERROR",
            SegmentError::Filesystem(_) => "FILESYSTEM_ERROR",
            SegmentError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<CodecError> for SegmentError {
    fn from(err: CodecError) -> Self {
        if err.is_io() {
            SegmentError::Filesystem(err.to_string())
        } else {
            SegmentError::Decode(err)
        }
    }
}

impl From<SessionError> for SegmentError {
    fn from(err: SessionError) -> Self {
        SegmentError::Filesystem(err.to_string())
    }
}

impl From<std::io::Error> for SegmentError {
    fn from(err: std::io::Error) -> Self {
        SegmentError::Filesystem(err.to_string())
    }
}
