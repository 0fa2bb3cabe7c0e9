//! Codec error types.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors raised while reading or writing volumetric images.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Underlying file could not be read or written.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Bytes are not a NIfTI-1 single-file image.
    #[error("not a NIfTI-1 image: {0}")]
    NotNifti(String),

    /// The image has no label table extension.
    #[error("image carries no label table")]
    MissingLabelMap,

    /// A label table extension is present but cannot be parsed.
    #[error("malformed label table: {0}")]
    MalformedLabelMap(String),
}

impl CodecError {
    pub fn not_nifti(msg: impl Into<String>) -> Self {
        Self::NotNifti(msg.into())
    }

    /// Whether the failure came from the filesystem rather than the data.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
