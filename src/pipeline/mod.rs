//! Segmentation pipeline boundary.
//!
//! The model itself is external. This module decides which task to run for a
//! given image type, defines the `SegmentationPipeline` seam, and bounds how
//! many model runs may be in flight.

mod cli;
mod queue;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::imaging::{CodecError, VolumeImage};

pub use cli::{PIPELINE_OUTPUT_FILE, TotalSegmentatorCli};
pub use queue::{Admission, QueueFull, QueueStats, SegmentationQueue};

/// Model configuration to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    /// Whole-body CT model.
    Total,
    /// Whole-body MR model.
    TotalMr,
}

impl Task {
    /// Map a client-supplied modality string to a task.
    ///
    /// `"MR"` in any case selects the MR model; everything else runs the CT
    /// default.
    pub fn from_image_type(image_type: &str) -> Self {
        if image_type.eq_ignore_ascii_case("MR") {
            Task::TotalMr
        } else {
            Task::Total
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Task::Total => "total",
            Task::TotalMr => "total_mr",
        }
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters for one model run.
#[derive(Debug, Clone)]
pub struct SegmentationRequest {
    pub task: Task,
    pub fast: bool,
    /// Directory the pipeline may use for scratch files.
    pub work_dir: PathBuf,
}

/// Errors raised by a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline unavailable: {0}")]
    Unavailable(#[source] std::io::Error),

    #[error("pipeline exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("pipeline timed out after {0:?}")]
    Timeout(Duration),

    #[error("pipeline output unreadable: {0}")]
    Output(#[from] CodecError),

    #[error("pipeline io error: {0}")]
    Io(#[source] std::io::Error),

    #[error("pipeline task aborted: {0}")]
    Aborted(String),
}

/// An external segmentation model.
#[async_trait]
pub trait SegmentationPipeline: Send + Sync {
    /// Segment `input`, returning a multilabel image.
    async fn run(
        &self,
        input: &VolumeImage,
        request: &SegmentationRequest,
    ) -> Result<VolumeImage, PipelineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mr_is_case_insensitive() {
        for value in ["MR", "mr", "Mr", "mR"] {
            assert_eq!(Task::from_image_type(value), Task::TotalMr, "{value}");
        }
    }

    #[test]
    fn test_everything_else_is_ct() {
        for value in ["CT", "ct", "", "MRI", " MR", "PET"] {
            assert_eq!(Task::from_image_type(value), Task::Total, "{value:?}");
        }
    }

    #[test]
    fn test_task_names() {
        assert_eq!(Task::Total.as_str(), "total");
        assert_eq!(Task::TotalMr.to_string(), "total_mr");
        assert_eq!(serde_json::to_value(Task::TotalMr).unwrap(), "total_mr");
    }
}
