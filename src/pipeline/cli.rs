//! TotalSegmentator child-process backend.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{PipelineError, SegmentationPipeline, SegmentationRequest};
use crate::config::PipelineConfig;
use crate::imaging::{self, VolumeImage};

/// Scratch file the model writes its multilabel result to.
pub const PIPELINE_OUTPUT_FILE: &str = "pipeline_output.nii";

const PIPELINE_INPUT_FILE: &str = "pipeline_input.nii";
const STDERR_TAIL_BYTES: usize = 4096;

/// Runs the `TotalSegmentator` command line tool.
#[derive(Debug, Clone)]
pub struct TotalSegmentatorCli {
    executable: PathBuf,
    device: Option<String>,
    extra_args: Vec<String>,
}

impl TotalSegmentatorCli {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            device: None,
            extra_args: Vec::new(),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            executable: PathBuf::from(&config.executable),
            device: config.device.clone(),
            extra_args: config.extra_args.clone(),
        }
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    fn args(&self, input: &Path, output: &Path, request: &SegmentationRequest) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            input.display().to_string(),
            "-o".to_string(),
            output.display().to_string(),
            "--task".to_string(),
            request.task.as_str().to_string(),
            "--ml".to_string(),
        ];
        if request.fast {
            args.push("--fast".to_string());
        }
        if let Some(ref device) = self.device {
            args.push("--device".to_string());
            args.push(device.clone());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

#[async_trait]
impl SegmentationPipeline for TotalSegmentatorCli {
    async fn run(
        &self,
        input: &VolumeImage,
        request: &SegmentationRequest,
    ) -> Result<VolumeImage, PipelineError> {
        // The model reads from disk; reuse the loaded file when there is one.
        let (input_path, scratch_input) = match input.source() {
            Some(path) => (path.to_path_buf(), None),
            None => {
                let path = request.work_dir.join(PIPELINE_INPUT_FILE);
                fs::write(&path, input.as_bytes())
                    .await
                    .map_err(PipelineError::Io)?;
                (path.clone(), Some(path))
            }
        };
        let output_path = request.work_dir.join(PIPELINE_OUTPUT_FILE);
        let args = self.args(&input_path, &output_path, request);

        info!(
            task = %request.task,
            fast = request.fast,
            "Running {}",
            self.executable.display()
        );
        debug!("Pipeline arguments: {:?}", args);

        let result = Command::new(&self.executable)
            .args(&args)
            .current_dir(&request.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        if let Some(path) = scratch_input {
            if let Err(e) = fs::remove_file(&path).await {
                warn!("Failed to remove pipeline input {}: {}", path.display(), e);
            }
        }

        let output = result.map_err(PipelineError::Unavailable)?;
        if !output.status.success() {
            return Err(PipelineError::Failed {
                status: output.status.to_string(),
                stderr: stderr_tail(&output.stderr),
            });
        }

        let load_path = output_path.clone();
        let image = tokio::task::spawn_blocking(move || imaging::load(&load_path))
            .await
            .map_err(|e| PipelineError::Aborted(e.to_string()))??;

        if let Err(e) = fs::remove_file(&output_path).await {
            warn!("Failed to remove pipeline output {}: {}", output_path.display(), e);
        }

        Ok(image.into_detached())
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}
