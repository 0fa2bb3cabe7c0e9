//! Service configuration.
//!
//! Values are layered: serde defaults, then an optional TOML file, then
//! `SEGSERVER__SECTION__KEY` environment variables. CLI flags are applied on
//! top by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::imaging::DEFAULT_MAX_DECODED_SIZE;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "SEGSERVER";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
    pub download: DownloadConfig,
    pub example: ExampleConfig,
    pub logging: LoggingConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Maximum accepted upload size (in bytes)
    pub max_upload_size: u64,
    /// Maximum uncompressed size of an uploaded scan (in bytes)
    pub max_decoded_size: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            max_upload_size: 512 * 1024 * 1024, // 512 MB
            max_decoded_size: DEFAULT_MAX_DECODED_SIZE,
        }
    }
}

/// Session directory settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory holding one subdirectory per session.
    /// Defaults to `$TMPDIR/segserver`.
    pub root: Option<PathBuf>,
    /// Remove leftover session directories at startup
    pub purge_on_start: bool,
    /// Remove the whole root at shutdown
    pub remove_on_shutdown: bool,
    /// How long a finished result stays on disk
    pub session_ttl_secs: u64,
    /// How often the reaper looks for expired sessions
    pub reap_interval_secs: u64,
    /// Remove a session as soon as its result has been downloaded once
    pub delete_after_download: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: None,
            purge_on_start: true,
            remove_on_shutdown: true,
            session_ttl_secs: 3600,
            reap_interval_secs: 60,
            delete_after_download: false,
        }
    }
}

impl StorageConfig {
    pub fn root_dir(&self) -> PathBuf {
        self.root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("segserver"))
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

/// External segmentation pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// TotalSegmentator executable (name on PATH or absolute path)
    pub executable: String,
    /// Run the lower-resolution fast model
    pub fast: bool,
    /// Device passed through as `--device` (e.g. "gpu", "cpu")
    pub device: Option<String>,
    /// Additional arguments appended verbatim
    pub extra_args: Vec<String>,
    /// Upper bound for a single model run
    pub timeout_secs: u64,
    /// Model runs allowed at the same time
    pub max_concurrent: usize,
    /// Admitted requests allowed to wait for a free slot
    pub max_queued: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            executable: "TotalSegmentator".to_string(),
            fast: true,
            device: None,
            extra_args: Vec::new(),
            timeout_secs: 1800,
            max_concurrent: 1,
            max_queued: 4,
        }
    }
}

impl PipelineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Download capability token settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Require a signed token on download URLs
    pub require_token: bool,
    /// Token lifetime
    pub token_ttl_secs: u64,
    /// HMAC secret; a random one is generated per process when unset
    pub token_secret: Option<String>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            require_token: true,
            token_ttl_secs: 3600,
            token_secret: None,
        }
    }
}

/// Fixed smoke-test input for `GET /example/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExampleConfig {
    pub path: PathBuf,
    pub image_type: String,
}

impl Default for ExampleConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./mri.nii.gz"),
            image_type: "MR".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional TOML file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }

        let built = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("pipeline.extra_args"),
            )
            .build()
            .context("building configuration")?;

        let config: AppConfig = built
            .try_deserialize()
            .context("deserializing configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment layer).
    #[cfg(test)]
    fn from_toml_str(content: &str) -> Result<Self> {
        let config: AppConfig = Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()
            .and_then(|built| built.try_deserialize())
            .context("parsing TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.pipeline.max_concurrent == 0 {
            anyhow::bail!("pipeline.max_concurrent must be at least 1");
        }
        if self.server.max_decoded_size == 0 {
            anyhow::bail!("server.max_decoded_size must be at least 1");
        }
        if self.pipeline.executable.trim().is_empty() {
            anyhow::bail!("pipeline.executable must not be empty");
        }
        Ok(())
    }
}
