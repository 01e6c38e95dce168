//! ---
//! mpipe_section: "01-core-functionality"
//! mpipe_subsection: "module"
//! mpipe_type: "source"
//! mpipe_scope: "code"
//! mpipe_description: "Shared primitives and utilities for the pipeline runtime."
//! mpipe_version: "v0.0.0-prealpha"
//! mpipe_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_namespace() -> String {
    "system".to_owned()
}

fn default_topic_prefix() -> String {
    "metrics".to_owned()
}

const fn default_topic_count() -> usize {
    4
}

const fn default_queue_size() -> usize {
    10_000
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_process_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

/// Primary configuration object for the M-PIPE runtime.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Processor tuning block.
    #[serde(default)]
    pub processor: ProcessorConfig,
    /// Logging configuration block.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "M_PIPE_CONFIG";

    /// Load configuration from disk, respecting the `M_PIPE_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("unable to read configuration {}", path.display()))?;
        let config: AppConfig = toml::from_str(&raw)
            .with_context(|| format!("unable to parse configuration {}", path.display()))?;
        config.validate()?;
        debug!(source = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Validate cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        self.processor.validate()
    }
}

/// Tuning values for the metrics processor service.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Namespace the metrics topics live in.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Name prefix shared by all metrics topics; topic `i` is named `{prefix}{i}`.
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    /// Number of metrics topics to consume.
    #[serde(default = "default_topic_count")]
    pub topic_count: usize,
    /// Total capacity of the shared record buffer.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Maximum tolerated lag between a record's timestamp and its persistence
    /// before consumers skip their inter-cycle sleep.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_max_delay", rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// Sleep interval between fetch cycles of a topic consumer.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_process_interval", rename = "process_interval_ms")]
    pub process_interval: Duration,
    /// Context tags stamped onto the pipeline's self-observability records.
    #[serde(default)]
    pub context_tags: IndexMap<String, String>,
}

impl ProcessorConfig {
    /// Per-topic fetch limit so one topic cannot monopolise the shared buffer.
    pub fn fetch_limit(&self) -> usize {
        (self.queue_size / self.topic_count.max(1)).max(1)
    }

    fn validate(&self) -> Result<()> {
        if self.topic_prefix.trim().is_empty() {
            return Err(anyhow!("processor.topic_prefix must not be empty"));
        }
        if self.topic_count == 0 {
            return Err(anyhow!("processor.topic_count must be at least 1"));
        }
        if self.queue_size == 0 {
            return Err(anyhow!("processor.queue_size must be at least 1"));
        }
        Ok(())
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            topic_prefix: default_topic_prefix(),
            topic_count: default_topic_count(),
            queue_size: default_queue_size(),
            max_delay: default_max_delay(),
            process_interval: default_process_interval(),
            context_tags: IndexMap::new(),
        }
    }
}

/// Logging configuration consumed by [`crate::logging::init_tracing`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory receiving the rolling daily log file.
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    /// Optional file prefix; defaults to the service name.
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Stdout format.
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            file_prefix: None,
            format: default_log_format(),
        }
    }
}
