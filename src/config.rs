//! Configuration for ddbctl.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Store connection settings
    #[serde(default)]
    pub aws: AwsConfig,

    /// Conduit sizing and query paging
    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// Tokio runtime settings
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Optional path to save metrics JSON after a run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

/// Store connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,

    /// Endpoint override, e.g. `http://localhost:8000` for DynamoDB Local.
    /// Default: the regional AWS endpoint
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Fixed credentials instead of the default provider chain
    #[serde(default)]
    pub static_credentials: Option<StaticCredentials>,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
            static_credentials: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Pipeline configuration as it appears in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Capacity of the batch-request conduit
    #[serde(default = "default_buffer")]
    pub request_buffer: usize,

    /// Capacity of the batch-result conduit
    #[serde(default = "default_buffer")]
    pub result_buffer: usize,

    /// Items per query page. Unset lets the store decide.
    #[serde(default)]
    pub page_size: Option<u32>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            request_buffer: default_buffer(),
            result_buffer: default_buffer(),
            page_size: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
    Compact,
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            // YAML is a superset of JSON
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.aws.region.trim().is_empty() {
            anyhow::bail!("Region must not be empty");
        }
        if let Some(endpoint) = &self.aws.endpoint_url {
            let host = endpoint
                .strip_prefix("http://")
                .or_else(|| endpoint.strip_prefix("https://"));
            if host.map_or(true, str::is_empty) {
                anyhow::bail!("Endpoint URL must be an http(s) URL, got `{endpoint}`");
            }
        }
        if let Some(credentials) = &self.aws.static_credentials {
            if credentials.access_key_id.is_empty() || credentials.secret_access_key.is_empty() {
                anyhow::bail!("Static credentials must set both access_key_id and secret_access_key");
            }
        }
        if self.pipeline.request_buffer == 0 || self.pipeline.result_buffer == 0 {
            anyhow::bail!("Conduit buffers must be > 0");
        }
        if let Some(page_size) = self.pipeline.page_size {
            if page_size == 0 || page_size > i32::MAX as u32 {
                anyhow::bail!("Page size must be in 1..={}, got {page_size}", i32::MAX);
            }
        }
        if self.runtime.worker_threads == Some(0) {
            anyhow::bail!("Worker threads must be > 0");
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_region() -> String { "us-east-1".to_string() }
fn default_buffer() -> usize { 2 }
fn default_log_level() -> String { "info".to_string() }
