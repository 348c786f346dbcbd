//! Configuration loading and validation
//!
//! Uses a fallback chain for config files and sensible defaults everywhere:
//! 1. Explicit --config path
//! 2. Project-local .gendaemon.yml
//! 3. User config: ~/.config/gendaemon/gendaemon.yml
//! 4. Built-in defaults

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker loop configuration
    pub worker: WorkerConfig,

    /// Generation provider configuration
    pub provider: ProviderConfig,

    /// Admission controller configuration
    pub admission: AdmissionConfig,

    /// Object storage configuration
    pub storage: StorageConfig,

    /// Task store configuration
    pub store: StoreConfig,
}

impl Config {
    /// Validate configuration before use
    ///
    /// Call this early in startup to fail fast with clear error messages.
    pub fn validate(&self) -> Result<()> {
        if std::env::var(&self.provider.api_key_env).is_err() {
            return Err(eyre::eyre!(
                "Provider API key not found. Set the {} environment variable.",
                self.provider.api_key_env
            ));
        }
        if self.admission.max_concurrent == 0 {
            return Err(eyre::eyre!("admission.max-concurrent must be at least 1"));
        }
        if self.worker.pending_batch_size == 0 || self.worker.active_batch_size == 0 {
            return Err(eyre::eyre!("worker batch sizes must be at least 1"));
        }
        if self.worker.task_timeout_minutes == 0 {
            return Err(eyre::eyre!("worker.task-timeout-minutes must be at least 1"));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .gendaemon.yml
        let local_config = PathBuf::from(".gendaemon.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/gendaemon/gendaemon.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("gendaemon").join("gendaemon.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Worker loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Seconds between worker iterations
    #[serde(rename = "poll-interval-secs")]
    pub poll_interval_secs: u64,

    /// Minutes an active task may go without progress before TIMEOUT
    #[serde(rename = "task-timeout-minutes")]
    pub task_timeout_minutes: u32,

    /// Maximum PENDING tasks submitted per iteration
    #[serde(rename = "pending-batch-size")]
    pub pending_batch_size: u32,

    /// Maximum active tasks polled per iteration
    #[serde(rename = "active-batch-size")]
    pub active_batch_size: u32,

    /// Consecutive iteration failures before component reinitialization
    #[serde(rename = "max-consecutive-errors")]
    pub max_consecutive_errors: u32,

    /// Seconds to wait after reinitialization before resuming
    #[serde(rename = "recovery-wait-secs")]
    pub recovery_wait_secs: u64,

    /// Ceiling on the per-error backoff between iterations
    #[serde(rename = "error-backoff-cap-secs")]
    pub error_backoff_cap_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 20,
            task_timeout_minutes: 30,
            pending_batch_size: 5,
            active_batch_size: 50,
            max_consecutive_errors: 10,
            recovery_wait_secs: 60,
            error_backoff_cap_secs: 30,
        }
    }
}

/// Generation provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// API base URL
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// RunningHub webapp identifier
    #[serde(rename = "webapp-id")]
    pub webapp_id: String,

    /// Workflow node receiving the prompt text
    #[serde(rename = "prompt-node-id")]
    pub prompt_node_id: String,

    /// Workflow node receiving the aspect-ratio preset
    #[serde(rename = "ratio-node-id")]
    pub ratio_node_id: String,

    /// Workflow node whose output carries the final image
    #[serde(rename = "output-node-id")]
    pub output_node_id: String,

    /// Seconds between provider status polls
    #[serde(rename = "poll-interval-secs")]
    pub poll_interval_secs: u64,

    /// Ceiling in seconds on one full generation round-trip
    #[serde(rename = "generate-timeout-secs")]
    pub generate_timeout_secs: u64,

    /// Submission attempts before a queue-full rejection becomes fatal
    #[serde(rename = "submit-max-attempts")]
    pub submit_max_attempts: u32,

    /// Base delay in seconds for queue-full submission backoff
    #[serde(rename = "submit-base-delay-secs")]
    pub submit_base_delay_secs: u64,

    /// Attempts per status poll before a transient error becomes fatal
    #[serde(rename = "poll-max-attempts")]
    pub poll_max_attempts: u32,

    /// HTTP request timeout in milliseconds
    #[serde(rename = "request-timeout-ms")]
    pub request_timeout_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.runninghub.cn".to_string(),
            api_key_env: "RUNNINGHUB_API_KEY".to_string(),
            webapp_id: "1970112024036450306".to_string(),
            prompt_node_id: "6".to_string(),
            ratio_node_id: "31".to_string(),
            output_node_id: "9".to_string(),
            poll_interval_secs: 5,
            generate_timeout_secs: 300,
            submit_max_attempts: 4,
            submit_base_delay_secs: 5,
            poll_max_attempts: 3,
            request_timeout_ms: 30_000,
        }
    }
}

/// Admission controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Maximum generation requests in flight against the provider
    #[serde(rename = "max-concurrent")]
    pub max_concurrent: usize,

    /// Seconds between admission-slot wait attempts
    #[serde(rename = "wait-poll-secs")]
    pub wait_poll_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            wait_poll_secs: 2,
        }
    }
}

/// Object storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage API endpoint
    pub endpoint: String,

    /// Bucket holding generated assets
    pub bucket: String,

    /// Public base URL objects are served from
    #[serde(rename = "cdn-base-url")]
    pub cdn_base_url: String,

    /// Environment variable holding an optional bearer token
    #[serde(rename = "auth-token-env")]
    pub auth_token_env: Option<String>,

    /// HTTP request timeout in milliseconds
    #[serde(rename = "request-timeout-ms")]
    pub request_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9000".to_string(),
            bucket: "drama-assets".to_string(),
            cdn_base_url: "http://localhost:9000/drama-assets".to_string(),
            auth_token_env: None,
            request_timeout_ms: 60_000,
        }
    }
}

/// Task store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database path
    #[serde(rename = "db-path")]
    pub db_path: PathBuf,

    /// Days a terminal task is kept before cleanup
    #[serde(rename = "max-age-days")]
    pub max_age_days: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("gendaemon.db"),
            max_age_days: 30,
        }
    }
}
