//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_PIPELINE__WORKERS`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Nested keys are separated by a double underscore so that field names
//! containing `_` survive: `APP_PIPELINE__QUEUE_CAPACITY=50` sets
//! `pipeline.queue_capacity`. List values are comma separated:
//! `APP_MODELS__DEVICES=cuda:0,cuda:1`.

use crate::device::DeviceSpec;
use crate::transcription::whisper::ModelSize;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each section maps to one component (HTTP server, model registry, job
/// pipeline, artifact storage, result retention, sweeper, API behaviour), so a
/// component only ever needs to look at its own section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub pipeline: PipelineConfig,
    pub storage: StorageConfig,
    pub results: ResultsConfig,
    pub cleanup: CleanupConfig,
    pub api: ApiConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Speech model configuration.
///
/// ## Fields:
/// - `whisper_model`: "tiny", "base", "small", "medium" or "large"
/// - `devices`: one model instance is created per entry ("cpu", "cuda:0", "metal", "auto")
/// - `preload`: load every instance at startup instead of on first use
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub whisper_model: String,
    pub devices: Vec<String>,
    pub preload: bool,
}

/// Job pipeline tuning. All durations are milliseconds.
///
/// ## Tuning guidelines:
/// - `workers` cannot exceed the number of devices; extra workers would only wait
/// - `enqueue_timeout_ms = 0` rejects uploads immediately when the queue is full
/// - `inference_timeout_ms` bounds one job's model time, not its queue wait
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub enqueue_timeout_ms: u64,
    pub checkout_timeout_ms: u64,
    pub inference_timeout_ms: u64,
    /// How long a timed-out inference gets to notice the abort flag
    pub abort_grace_ms: u64,
    /// How often idle workers wake up to check for shutdown
    pub dequeue_poll_ms: u64,
    pub shutdown_grace_secs: u64,
}

/// Uploaded audio storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub upload_dir: String,
    pub max_artifact_bytes: u64,
    pub artifact_ttl_secs: u64,
    pub allowed_extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsConfig {
    /// Retention after the outcome is written
    pub ttl_secs: u64,
}

/// Background sweeper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    pub interval_secs: u64,
    /// A job `Running` for longer than this is considered lost
    pub stale_job_secs: u64,
}

/// How `POST /transcribe` answers when the client does not say.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    /// 202 with a job id straight away
    Poll,
    /// Hold the request open until the result is ready (bounded)
    Wait,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub default_mode: ResponseMode,
    pub wait_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            models: ModelsConfig {
                whisper_model: "small".to_string(),
                devices: vec!["cpu".to_string()],
                preload: false,
            },
            pipeline: PipelineConfig {
                workers: 1,
                queue_capacity: 100,
                enqueue_timeout_ms: 1_000,
                checkout_timeout_ms: 30_000,
                inference_timeout_ms: 600_000, // 10 minutes per job
                abort_grace_ms: 5_000,
                dequeue_poll_ms: 1_000,
                shutdown_grace_secs: 30,
            },
            storage: StorageConfig {
                upload_dir: "temp_uploads".to_string(),
                max_artifact_bytes: 500 * 1024 * 1024, // 500MB
                artifact_ttl_secs: 3_600,
                allowed_extensions: [".mp3", ".wav", ".m4a", ".flac", ".ogg"]
                    .iter()
                    .map(|ext| ext.to_string())
                    .collect(),
            },
            results: ResultsConfig { ttl_secs: 3_600 },
            cleanup: CleanupConfig {
                interval_secs: 60,
                stale_job_secs: 900,
            },
            api: ApiConfig {
                default_mode: ResponseMode::Poll,
                wait_timeout_secs: 300,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_MODELS__WHISPER_MODEL=medium`: Override whisper model
    /// - `APP_MODELS__DEVICES=cuda:0,cuda:1`: Two GPU model instances
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("models.devices")
                    .with_list_parse_key("storage.allowed_extensions")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense together.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - The model size and every device entry parse
    /// - 1 ≤ workers ≤ devices, queue capacity > 0
    /// - Checkout and inference timeouts are non-zero
    /// - The stale-job threshold exceeds checkout + inference + abort grace, so a
    ///   live worker is never reported lost
    /// - Artifacts outlive the longest a running job can hold them
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }

        self.model_size()?;
        let devices = self.devices()?;
        if devices.is_empty() {
            return Err(anyhow!("At least one model device must be configured"));
        }

        let pipeline = &self.pipeline;
        if pipeline.workers == 0 {
            return Err(anyhow!("Worker count must be greater than 0"));
        }
        if pipeline.workers > devices.len() {
            return Err(anyhow!(
                "Worker count ({}) cannot exceed the number of model devices ({})",
                pipeline.workers,
                devices.len()
            ));
        }
        if pipeline.queue_capacity == 0 {
            return Err(anyhow!("Queue capacity must be greater than 0"));
        }
        if pipeline.checkout_timeout_ms == 0 || pipeline.inference_timeout_ms == 0 {
            return Err(anyhow!("Checkout and inference timeouts must be greater than 0"));
        }
        if pipeline.dequeue_poll_ms == 0 {
            return Err(anyhow!("Dequeue poll interval must be greater than 0"));
        }

        let longest_run = self.longest_job_run();
        if self.stale_after() <= longest_run {
            return Err(anyhow!(
                "cleanup.stale_job_secs ({}s) must exceed checkout + inference + abort grace ({}ms)",
                self.cleanup.stale_job_secs,
                longest_run.as_millis()
            ));
        }
        if self.artifact_ttl() <= longest_run {
            return Err(anyhow!(
                "storage.artifact_ttl_secs ({}s) must exceed checkout + inference + abort grace ({}ms)",
                self.storage.artifact_ttl_secs,
                longest_run.as_millis()
            ));
        }

        if self.storage.upload_dir.trim().is_empty() {
            return Err(anyhow!("Upload directory cannot be empty"));
        }
        if self.storage.max_artifact_bytes == 0 {
            return Err(anyhow!("Maximum upload size must be greater than 0"));
        }
        if self.storage.allowed_extensions.is_empty() {
            return Err(anyhow!("At least one allowed file extension must be configured"));
        }
        if self.cleanup.interval_secs == 0 {
            return Err(anyhow!("Cleanup interval must be greater than 0"));
        }
        if self.results.ttl_secs == 0 {
            return Err(anyhow!("Result TTL must be greater than 0"));
        }

        Ok(())
    }

    pub fn model_size(&self) -> Result<ModelSize> {
        self.models.whisper_model.parse()
    }

    /// Parse the device list, resolving `auto` entries.
    pub fn devices(&self) -> Result<Vec<DeviceSpec>> {
        self.models
            .devices
            .iter()
            .map(|entry| DeviceSpec::resolve(entry).map_err(|e| anyhow!(e)))
            .collect()
    }

    fn longest_job_run(&self) -> Duration {
        Duration::from_millis(
            self.pipeline.checkout_timeout_ms
                + self.pipeline.inference_timeout_ms
                + self.pipeline.abort_grace_ms,
        )
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.cleanup.stale_job_secs)
    }

    pub fn artifact_ttl(&self) -> Duration {
        Duration::from_secs(self.storage.artifact_ttl_secs)
    }

    /// Extension of `filename` (lowercase, with the dot) if it is on the allow list.
    pub fn accepted_extension(&self, filename: &str) -> Option<String> {
        let ext = std::path::Path::new(filename)
            .extension()?
            .to_str()?
            .to_lowercase();
        let ext = format!(".{}", ext);
        self.storage
            .allowed_extensions
            .iter()
            .any(|allowed| allowed.to_lowercase() == ext)
            .then_some(ext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The default configuration is valid and has expected values.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.models.whisper_model, "small");
        assert_eq!(config.storage.max_artifact_bytes, 524_288_000);
        assert_eq!(config.api.default_mode, ResponseMode::Poll);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_workers_cannot_exceed_devices() {
        let mut config = AppConfig::default();
        config.pipeline.workers = 2;
        assert!(config.validate().is_err());

        config.models.devices = vec!["cpu".into(), "cpu".into()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_stale_threshold_must_cover_a_full_run() {
        let mut config = AppConfig::default();
        config.cleanup.stale_job_secs = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_model_and_device_rejected() {
        let mut config = AppConfig::default();
        config.models.whisper_model = "gigantic".into();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.models.devices = vec!["tpu:0".into()];
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.models.devices.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_accepted_extension() {
        let config = AppConfig::default();
        assert_eq!(config.accepted_extension("talk.WAV"), Some(".wav".to_string()));
        assert_eq!(config.accepted_extension("talk.mp3"), Some(".mp3".to_string()));
        assert_eq!(config.accepted_extension("talk.Flac"), Some(".flac".to_string()));
        assert_eq!(config.accepted_extension("notes.txt"), None);
        assert_eq!(config.accepted_extension("no_extension"), None);
    }

    #[test]
    fn test_response_mode_from_string() {
        let mode: ResponseMode = serde_json::from_str("\"wait\"").unwrap();
        assert_eq!(mode, ResponseMode::Wait);
    }
}
