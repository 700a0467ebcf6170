//! Gateway configuration.
//!
//! Loaded from a TOML file with three sections. Every field has a default,
//! so an empty file is a valid configuration:
//!
//! ```toml
//! [worker]
//! storage_dir = "./evidence_vault"
//! max_batch_size = 50
//! batch_timeout_ms = 2000
//! poll_interval_ms = 100
//! queue_capacity = 10000
//! stop_timeout_ms = 10000
//!
//! [signing]
//! enabled = true
//! key_dir = "./keys"
//! key_id = "default"
//!
//! [server]
//! listen_addr = "127.0.0.1:8000"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use epi_core::trust::KeyId;
use serde::{Deserialize, Serialize};

use crate::worker::{WorkerConfig, DEFAULT_MAX_BATCH_SIZE, DEFAULT_QUEUE_CAPACITY};

/// Top-level gateway configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Worker batching and storage.
    #[serde(default)]
    pub worker: WorkerSection,

    /// Batch signing.
    #[serde(default)]
    pub signing: SigningSection,

    /// HTTP listener.
    #[serde(default)]
    pub server: ServerSection,
}

impl GatewayConfig {
    /// Loads and validates configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses and validates configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid, names an unknown field, or
    /// fails [`GatewayConfig::validate`].
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes the configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Rejects values the worker cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let worker = &self.worker;
        for (field, value) in [
            ("worker.max_batch_size", worker.max_batch_size as u64),
            ("worker.batch_timeout_ms", worker.batch_timeout_ms),
            ("worker.poll_interval_ms", worker.poll_interval_ms),
            ("worker.queue_capacity", worker.queue_capacity as u64),
            ("worker.stop_timeout_ms", worker.stop_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!("{field} must be greater than zero")));
            }
        }
        if worker.storage_dir.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "worker.storage_dir must not be empty".to_string(),
            ));
        }
        if self.signing.enabled {
            KeyId::new(self.signing.key_id.as_str())
                .map_err(|err| ConfigError::Validation(format!("signing.key_id: {err}")))?;
        }
        Ok(())
    }
}

/// `[worker]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerSection {
    /// Directory batch files are written to.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Events per batch.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Maximum age of a non-empty buffer, in milliseconds.
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,

    /// Consumer poll interval, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Bounded queue capacity.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Bound on the shutdown drain, in milliseconds.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

impl WorkerSection {
    /// Converts to the worker's runtime configuration.
    #[must_use]
    pub const fn to_worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            max_batch_size: self.max_batch_size,
            batch_timeout: Duration::from_millis(self.batch_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            queue_capacity: self.queue_capacity,
            stop_timeout: Duration::from_millis(self.stop_timeout_ms),
        }
    }
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            max_batch_size: default_max_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            queue_capacity: default_queue_capacity(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

/// `[signing]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SigningSection {
    /// Sign every batch.
    #[serde(default = "default_signing_enabled")]
    pub enabled: bool,

    /// Key store directory; a key is generated there on first start.
    #[serde(default = "default_key_dir")]
    pub key_dir: PathBuf,

    /// Key id within the store.
    #[serde(default = "default_key_id")]
    pub key_id: String,
}

impl Default for SigningSection {
    fn default() -> Self {
        Self {
            enabled: default_signing_enabled(),
            key_dir: default_key_dir(),
            key_id: default_key_id(),
        }
    }
}

/// `[server]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    /// Address the HTTP listener binds.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("./evidence_vault")
}

const fn default_max_batch_size() -> usize {
    DEFAULT_MAX_BATCH_SIZE
}

const fn default_batch_timeout_ms() -> u64 {
    2_000
}

const fn default_poll_interval_ms() -> u64 {
    100
}

const fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

const fn default_stop_timeout_ms() -> u64 {
    10_000
}

const fn default_signing_enabled() -> bool {
    true
}

fn default_key_dir() -> PathBuf {
    PathBuf::from("./keys")
}

fn default_key_id() -> String {
    "default".to_string()
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8000))
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// I/O error reading the configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{DEFAULT_BATCH_TIMEOUT, DEFAULT_POLL_INTERVAL, DEFAULT_STOP_TIMEOUT};

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = GatewayConfig::from_toml("").unwrap();
        assert_eq!(config, GatewayConfig::default());
        assert_eq!(config.worker.max_batch_size, 50);
        assert_eq!(config.worker.queue_capacity, 10_000);
        assert!(config.signing.enabled);
        assert_eq!(config.server.listen_addr.to_string(), "127.0.0.1:8000");
    }

    #[test]
    fn test_worker_defaults_match_runtime_defaults() {
        let worker = WorkerSection::default().to_worker_config();
        assert_eq!(worker, WorkerConfig::default());
        assert_eq!(worker.batch_timeout, DEFAULT_BATCH_TIMEOUT);
        assert_eq!(worker.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(worker.stop_timeout, DEFAULT_STOP_TIMEOUT);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [worker]
            storage_dir = "/var/lib/epi/vault"
            max_batch_size = 10
            batch_timeout_ms = 500
            poll_interval_ms = 20
            queue_capacity = 64
            stop_timeout_ms = 3000

            [signing]
            enabled = false
            key_dir = "/etc/epi/keys"
            key_id = "gateway-1"

            [server]
            listen_addr = "0.0.0.0:9000"
        "#;

        let config = GatewayConfig::from_toml(toml).unwrap();
        assert_eq!(config.worker.storage_dir, PathBuf::from("/var/lib/epi/vault"));
        assert_eq!(config.worker.max_batch_size, 10);
        assert_eq!(
            config.worker.to_worker_config().batch_timeout,
            Duration::from_millis(500)
        );
        assert!(!config.signing.enabled);
        assert_eq!(config.signing.key_id, "gateway-1");
        assert_eq!(config.server.listen_addr.port(), 9000);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config = GatewayConfig::from_toml("[worker]\nmax_batch_size = 5\n").unwrap();
        assert_eq!(config.worker.max_batch_size, 5);
        assert_eq!(config.worker.batch_timeout_ms, 2_000);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = GatewayConfig::from_toml("[worker]\nbatch_size = 5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)), "{err:?}");

        let err = GatewayConfig::from_toml("[metrics]\nenabled = true\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)), "{err:?}");
    }

    #[test]
    fn test_zero_values_rejected() {
        for field in [
            "max_batch_size",
            "batch_timeout_ms",
            "poll_interval_ms",
            "queue_capacity",
            "stop_timeout_ms",
        ] {
            let err = GatewayConfig::from_toml(&format!("[worker]\n{field} = 0\n")).unwrap_err();
            match err {
                ConfigError::Validation(msg) => assert!(msg.contains(field), "{msg}"),
                other => panic!("expected validation error for {field}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_invalid_key_id_rejected_only_when_signing() {
        let err =
            GatewayConfig::from_toml("[signing]\nkey_id = \"../escape\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));

        let config =
            GatewayConfig::from_toml("[signing]\nenabled = false\nkey_id = \"../escape\"\n");
        assert!(config.is_ok());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = GatewayConfig::default();
        let text = config.to_toml().unwrap();
        assert_eq!(GatewayConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, "[server]\nlisten_addr = \"127.0.0.1:0\"\n").unwrap();
        let config = GatewayConfig::from_file(&path).unwrap();
        assert_eq!(config.server.listen_addr.port(), 0);

        assert!(matches!(
            GatewayConfig::from_file(&dir.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
