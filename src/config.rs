//! # Worker Configuration
//!
//! Identity, capacity and connection tuning for a worker process. Values come
//! from [`WorkerConfig::default`], `DODO_*` environment variables, or a
//! configuration file overlaid with the environment.
//!
//! ```rust,no_run
//! use dodo_core::config::WorkerConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = WorkerConfig::load("config/worker.toml")?;
//! println!("worker {} runs {} tasks at once", config.worker_id, config.max_threads);
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::constants::{DEFAULT_MAX_THREADS, DEFAULT_RECONNECT_INTERVAL_MS};
use crate::error::{DodoError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Identifies this process towards the broker, unique per run
    pub process_id: String,
    /// Stable worker name
    pub worker_id: String,
    /// Where the worker runs, usually `host:port` or a host name
    pub location: String,
    /// Size of the task execution pool
    pub max_threads: usize,
    /// Concurrent task cap per task type
    pub maximum_thread_per_tag: HashMap<String, usize>,
    /// Pause between connection attempts
    pub reconnect_interval_ms: u64,
    /// `host:port` addresses tried in order
    pub broker_addresses: Vec<String>,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Upper bound for flushing the shutdown notice before closing
    pub shutdown_notice_timeout_ms: u64,
    pub shared_secret: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            process_id: Uuid::new_v4().to_string(),
            worker_id: "dodo-worker".to_string(),
            location: "localhost".to_string(),
            max_threads: DEFAULT_MAX_THREADS,
            maximum_thread_per_tag: HashMap::new(),
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
            broker_addresses: vec!["127.0.0.1:7000".to_string()],
            connect_timeout_ms: 5000,
            handshake_timeout_ms: 10000,
            shutdown_notice_timeout_ms: 1000,
            shared_secret: None,
        }
    }
}

impl WorkerConfig {
    /// Defaults overridden by `DODO_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(process_id) = std::env::var("DODO_PROCESS_ID") {
            config.process_id = process_id;
        }

        if let Ok(worker_id) = std::env::var("DODO_WORKER_ID") {
            config.worker_id = worker_id;
        }

        if let Ok(location) = std::env::var("DODO_LOCATION") {
            config.location = location;
        }

        if let Ok(max_threads) = std::env::var("DODO_MAX_THREADS") {
            config.max_threads = max_threads.parse().map_err(|e| {
                DodoError::ConfigurationError(format!("Invalid max_threads: {e}"))
            })?;
        }

        if let Ok(interval) = std::env::var("DODO_RECONNECT_INTERVAL_MS") {
            config.reconnect_interval_ms = interval.parse().map_err(|e| {
                DodoError::ConfigurationError(format!("Invalid reconnect_interval_ms: {e}"))
            })?;
        }

        if let Ok(addresses) = std::env::var("DODO_BROKER_ADDRESSES") {
            config.broker_addresses = parse_address_list(&addresses);
        }

        if let Ok(secret) = std::env::var("DODO_SHARED_SECRET") {
            config.shared_secret = Some(secret);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load from a file (format chosen by extension) overlaid with `DODO_*`
    /// environment variables
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("DODO")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("broker_addresses"),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;

        tracing::debug!(
            path = %path.display(),
            worker_id = %config.worker_id,
            max_threads = config.max_threads,
            "Loaded worker configuration"
        );

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_id.trim().is_empty() {
            return Err(DodoError::ConfigurationError(
                "worker_id must not be empty".to_string(),
            ));
        }
        if self.max_threads == 0 {
            return Err(DodoError::ConfigurationError(
                "max_threads must be greater than zero".to_string(),
            ));
        }
        if let Some((tag, _)) = self
            .maximum_thread_per_tag
            .iter()
            .find(|(_, cap)| **cap == 0)
        {
            return Err(DodoError::ConfigurationError(format!(
                "thread cap for tag {tag} must be greater than zero"
            )));
        }
        Ok(())
    }

    pub fn identity(&self) -> WorkerIdentity {
        WorkerIdentity {
            process_id: self.process_id.clone(),
            worker_id: self.worker_id.clone(),
            location: self.location.clone(),
        }
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn shutdown_notice_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_notice_timeout_ms)
    }
}

/// Who a worker is, as reported to the broker and to status listeners
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub process_id: String,
    pub worker_id: String,
    pub location: String,
}

fn parse_address_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|address| !address.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_defaults_are_valid() {
        let config = WorkerConfig::default();
        assert_ok!(config.validate());
        assert_eq!(config.max_threads, DEFAULT_MAX_THREADS);
        assert_eq!(config.reconnect_interval(), Duration::from_secs(1));
        assert!(!config.process_id.is_empty());
    }

    #[test]
    fn test_validation_rejects_bad_capacity() {
        let config = WorkerConfig {
            max_threads: 0,
            ..WorkerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(DodoError::ConfigurationError(_))
        ));

        let mut config = WorkerConfig::default();
        config.maximum_thread_per_tag.insert("heavy".to_string(), 0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("heavy"));

        let config = WorkerConfig {
            worker_id: "  ".to_string(),
            ..WorkerConfig::default()
        };
        assert_err!(config.validate());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
worker_id = "render-node-3"
location = "rack7:9000"
max_threads = 4
broker_addresses = ["10.0.0.1:7000", "10.0.0.2:7000"]

[maximum_thread_per_tag]
video = 1
"#
        )
        .unwrap();

        let config = assert_ok!(WorkerConfig::load(file.path()));
        assert_eq!(config.worker_id, "render-node-3");
        assert_eq!(config.location, "rack7:9000");
        assert_eq!(config.max_threads, 4);
        assert_eq!(config.broker_addresses.len(), 2);
        assert_eq!(config.maximum_thread_per_tag.get("video"), Some(&1));
        // Untouched keys keep their defaults
        assert_eq!(config.reconnect_interval_ms, DEFAULT_RECONNECT_INTERVAL_MS);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "max_threads = 0").unwrap();
        assert_err!(WorkerConfig::load(file.path()));
    }

    #[test]
    fn test_address_list_parsing() {
        assert_eq!(
            parse_address_list(" a:1, b:2 ,,"),
            vec!["a:1".to_string(), "b:2".to_string()]
        );
    }
}
