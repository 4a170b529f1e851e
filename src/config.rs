//! Engine configuration.
//!
//! Every field has a default, so `EventBusConfig::default()` is a working
//! configuration and partial JSON documents fill in the rest. Durations are
//! serialized as milliseconds.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Capacity of the inbound request queue; `publish` fails fast once
    /// this is saturated.
    #[serde(default = "default_request_queue_size")]
    pub request_queue_size: usize,

    #[serde(default = "default_response_queue_size")]
    pub response_queue_size: usize,

    #[serde(default = "default_error_queue_size")]
    pub error_queue_size: usize,

    /// Maximum number of concurrently executing handlers.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// Events accumulated before a broker flush.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Per-handler execution timeout.
    #[serde(default = "default_handler_timeout", with = "duration_ms")]
    pub handler_timeout: Duration,

    /// How often the dispatch loop polls a configured broker for
    /// externally published events.
    #[serde(default = "default_broker_poll_interval", with = "duration_ms")]
    pub broker_poll_interval: Duration,

    /// Queue-depth sampling interval.
    #[serde(default = "default_metrics_interval", with = "duration_ms")]
    pub metrics_interval: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            request_queue_size: default_request_queue_size(),
            response_queue_size: default_response_queue_size(),
            error_queue_size: default_error_queue_size(),
            worker_pool_size: default_worker_pool_size(),
            batch_size: default_batch_size(),
            handler_timeout: default_handler_timeout(),
            broker_poll_interval: default_broker_poll_interval(),
            metrics_interval: default_metrics_interval(),
        }
    }
}

impl EventBusConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn from_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }
}

fn default_request_queue_size() -> usize {
    100
}
fn default_response_queue_size() -> usize {
    100
}
fn default_error_queue_size() -> usize {
    100
}
fn default_worker_pool_size() -> usize {
    10
}
fn default_batch_size() -> usize {
    10
}
fn default_handler_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_broker_poll_interval() -> Duration {
    Duration::from_millis(10)
}
fn default_metrics_interval() -> Duration {
    Duration::from_secs(1)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
