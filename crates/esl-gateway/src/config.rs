use crate::error::GatewayError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// What the session watchdog does once an AP has gone quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdleTimeoutPolicy {
    Log,
    Close,
}

impl Default for IdleTimeoutPolicy {
    fn default() -> Self {
        Self::Log
    }
}

impl IdleTimeoutPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdleTimeoutPolicy::Log => "log",
            IdleTimeoutPolicy::Close => "close",
        }
    }
}

impl fmt::Display for IdleTimeoutPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdleTimeoutPolicy {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "log" => Ok(IdleTimeoutPolicy::Log),
            "close" => Ok(IdleTimeoutPolicy::Close),
            other => Err(format!("Unknown idle timeout policy: {other}")),
        }
    }
}

/// What happens to a task that keeps failing after `retry_ceiling` sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryCeilingPolicy {
    /// Stop scheduling it; the result keeps its last failure status.
    Abandon,
    /// Stop scheduling it and report the result as `Lost`.
    MarkLost,
}

impl Default for RetryCeilingPolicy {
    fn default() -> Self {
        Self::Abandon
    }
}

impl RetryCeilingPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryCeilingPolicy::Abandon => "abandon",
            RetryCeilingPolicy::MarkLost => "mark_lost",
        }
    }
}

impl fmt::Display for RetryCeilingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetryCeilingPolicy {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().replace('-', "_").as_str() {
            "abandon" => Ok(RetryCeilingPolicy::Abandon),
            "mark_lost" | "lost" => Ok(RetryCeilingPolicy::MarkLost),
            other => Err(format!("Unknown retry ceiling policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen_addr: String,
    pub default_store_code: String,
    pub max_sessions: usize,
    pub registration_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub send_watchdog_secs: u64,
    pub ping_watchdog_secs: u64,
    pub idle_timeout_policy: IdleTimeoutPolicy,
    pub dispatch_interval_ms: u64,
    pub batch_max_tags: usize,
    pub batch_max_bytes: usize,
    pub in_flight_grace_secs: u64,
    pub retry_ceiling: u32,
    pub retry_ceiling_policy: RetryCeilingPolicy,
    pub stall_log_every: u32,
    pub event_queue_capacity: usize,
    pub station_queue_capacity: usize,
    pub log_dir: Option<String>,
    pub debug: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:1234".to_string(),
            default_store_code: "0001".to_string(),
            max_sessions: 1024,
            registration_timeout_secs: 30,
            write_timeout_secs: 5,
            send_watchdog_secs: 300,
            ping_watchdog_secs: 900,
            idle_timeout_policy: IdleTimeoutPolicy::Log,
            dispatch_interval_ms: 2000,
            batch_max_tags: 0xD0,
            batch_max_bytes: 0x80000,
            in_flight_grace_secs: 300,
            retry_ceiling: 0x100,
            retry_ceiling_policy: RetryCeilingPolicy::Abandon,
            stall_log_every: 0xFFFF,
            event_queue_capacity: 65536,
            station_queue_capacity: 4096,
            log_dir: None,
            debug: false,
        }
    }
}

impl GatewayConfig {
    /// Reads a TOML file; keys that are absent keep their defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self, GatewayError> {
        let contents =
            std::fs::read_to_string(path).map_err(|source| GatewayError::ConfigRead {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, GatewayError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_secs(self.registration_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn send_watchdog(&self) -> Duration {
        Duration::from_secs(self.send_watchdog_secs)
    }

    pub fn ping_watchdog(&self) -> Duration {
        Duration::from_secs(self.ping_watchdog_secs)
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms.max(1))
    }

    pub fn in_flight_grace(&self) -> Duration {
        Duration::from_secs(self.in_flight_grace_secs)
    }
}
