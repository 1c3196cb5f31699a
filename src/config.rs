//! Monitor configuration.
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration. Durations are given in milliseconds.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::ble::uuids::{
    NOTIFY_CHARACTERISTIC_FRAGMENT, OBD_SERVICE_UUID, WRITE_CHARACTERISTIC_FRAGMENT,
};
use crate::error::{Error, Result};
use crate::protocol::command::is_pid_command;
use crate::session::SessionTiming;

/// PIDs polled when none are configured: RPM, speed, throttle and fuel level.
pub const DEFAULT_PIDS: [&str; 4] = ["010C", "010D", "0111", "012F"];

/// Configuration for the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Polling period.
    pub poll_interval_ms: u64,
    /// Delay between commands within one poll.
    pub command_pacing_ms: u64,
    /// Delay after each init command.
    pub settle_delay_ms: u64,
    /// Upstream sync period.
    pub sync_interval_ms: u64,
    /// How long a scan runs.
    pub scan_window_ms: u64,
    /// Upper bound for one connect attempt.
    pub connect_timeout_ms: u64,
    /// Connect attempts before giving up.
    pub connect_attempts: u32,
    /// Only report devices advertising the OBD service while scanning.
    pub filter_scan_by_service: bool,
    /// OBD adapter service.
    pub service_uuid: Uuid,
    /// Fragment of the write characteristic UUID.
    pub write_fragment: String,
    /// Fragment of the notify characteristic UUID.
    pub notify_fragment: String,
    /// Identifier sent upstream with every snapshot.
    pub device_id: String,
    /// Collector endpoint; upstream sync is disabled without one.
    pub collector_url: Option<String>,
    /// HTTP timeout for collector requests.
    pub collector_timeout_ms: u64,
    /// PID commands to poll, in order.
    pub pids: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            command_pacing_ms: 150,
            settle_delay_ms: 500,
            sync_interval_ms: 5_000,
            scan_window_ms: 10_000,
            connect_timeout_ms: 10_000,
            connect_attempts: 3,
            filter_scan_by_service: false,
            service_uuid: OBD_SERVICE_UUID,
            write_fragment: WRITE_CHARACTERISTIC_FRAGMENT.to_string(),
            notify_fragment: NOTIFY_CHARACTERISTIC_FRAGMENT.to_string(),
            device_id: crate::sync::DEFAULT_DEVICE_ID.to_string(),
            collector_url: None,
            collector_timeout_ms: 10_000,
            pids: DEFAULT_PIDS.iter().map(|pid| pid.to_string()).collect(),
        }
    }
}

impl MonitorConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Check the values for consistency.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParameter`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let periods = [
            ("poll_interval_ms", self.poll_interval_ms),
            ("sync_interval_ms", self.sync_interval_ms),
            ("scan_window_ms", self.scan_window_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("collector_timeout_ms", self.collector_timeout_ms),
        ];
        for (name, value) in periods {
            if value == 0 {
                return Err(invalid(name, value));
            }
        }

        if self.connect_attempts == 0 {
            return Err(invalid("connect_attempts", self.connect_attempts));
        }
        if self.write_fragment.trim().is_empty() {
            return Err(invalid("write_fragment", &self.write_fragment));
        }
        if self.notify_fragment.trim().is_empty() {
            return Err(invalid("notify_fragment", &self.notify_fragment));
        }
        if self.device_id.is_empty() {
            return Err(invalid("device_id", &self.device_id));
        }
        if let Some(pid) = self.pids.iter().find(|pid| !is_pid_command(pid)) {
            return Err(invalid("pids", pid));
        }

        Ok(())
    }

    /// Scheduler timings.
    pub fn timing(&self) -> SessionTiming {
        SessionTiming {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            command_pacing: Duration::from_millis(self.command_pacing_ms),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
        }
    }

    /// Upstream sync period.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    /// Scan window.
    pub fn scan_window(&self) -> Duration {
        Duration::from_millis(self.scan_window_ms)
    }

    /// Connect timeout per attempt.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Collector HTTP timeout.
    pub fn collector_timeout(&self) -> Duration {
        Duration::from_millis(self.collector_timeout_ms)
    }
}

fn invalid(name: &str, value: impl std::fmt::Display) -> Error {
    Error::InvalidParameter {
        name: name.to_string(),
        value: value.to_string(),
    }
}
