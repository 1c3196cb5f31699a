// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # obd-ble-monitor
//!
//! Live OBD-II telemetry from ELM327-style Bluetooth Low Energy adapters.
//!
//! The adapter is driven over two GATT characteristics: commands are written
//! to one and replies arrive as notifications on the other, with no framing
//! or request correlation. This crate polls a list of Mode 01 PIDs on a
//! fixed period, decodes every reply as it arrives and keeps the latest
//! value per metric in memory. Optionally it publishes snapshots of that
//! state to an HTTP collector on a slower, independent timer.
//!
//! ## Features
//!
//! - **Adapter Discovery**: Scan for adapters within a time window
//! - **Single Connection**: One adapter at a time, OBD service verified on connect
//! - **Polling Scheduler**: Cyclic multi-PID polling with inter-command pacing
//! - **Decoder Registry**: Engine RPM, vehicle speed, throttle position and fuel level
//! - **Upstream Sync**: Periodic JSON snapshots to a remote collector
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use obd_ble_monitor::{DeviceManager, MonitorConfig, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let manager = DeviceManager::new(MonitorConfig::default()).await?;
//!
//!     // Scan for the configured window and pick the closest adapter
//!     manager.scan(None).await?;
//!     let Some(adapter) = manager.nearest_device() else {
//!         return Ok(());
//!     };
//!
//!     manager.connect(&adapter.id).await?;
//!     manager.start_monitoring(["010C", "010D"]).await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(10)).await;
//!     println!("{}", manager.telemetry());
//!
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.

// Public modules
pub mod ble;
pub mod config;
pub mod device_manager;
pub mod error;
pub mod protocol;
pub mod session;
pub mod sync;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use config::MonitorConfig;
pub use device_manager::DeviceManager;
pub use error::{Error, Result};
pub use session::{
    CallbackHandle, SessionController, SessionRequest, SessionState, SessionStats, SessionTiming,
};

// Re-export commonly used types from submodules
pub use ble::connection::ConnectionState;
pub use ble::transport::{DeviceHandle, DiscoveredDevice, Transport};
pub use protocol::pid::{DecoderRegistry, ParsedMetric, PidDecoder};
pub use sync::{Collector, HttpCollector, SyncPayload};
pub use telemetry::{MetricValue, TelemetrySnapshot, TelemetryStore};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<DeviceManager>();
        let _ = std::any::TypeId::of::<SessionController>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<TelemetrySnapshot>();
        let _ = std::any::TypeId::of::<DecoderRegistry>();
        let _ = std::any::TypeId::of::<SyncPayload>();
    }

    #[test]
    fn test_default_registry_covers_default_pids() {
        let registry = DecoderRegistry::default();
        for pid in config::DEFAULT_PIDS {
            let code = u8::from_str_radix(&pid[2..], 16).unwrap();
            assert!(registry.supports(code), "no decoder for {pid}");
        }
    }
}
