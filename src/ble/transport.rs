//! Transport seam between the session logic and the BLE stack.
//!
//! Everything above this module talks to an adapter through [`Transport`].
//! The production implementation is
//! [`BtleplugTransport`](crate::ble::btleplug_transport::BtleplugTransport);
//! tests drive the session against a simulated transport instead.

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::error::Result;

/// A device seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Platform identifier used to connect.
    pub id: String,
    /// Advertised local name, if any.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
}

impl DiscoveredDevice {
    /// Name to show to a user, falling back to the identifier.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Handle to the connected device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    /// Platform identifier.
    pub id: String,
    /// Advertised local name, if any.
    pub name: Option<String>,
}

impl DeviceHandle {
    /// Create a new device handle.
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
        }
    }

    /// Name to show to a user, falling back to the identifier.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

impl From<&DiscoveredDevice> for DeviceHandle {
    fn from(device: &DiscoveredDevice) -> Self {
        Self {
            id: device.id.clone(),
            name: device.name.clone(),
        }
    }
}

/// A GATT service and the UUIDs of its characteristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristic UUIDs within the service.
    pub characteristics: Vec<Uuid>,
}

/// How a characteristic write is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteMode {
    /// Wait for the peripheral to acknowledge the write.
    WithResponse,
    /// Fire-and-forget write.
    WithoutResponse,
}

impl std::fmt::Display for WriteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WithResponse => write!(f, "with response"),
            Self::WithoutResponse => write!(f, "without response"),
        }
    }
}

/// Devices reported by a running scan, until the scan stops.
pub type DeviceStream = BoxStream<'static, DiscoveredDevice>;

/// Notification payloads from a subscribed characteristic.
///
/// An `Err` item means the subscription itself failed; the stream yields
/// nothing after it.
pub type NotificationStream = BoxStream<'static, Result<Vec<u8>>>;

/// The operations the monitor needs from a BLE stack.
///
/// Implementations may drop notifications under buffer pressure; callers
/// must tolerate missed samples.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start scanning, optionally only for devices advertising `service_filter`.
    async fn scan(&self, service_filter: Option<Uuid>) -> Result<DeviceStream>;

    /// Stop a running scan. Stopping when not scanning is not an error.
    async fn stop_scan(&self) -> Result<()>;

    /// Connect to a previously discovered device.
    async fn connect(&self, id: &str) -> Result<DeviceHandle>;

    /// Disconnect from a device.
    async fn disconnect(&self, device: &DeviceHandle) -> Result<()>;

    /// Check whether the link to `device` is still up.
    ///
    /// Turns false once the remote end drops the link, without any call to
    /// [`Transport::disconnect`].
    fn is_connected(&self, device: &DeviceHandle) -> bool;

    /// List the services and characteristics of a connected device.
    async fn discover(&self, device: &DeviceHandle) -> Result<Vec<GattService>>;

    /// Write a payload to a characteristic.
    async fn write(
        &self,
        device: &DeviceHandle,
        service: Uuid,
        characteristic: Uuid,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<()>;

    /// Subscribe to notifications from a characteristic.
    async fn monitor(
        &self,
        device: &DeviceHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStream>;

    /// Remove a subscription opened with [`Transport::monitor`].
    async fn unsubscribe(
        &self,
        device: &DeviceHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()>;
}
