//! [`Transport`] implementation on top of btleplug.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ble::characteristics::AdapterGatt;
use crate::ble::connection::ConnectionManager;
use crate::ble::scanner::BleScanner;
use crate::ble::transport::{
    DeviceHandle, DeviceStream, GattService, NotificationStream, Transport, WriteMode,
};
use crate::error::{Error, Result};

/// The single live connection.
struct ActiveConnection {
    handle: DeviceHandle,
    connection: Arc<ConnectionManager>,
    characteristics: Arc<AdapterGatt>,
    /// Watches the adapter for a remote disconnect of this device.
    watcher: JoinHandle<()>,
}

impl ActiveConnection {
    /// Drop the link state. Open notification streams yield an error.
    fn release(&self) {
        self.watcher.abort();
        self.characteristics.stop_forwarding();
    }
}

type ActiveSlot = Arc<RwLock<Option<ActiveConnection>>>;

/// BLE transport backed by the platform Bluetooth stack.
///
/// Holds at most one connection at a time.
pub struct BtleplugTransport {
    scanner: BleScanner,
    active: ActiveSlot,
    connect_timeout: Duration,
    connect_attempts: u32,
}

impl BtleplugTransport {
    /// Create a transport on the first available Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new(connect_timeout: Duration, connect_attempts: u32) -> Result<Self> {
        Ok(Self {
            scanner: BleScanner::open().await?,
            active: Arc::new(RwLock::new(None)),
            connect_timeout,
            connect_attempts,
        })
    }

    /// GATT access for `device`, if it is the live connection.
    fn characteristics_for(&self, device: &DeviceHandle) -> Result<Arc<AdapterGatt>> {
        let guard = self.active.read();
        match guard.as_ref() {
            Some(active) if active.handle.id == device.id && active.connection.is_connected() => {
                Ok(active.characteristics.clone())
            }
            _ => Err(Error::NotConnected),
        }
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    async fn scan(&self, service_filter: Option<Uuid>) -> Result<DeviceStream> {
        self.scanner.start_scanning(service_filter).await
    }

    async fn stop_scan(&self) -> Result<()> {
        self.scanner.stop_scanning().await
    }

    async fn connect(&self, id: &str) -> Result<DeviceHandle> {
        let existing = self
            .active
            .read()
            .as_ref()
            .map(|active| (active.handle.clone(), active.connection.is_connected()));

        match existing {
            Some((handle, true)) if handle.id == id => {
                debug!("Already connected to {}", handle.display_name());
                return Ok(handle);
            }
            Some((handle, true)) => {
                return Err(Error::AlreadyConnected {
                    identifier: handle.id,
                });
            }
            Some((handle, false)) => {
                debug!("Discarding dead link to {}", handle.display_name());
                if let Some(stale) = self.active.write().take() {
                    stale.release();
                }
            }
            None => {}
        }

        let (device, peripheral) = self
            .scanner
            .peripheral(id)
            .ok_or_else(|| Error::DeviceNotFound {
                identifier: id.to_string(),
            })?;

        info!("Connecting to {}", device.display_name());

        let drops = self.scanner.disconnections().await?;

        let mut connection =
            ConnectionManager::new(peripheral.clone(), device.id.clone(), self.connect_timeout);
        connection.set_retry_params(self.connect_attempts, Duration::from_secs(1));
        connection.connect().await?;

        let handle = DeviceHandle::from(&device);
        let connection = Arc::new(connection);
        *self.active.write() = Some(ActiveConnection {
            handle: handle.clone(),
            connection: connection.clone(),
            characteristics: Arc::new(AdapterGatt::new(peripheral)),
            watcher: tokio::spawn(watch_link(self.active.clone(), connection, drops)),
        });

        Ok(handle)
    }

    async fn disconnect(&self, device: &DeviceHandle) -> Result<()> {
        let active = {
            let mut guard = self.active.write();
            match guard.as_ref() {
                Some(active) if active.handle.id == device.id => guard.take(),
                _ => None,
            }
        };

        let Some(active) = active else {
            debug!("{} is not connected, ignoring disconnect", device.id);
            return Ok(());
        };

        active.release();
        active.connection.disconnect().await
    }

    fn is_connected(&self, device: &DeviceHandle) -> bool {
        matches!(
            self.active.read().as_ref(),
            Some(active) if active.handle.id == device.id && active.connection.is_connected()
        )
    }

    async fn discover(&self, device: &DeviceHandle) -> Result<Vec<GattService>> {
        let characteristics = self.characteristics_for(device)?;
        Ok(characteristics.refresh())
    }

    async fn write(
        &self,
        device: &DeviceHandle,
        service: Uuid,
        characteristic: Uuid,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<()> {
        let characteristics = self.characteristics_for(device)?;
        characteristics
            .write(service, characteristic, payload, mode)
            .await
    }

    async fn monitor(
        &self,
        device: &DeviceHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStream> {
        let characteristics = self.characteristics_for(device)?;
        characteristics.enable_notify(service, characteristic).await?;
        characteristics.start_forwarding().await?;
        characteristics.notification_stream(characteristic)
    }

    async fn unsubscribe(
        &self,
        device: &DeviceHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()> {
        let characteristics = match self.characteristics_for(device) {
            Ok(characteristics) => characteristics,
            Err(_) => {
                warn!("Unsubscribe from {} after disconnect", characteristic);
                return Ok(());
            }
        };

        characteristics.stop_forwarding();
        characteristics.disable_notify(service, characteristic).await
    }
}

/// Wait for the adapter to report that `connection` dropped, then clear it
/// from `slot` so the next connect starts fresh.
async fn watch_link(
    slot: ActiveSlot,
    connection: Arc<ConnectionManager>,
    mut drops: BoxStream<'static, String>,
) {
    while let Some(id) = drops.next().await {
        if id != connection.identifier() {
            continue;
        }

        connection.mark_lost();
        let lost = {
            let mut guard = slot.write();
            match guard.as_ref() {
                Some(active) if Arc::ptr_eq(&active.connection, &connection) => guard.take(),
                _ => None,
            }
        };
        if let Some(lost) = lost {
            lost.characteristics.stop_forwarding();
        }
        return;
    }
}
