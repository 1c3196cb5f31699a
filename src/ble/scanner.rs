//! Adapter discovery on the host's first Bluetooth controller.

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::transport::{DeviceStream, DiscoveredDevice};
use crate::error::{Error, Result};

/// A discovered device together with its platform peripheral.
#[derive(Debug, Clone)]
struct ScanRecord {
    device: DiscoveredDevice,
    peripheral: Peripheral,
}

/// BLE scanner for discovering OBD adapters.
pub struct BleScanner {
    /// The BLE adapter to use for scanning.
    adapter: Adapter,
    /// Discovered peripherals by identifier.
    discovered: Arc<RwLock<HashMap<String, ScanRecord>>>,
    /// Channel for discovery events; `None` while not scanning.
    event_tx: Arc<RwLock<Option<broadcast::Sender<DiscoveredDevice>>>>,
    /// Handle to the scanning task.
    scan_handle: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl BleScanner {
    /// Open the first Bluetooth controller the platform reports.
    ///
    /// # Errors
    ///
    /// [`Error::BluetoothUnavailable`] when there is no usable controller.
    pub async fn open() -> Result<Self> {
        let Ok(manager) = Manager::new().await else {
            return Err(Error::BluetoothUnavailable);
        };

        let Some(adapter) = manager
            .adapters()
            .await
            .map_err(Error::Bluetooth)?
            .into_iter()
            .next()
        else {
            return Err(Error::BluetoothUnavailable);
        };

        match adapter.adapter_info().await {
            Ok(info) => info!("Scanning with controller {}", info),
            Err(e) => debug!("Controller info unavailable: {}", e),
        }

        Ok(Self::on_adapter(adapter))
    }

    /// Scanner bound to an already selected controller.
    pub fn on_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            discovered: Arc::new(RwLock::new(HashMap::new())),
            event_tx: Arc::new(RwLock::new(None)),
            scan_handle: RwLock::new(None),
        }
    }

    /// Start scanning and stream discovered devices until the scan stops.
    ///
    /// A `service_filter` restricts the platform scan to devices advertising
    /// that service. Many adapters do not advertise their service, so the
    /// filter is optional.
    pub async fn start_scanning(&self, service_filter: Option<Uuid>) -> Result<DeviceStream> {
        if let Some(rx) = self.subscribe() {
            debug!("Scan in progress, sharing it");
            return Ok(Self::device_stream(rx));
        }

        info!(?service_filter, "Scanning for OBD adapters");

        let filter = ScanFilter {
            services: service_filter.into_iter().collect(),
        };

        let mut events = self.adapter.events().await.map_err(Error::Bluetooth)?;
        self.adapter
            .start_scan(filter)
            .await
            .map_err(Error::Bluetooth)?;

        let (tx, rx) = broadcast::channel(100);
        *self.event_tx.write() = Some(tx);

        let adapter = self.adapter.clone();
        let discovered = self.discovered.clone();
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if event_tx.read().is_none() {
                    break;
                }

                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    CentralEvent::DeviceDisconnected(id) => {
                        debug!("{:?} disconnected", id);
                        continue;
                    }
                    _ => continue,
                };

                if let Some(record) = Self::process_peripheral(&adapter, &id).await {
                    let device = record.device.clone();
                    discovered.write().insert(device.id.clone(), record);

                    if let Some(tx) = event_tx.read().as_ref() {
                        let _ = tx.send(device);
                    }
                }
            }

            event_tx.write().take();
            debug!("Adapter event stream closed");
        });

        *self.scan_handle.write() = Some(handle);

        Ok(Self::device_stream(rx))
    }

    /// Stop scanning. Ends every stream returned by `start_scanning`.
    pub async fn stop_scanning(&self) -> Result<()> {
        if !self.halt() {
            return Ok(());
        }
        info!("Scan finished");
        self.adapter.stop_scan().await.map_err(Error::Bluetooth)
    }

    /// Close the event channel and the forwarding task. False when idle.
    fn halt(&self) -> bool {
        let was_scanning = self.event_tx.write().take().is_some();
        if let Some(handle) = self.scan_handle.write().take() {
            handle.abort();
        }
        was_scanning
    }

    /// Identifiers of peripherals whose link dropped, as they drop.
    ///
    /// Independent of scanning; the stream lives as long as the adapter
    /// reports events.
    pub async fn disconnections(&self) -> Result<BoxStream<'static, String>> {
        let events = self.adapter.events().await.map_err(Error::Bluetooth)?;
        Ok(events
            .filter_map(|event| async move {
                match event {
                    CentralEvent::DeviceDisconnected(id) => Some(format!("{:?}", id)),
                    _ => None,
                }
            })
            .boxed())
    }

    /// Look up a discovered device and its peripheral.
    pub fn peripheral(&self, id: &str) -> Option<(DiscoveredDevice, Peripheral)> {
        self.discovered
            .read()
            .get(id)
            .map(|record| (record.device.clone(), record.peripheral.clone()))
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<DiscoveredDevice>> {
        self.event_tx.read().as_ref().map(broadcast::Sender::subscribe)
    }

    fn device_stream(rx: broadcast::Receiver<DiscoveredDevice>) -> DeviceStream {
        stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(device) => return Some((device, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Scan consumer lagged, skipped {} devices", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    /// Read the properties of a discovered peripheral.
    async fn process_peripheral(adapter: &Adapter, id: &PeripheralId) -> Option<ScanRecord> {
        let peripheral = adapter
            .peripheral(id)
            .await
            .map_err(|e| trace!("{:?} vanished: {}", id, e))
            .ok()?;

        let properties = match peripheral.properties().await {
            Ok(properties) => properties?,
            Err(e) => {
                warn!("No properties for {:?}: {}", id, e);
                return None;
            }
        };

        let device = DiscoveredDevice {
            id: format!("{:?}", id),
            name: properties.local_name,
            rssi: properties.rssi,
        };

        trace!("Discovered {} ({:?} dBm)", device.display_name(), device.rssi);

        Some(ScanRecord { device, peripheral })
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        self.halt();
    }
}
