//! Device manager for discovering OBD adapters and running the monitor.
//!
//! This is the consumer-facing surface: scan for adapters, hold the single
//! connection, resolve the command characteristics and start or stop the
//! monitoring session. Live telemetry is read from here.

use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::ble::btleplug_transport::BtleplugTransport;
use crate::ble::characteristics::{resolve_characteristics, CharacteristicPair};
use crate::ble::transport::{DeviceHandle, DiscoveredDevice, GattService, Transport};
use crate::config::MonitorConfig;
use crate::error::{Error, Result};
use crate::session::{
    CallbackHandle, SessionController, SessionRequest, SessionState, SessionStats,
};
use crate::sync::HttpCollector;
use crate::telemetry::TelemetrySnapshot;

/// The connected adapter and what it exposes.
#[derive(Debug, Clone)]
struct Connection {
    device: DeviceHandle,
    services: Vec<GattService>,
}

/// Central manager for discovering adapters and monitoring one of them.
pub struct DeviceManager {
    /// Monitor configuration.
    config: MonitorConfig,
    /// BLE stack.
    transport: Arc<dyn Transport>,
    /// Monitoring session.
    session: SessionController,
    /// Devices seen by scans, by identifier.
    discovered: RwLock<HashMap<String, DiscoveredDevice>>,
    /// The single live connection.
    connection: RwLock<Option<Connection>>,
    /// Device discovery channel.
    discovered_tx: broadcast::Sender<DiscoveredDevice>,
    /// Callback ID counter.
    callback_counter: AtomicU64,
    /// Set while a scan is running.
    scanning: AtomicBool,
}

impl DeviceManager {
    /// Create a manager on the platform Bluetooth stack.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or Bluetooth is not
    /// available.
    pub async fn new(config: MonitorConfig) -> Result<Self> {
        config.validate()?;
        let transport =
            BtleplugTransport::new(config.connect_timeout(), config.connect_attempts).await?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Create a manager over any transport.
    ///
    /// Upstream sync is enabled when the configuration names a collector.
    pub fn with_transport(config: MonitorConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;

        let mut builder = SessionController::builder(transport.clone())
            .timing(config.timing())
            .device_id(config.device_id.clone())
            .sync_interval(config.sync_interval());

        if let Some(url) = &config.collector_url {
            let collector = HttpCollector::new(url, config.collector_timeout())?;
            info!("Publishing telemetry to {}", collector.url());
            builder = builder.collector(Arc::new(collector));
        }

        let (discovered_tx, _) = broadcast::channel(32);

        Ok(Self {
            session: builder.build(),
            config,
            transport,
            discovered: RwLock::new(HashMap::new()),
            connection: RwLock::new(None),
            discovered_tx,
            callback_counter: AtomicU64::new(0),
            scanning: AtomicBool::new(false),
        })
    }

    /// The configuration in use.
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// The monitoring session.
    pub fn session(&self) -> &SessionController {
        &self.session
    }

    // === Discovery ===

    /// Scan for adapters for `window`, or the configured scan window.
    ///
    /// Returns every device seen so far, strongest signal first.
    pub async fn scan(&self, window: Option<Duration>) -> Result<Vec<DiscoveredDevice>> {
        if self.scanning.swap(true, Ordering::SeqCst) {
            debug!("Already scanning");
            return Ok(self.discovered_devices());
        }

        let window = window.unwrap_or_else(|| self.config.scan_window());
        let filter = self
            .config
            .filter_scan_by_service
            .then_some(self.config.service_uuid);

        info!("Scanning for {:?}", window);

        let mut devices = match self.transport.scan(filter).await {
            Ok(devices) => devices,
            Err(e) => {
                self.scanning.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                device = devices.next() => match device {
                    Some(device) => self.record_device(device),
                    None => break,
                },
            }
        }

        drop(devices);
        self.scanning.store(false, Ordering::SeqCst);
        self.transport.stop_scan().await?;

        let found = self.discovered_devices();
        info!("Scan finished, {} device(s) found", found.len());
        Ok(found)
    }

    /// Devices seen so far, strongest signal first.
    pub fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        let mut devices: Vec<_> = self.discovered.read().values().cloned().collect();
        devices.sort_by_key(|d| std::cmp::Reverse(d.rssi.unwrap_or(i16::MIN)));
        devices
    }

    /// The device with the strongest signal.
    pub fn nearest_device(&self) -> Option<DiscoveredDevice> {
        self.discovered
            .read()
            .values()
            .max_by_key(|d| d.rssi.unwrap_or(i16::MIN))
            .cloned()
    }

    /// Check if a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Subscribe to device discovery events.
    pub fn subscribe_discovered(&self) -> broadcast::Receiver<DiscoveredDevice> {
        self.discovered_tx.subscribe()
    }

    /// Register a callback for when devices are discovered or updated.
    pub fn on_device_discovered<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(DiscoveredDevice) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.discovered_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(device) => callback(device),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    fn record_device(&self, device: DiscoveredDevice) {
        let is_new = self
            .discovered
            .write()
            .insert(device.id.clone(), device.clone())
            .is_none();

        if is_new {
            info!(
                "Discovered {} ({:?} dBm)",
                device.display_name(),
                device.rssi
            );
        }

        let _ = self.discovered_tx.send(device);
    }

    // === Connection ===

    /// Connect to a discovered adapter and check it exposes the OBD service.
    ///
    /// Connecting to the device that is already connected returns its handle.
    /// A link the adapter dropped on its own is discarded first, along with
    /// any session running over it.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyConnected`] if another device is connected,
    /// [`Error::ConnectionFailed`] if the device is unreachable, and
    /// [`Error::ServiceNotFound`] if it lacks the OBD service.
    pub async fn connect(&self, id: &str) -> Result<DeviceHandle> {
        self.discard_dead_link().await;

        let existing = self.connected_device();
        match existing {
            Some(device) if device.id == id => return Ok(device),
            Some(device) => {
                return Err(Error::AlreadyConnected {
                    identifier: device.id,
                })
            }
            None => {}
        }

        let device = self.transport.connect(id).await?;

        let services = match self.transport.discover(&device).await {
            Ok(services) => services,
            Err(e) => {
                self.release(&device).await;
                return Err(e);
            }
        };

        if !services.iter().any(|s| s.uuid == self.config.service_uuid) {
            warn!(
                "{} does not expose service {}",
                device.display_name(),
                self.config.service_uuid
            );
            self.release(&device).await;
            return Err(Error::ServiceNotFound {
                uuid: self.config.service_uuid.to_string(),
            });
        }

        info!("Connected to {}", device.display_name());
        *self.connection.write() = Some(Connection {
            device: device.clone(),
            services,
        });

        Ok(device)
    }

    /// Stop monitoring and disconnect.
    pub async fn disconnect(&self) -> Result<()> {
        self.session.stop().await;

        let connection = self.connection.write().take();
        let Some(connection) = connection else {
            debug!("Not connected, ignoring disconnect");
            return Ok(());
        };

        info!("Disconnecting from {}", connection.device.display_name());
        self.transport.disconnect(&connection.device).await
    }

    /// The connected device, if its link is still up.
    pub fn connected_device(&self) -> Option<DeviceHandle> {
        self.connection
            .read()
            .as_ref()
            .map(|c| c.device.clone())
            .filter(|device| self.transport.is_connected(device))
    }

    /// Check if a device is connected.
    pub fn is_connected(&self) -> bool {
        self.connected_device().is_some()
    }

    /// Forget a connection whose link dropped without a disconnect call.
    async fn discard_dead_link(&self) {
        let dead = {
            let mut guard = self.connection.write();
            match guard.as_ref() {
                Some(c) if !self.transport.is_connected(&c.device) => guard.take(),
                _ => None,
            }
        };

        if let Some(dead) = dead {
            warn!("Link to {} was lost", dead.device.display_name());
            self.session.stop().await;
        }
    }

    /// Resolve the write/notify characteristics on the connected device.
    pub fn characteristics(
        &self,
        write_fragment: &str,
        notify_fragment: &str,
    ) -> Result<CharacteristicPair> {
        let guard = self.connection.read();
        let connection = guard
            .as_ref()
            .filter(|c| self.transport.is_connected(&c.device))
            .ok_or(Error::NotConnected)?;
        resolve_characteristics(
            &connection.services,
            &self.config.service_uuid,
            write_fragment,
            notify_fragment,
        )
    }

    async fn release(&self, device: &DeviceHandle) {
        if let Err(e) = self.transport.disconnect(device).await {
            warn!("Failed to disconnect from {}: {}", device.display_name(), e);
        }
    }

    // === Monitoring ===

    /// Start monitoring with the configured characteristic fragments.
    pub async fn start_monitoring<I, S>(&self, pids: I) -> Result<bool>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let write_fragment = self.config.write_fragment.clone();
        let notify_fragment = self.config.notify_fragment.clone();
        self.start_monitoring_with(&write_fragment, &notify_fragment, pids)
            .await
    }

    /// Start monitoring through the characteristics matching the fragments.
    ///
    /// Returns `Ok(false)` without doing anything when no device is
    /// connected, `pids` is empty or a session is already running.
    ///
    /// # Errors
    ///
    /// Discovery errors if either characteristic cannot be resolved, and
    /// the transport error if the subscription cannot be opened.
    pub async fn start_monitoring_with<I, S>(
        &self,
        write_fragment: &str,
        notify_fragment: &str,
        pids: I,
    ) -> Result<bool>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pids: Vec<String> = pids.into_iter().map(Into::into).collect();

        let device = self.connected_device();
        let characteristics = match &device {
            Some(_) => Some(self.characteristics(write_fragment, notify_fragment)?),
            None => None,
        };

        self.session
            .start(SessionRequest {
                device,
                characteristics,
                pids,
            })
            .await
    }

    /// Stop monitoring. Safe to call when not monitoring.
    pub async fn stop_monitoring(&self) {
        self.session.stop().await;
    }

    /// Check if a session is active.
    pub fn is_monitoring(&self) -> bool {
        self.session.is_monitoring()
    }

    /// Current session state.
    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    /// Latest telemetry.
    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.session.telemetry()
    }

    /// Session counters.
    pub fn stats(&self) -> SessionStats {
        self.session.stats()
    }

    /// Set or clear the session identifier telemetry is synced under.
    pub fn set_sync_session(&self, session_id: Option<String>) {
        self.session.set_sync_session(session_id);
    }

    /// Clean shutdown of monitoring, scanning and the connection.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down device manager");

        self.session.set_sync_session(None);
        if self.is_scanning() {
            self.transport.stop_scan().await?;
        }
        self.disconnect().await
    }
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("connected", &self.connected_device())
            .field("session", &self.session.state())
            .finish_non_exhaustive()
    }
}
