//! Test doubles for the transport and collector seams.
//!
//! [`SimulatedTransport`] behaves like an ELM327 adapter: writing a command
//! with a canned reply pushes that reply onto the open notification stream.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ble::transport::{
    DeviceHandle, DeviceStream, DiscoveredDevice, GattService, NotificationStream, Transport,
    WriteMode,
};
use crate::ble::uuids::OBD_SERVICE_UUID;
use crate::error::{Error, Result};
use crate::sync::{Collector, SyncPayload};

/// Write characteristic of the simulated adapter.
pub const SIM_WRITE_UUID: Uuid = Uuid::from_u128(0x0000_fff2_0000_1000_8000_00805f9b34fb);

/// Notify characteristic of the simulated adapter.
pub const SIM_NOTIFY_UUID: Uuid = Uuid::from_u128(0x0000_fff1_0000_1000_8000_00805f9b34fb);

/// Identifier of the simulated adapter.
pub const SIM_DEVICE_ID: &str = "sim-obd";

type Notification = Result<Vec<u8>>;

/// In-memory adapter with canned replies.
pub struct SimulatedTransport {
    devices: Vec<DiscoveredDevice>,
    services: Mutex<Vec<GattService>>,
    replies: Mutex<HashMap<String, Vec<u8>>>,
    failing: Mutex<HashSet<String>>,
    fail_monitor: Mutex<bool>,
    monitor_delays: Mutex<VecDeque<Duration>>,
    unsubscribe_delays: Mutex<VecDeque<Duration>>,
    connected: Mutex<Option<String>>,
    written: Mutex<Vec<(String, WriteMode)>>,
    notify_tx: Mutex<Option<mpsc::UnboundedSender<Notification>>>,
    monitors: AtomicUsize,
    unsubscribes: AtomicUsize,
    disconnects: AtomicUsize,
}

impl SimulatedTransport {
    /// An adapter exposing the OBD service with `fff2`/`fff1` characteristics.
    pub fn new() -> Self {
        Self {
            devices: vec![DiscoveredDevice {
                id: SIM_DEVICE_ID.to_string(),
                name: Some("OBDII".to_string()),
                rssi: Some(-58),
            }],
            services: Mutex::new(vec![GattService {
                uuid: OBD_SERVICE_UUID,
                characteristics: vec![SIM_NOTIFY_UUID, SIM_WRITE_UUID],
            }]),
            replies: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            fail_monitor: Mutex::new(false),
            monitor_delays: Mutex::new(VecDeque::new()),
            unsubscribe_delays: Mutex::new(VecDeque::new()),
            connected: Mutex::new(None),
            written: Mutex::new(Vec::new()),
            notify_tx: Mutex::new(None),
            monitors: AtomicUsize::new(0),
            unsubscribes: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        }
    }

    /// An adapter answering the four standard PIDs.
    pub fn with_standard_replies() -> Self {
        let transport = Self::new();
        transport.reply("010C", "41 0C 1A F8\r\r>");
        transport.reply("010D", "41 0D 3C\r\r>");
        transport.reply("0111", "41 11 80\r\r>");
        transport.reply("012F", "41 2F 40\r\r>");
        transport
    }

    /// Answer `command` with `reply`.
    pub fn reply(&self, command: &str, reply: &str) {
        self.replies
            .lock()
            .insert(command.to_string(), reply.as_bytes().to_vec());
    }

    /// Make every write of `command` fail.
    pub fn fail_command(&self, command: &str) {
        self.failing.lock().insert(command.to_string());
    }

    /// Make opening a subscription fail.
    pub fn fail_monitor(&self) {
        *self.fail_monitor.lock() = true;
    }

    /// Make the next subscription take `delay` to open.
    pub fn delay_next_monitor(&self, delay: Duration) {
        self.monitor_delays.lock().push_back(delay);
    }

    /// Make the next unsubscribe take `delay` to complete.
    pub fn delay_next_unsubscribe(&self, delay: Duration) {
        self.unsubscribe_delays.lock().push_back(delay);
    }

    /// Drop the link from the adapter side: the connection is gone and the
    /// open subscription ends.
    pub fn drop_link(&self) {
        self.connected.lock().take();
        self.notify_tx.lock().take();
    }

    /// Replace the advertised services.
    pub fn set_services(&self, services: Vec<GattService>) {
        *self.services.lock() = services;
    }

    /// Push a raw notification onto the open subscription.
    pub fn notify(&self, payload: &[u8]) -> bool {
        self.send(Ok(payload.to_vec()))
    }

    /// Break the open subscription.
    pub fn fail_channel(&self, reason: &str) -> bool {
        self.send(Err(Error::NotificationChannel {
            reason: reason.to_string(),
        }))
    }

    /// Commands written successfully, in order.
    pub fn written(&self) -> Vec<String> {
        self.written
            .lock()
            .iter()
            .map(|(command, _)| command.clone())
            .collect()
    }

    /// Successful writes with their write mode.
    pub fn written_with_mode(&self) -> Vec<(String, WriteMode)> {
        self.written.lock().clone()
    }

    /// Number of subscriptions opened.
    pub fn monitor_count(&self) -> usize {
        self.monitors.load(Ordering::SeqCst)
    }

    /// Number of unsubscribe calls.
    pub fn unsubscribe_count(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }

    /// Number of disconnect calls.
    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    fn send(&self, item: Notification) -> bool {
        self.notify_tx
            .lock()
            .as_ref()
            .map(|tx| tx.send(item).is_ok())
            .unwrap_or(false)
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn scan(&self, _service_filter: Option<Uuid>) -> Result<DeviceStream> {
        Ok(stream::iter(self.devices.clone()).boxed())
    }

    async fn stop_scan(&self) -> Result<()> {
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<DeviceHandle> {
        let handle = self
            .devices
            .iter()
            .find(|device| device.id == id)
            .map(DeviceHandle::from)
            .ok_or_else(|| Error::ConnectionFailed {
                reason: format!("{} unreachable", id),
            })?;
        *self.connected.lock() = Some(handle.id.clone());
        Ok(handle)
    }

    async fn disconnect(&self, _device: &DeviceHandle) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.lock().take();
        self.notify_tx.lock().take();
        Ok(())
    }

    fn is_connected(&self, device: &DeviceHandle) -> bool {
        self.connected.lock().as_deref() == Some(device.id.as_str())
    }

    async fn discover(&self, _device: &DeviceHandle) -> Result<Vec<GattService>> {
        Ok(self.services.lock().clone())
    }

    async fn write(
        &self,
        _device: &DeviceHandle,
        _service: Uuid,
        _characteristic: Uuid,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<()> {
        let command = String::from_utf8_lossy(payload)
            .trim_end_matches('\r')
            .to_string();

        if self.failing.lock().contains(&command) {
            return Err(Error::ConnectionFailed {
                reason: format!("simulated write failure ({})", mode),
            });
        }

        self.written.lock().push((command.clone(), mode));

        let reply = self.replies.lock().get(&command).cloned();
        if let Some(reply) = reply {
            self.send(Ok(reply));
        }
        Ok(())
    }

    async fn monitor(
        &self,
        _device: &DeviceHandle,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<NotificationStream> {
        if *self.fail_monitor.lock() {
            return Err(Error::NotificationChannel {
                reason: "simulated subscribe failure".to_string(),
            });
        }

        let delay = self.monitor_delays.lock().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.monitors.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        *self.notify_tx.lock() = Some(tx);

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn unsubscribe(
        &self,
        _device: &DeviceHandle,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<()> {
        let delay = self.unsubscribe_delays.lock().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        self.notify_tx.lock().take();
        Ok(())
    }
}

/// Collector that records payloads, or fails every publish.
#[derive(Default)]
pub struct RecordingCollector {
    payloads: Mutex<Vec<SyncPayload>>,
    attempts: AtomicUsize,
    fail: bool,
}

impl RecordingCollector {
    /// A collector that accepts every payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// A collector whose publishes always fail.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Payloads accepted so far.
    pub fn payloads(&self) -> Vec<SyncPayload> {
        self.payloads.lock().clone()
    }

    /// Number of publish calls, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Collector for RecordingCollector {
    async fn publish(&self, payload: &SyncPayload) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::Sync {
                message: "collector unreachable".to_string(),
            });
        }
        self.payloads.lock().push(payload.clone());
        Ok(())
    }
}
