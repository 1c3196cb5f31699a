//! Monitoring session: state machine, polling scheduler and reply handling.
//!
//! A session moves through `Idle -> Starting -> Active -> Stopping -> Idle`.
//! While active it owns one notification subscription and two background
//! tasks: the poller, which writes one command per PID on every tick, and
//! the listener, which decodes every notification as it arrives. Replies
//! are not correlated with requests; the PID inside each reply decides
//! which metric it updates.

use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::ble::characteristics::CharacteristicPair;
use crate::ble::transport::{DeviceHandle, NotificationStream, Transport};
use crate::error::Result;
use crate::protocol::command::{CommandChannel, DEFAULT_SETTLE_DELAY};
use crate::protocol::pid::{DecoderRegistry, ParsedMetric};
use crate::sync::{
    non_zero_period, Collector, UpstreamSync, DEFAULT_DEVICE_ID, DEFAULT_SYNC_INTERVAL,
};
use crate::telemetry::{TelemetrySnapshot, TelemetryStore};

/// Default polling period.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default delay between two commands of one tick.
pub const DEFAULT_COMMAND_PACING: Duration = Duration::from_millis(150);

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    /// No session.
    #[default]
    Idle,
    /// Opening the subscription.
    Starting,
    /// Polling and decoding.
    Active,
    /// Tearing down.
    Stopping,
}

impl SessionState {
    /// Check if the session is polling.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Starting => write!(f, "Starting"),
            Self::Active => write!(f, "Active"),
            Self::Stopping => write!(f, "Stopping"),
        }
    }
}

/// What a session needs to start.
///
/// Missing pieces make [`SessionController::start`] a no-op rather than an
/// error.
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    /// The connected adapter.
    pub device: Option<DeviceHandle>,
    /// Resolved write/notify characteristics.
    pub characteristics: Option<CharacteristicPair>,
    /// PID commands to poll, in order.
    pub pids: Vec<String>,
}

impl SessionRequest {
    /// Build a complete request.
    pub fn new(
        device: DeviceHandle,
        characteristics: CharacteristicPair,
        pids: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            device: Some(device),
            characteristics: Some(characteristics),
            pids: pids.into_iter().map(Into::into).collect(),
        }
    }
}

/// Scheduler timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTiming {
    /// Period of the polling timer.
    pub poll_interval: Duration,
    /// Delay between commands within one tick.
    pub command_pacing: Duration,
    /// Delay after each init command.
    pub settle_delay: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            command_pacing: DEFAULT_COMMAND_PACING,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

/// Counters accumulated across sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Polling ticks run.
    pub ticks: u64,
    /// Notifications that produced at least one metric.
    pub replies_decoded: u64,
    /// Notifications that produced none.
    pub replies_ignored: u64,
    /// Commands that failed in both write modes.
    pub write_failures: u64,
}

#[derive(Default)]
struct Counters {
    ticks: AtomicU64,
    replies_decoded: AtomicU64,
    replies_ignored: AtomicU64,
    write_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SessionStats {
        SessionStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            replies_decoded: self.replies_decoded.load(Ordering::Relaxed),
            replies_ignored: self.replies_ignored.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}

/// Callback handle for unregistering callbacks.
///
/// Dropping the handle unregisters the callback.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// Resources owned by an active session.
struct ActiveSession {
    channel: CommandChannel,
    /// Runtime the session was started on; the sync task runs there too.
    runtime: Handle,
    poll_task: JoinHandle<()>,
    listen_task: JoinHandle<()>,
}

impl ActiveSession {
    fn abort(&self) {
        self.poll_task.abort();
        self.listen_task.abort();
    }
}

struct Inner {
    state: SessionState,
    /// Bumped on every start and teardown; tasks of an older generation
    /// stop touching shared state.
    generation: u64,
    active: Option<ActiveSession>,
    sync_session: Option<String>,
    sync_task: Option<JoinHandle<()>>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    registry: DecoderRegistry,
    store: TelemetryStore,
    timing: SessionTiming,
    upstream: Option<UpstreamSync>,
    inner: Mutex<Inner>,
    /// Held across every subscribe and unsubscribe so that a teardown never
    /// removes a subscription a newer session opened.
    lifecycle: tokio::sync::Mutex<()>,
    state_tx: broadcast::Sender<SessionState>,
    metric_tx: broadcast::Sender<ParsedMetric>,
    counters: Counters,
    callback_counter: AtomicU64,
}

impl Shared {
    fn transition(&self, inner: &mut Inner, to: SessionState) {
        let from = std::mem::replace(&mut inner.state, to);
        if from != to {
            debug!("Session state changed: {} -> {}", from, to);
            let _ = self.state_tx.send(to);
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        let inner = self.inner.lock();
        inner.generation == generation && inner.state.is_active()
    }

    /// Start or replace the sync task if both an id and an active session exist.
    fn restart_sync(&self, inner: &mut Inner) {
        if let Some(task) = inner.sync_task.take() {
            task.abort();
        }

        if !inner.state.is_active() {
            return;
        }

        let Some(runtime) = inner.active.as_ref().map(|a| a.runtime.clone()) else {
            return;
        };

        match (&self.upstream, &inner.sync_session) {
            (Some(upstream), Some(session_id)) => {
                inner.sync_task = Some(upstream.spawn_on(&runtime, session_id.clone()));
            }
            (None, Some(_)) => debug!("No collector configured, upstream sync disabled"),
            _ => {}
        }
    }

    fn handle_notification(&self, generation: u64, payload: &[u8]) {
        trace!("Notification {:02X?}", payload);
        let metrics = self.registry.parse_notification(payload);

        let inner = self.inner.lock();
        if inner.generation != generation || !inner.state.is_active() {
            return;
        }

        if metrics.is_empty() {
            Counters::bump(&self.counters.replies_ignored);
            trace!("Ignored reply {:?}", String::from_utf8_lossy(payload));
            return;
        }

        Counters::bump(&self.counters.replies_decoded);
        for metric in &metrics {
            debug!("{} = {} {}", metric.name, metric.value, metric.unit);
            self.store.apply(metric);
            let _ = self.metric_tx.send(*metric);
        }
    }

    /// Tear the session down after the subscription failed.
    async fn fail(&self, generation: u64, reason: &str) {
        let _lifecycle = self.lifecycle.lock().await;
        let active = {
            let mut inner = self.inner.lock();
            if inner.generation != generation || !inner.state.is_active() {
                return;
            }
            inner.generation += 1;
            let active = inner.active.take();
            if let Some(active) = &active {
                active.poll_task.abort();
            }
            if let Some(task) = inner.sync_task.take() {
                task.abort();
            }
            self.store.clear();
            self.transition(&mut inner, SessionState::Idle);
            active
        };

        error!("Notification channel failed, session stopped: {}", reason);

        if let Some(active) = active {
            unsubscribe(self.transport.as_ref(), &active.channel).await;
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(active) = inner.active.take() {
            active.abort();
        }
        if let Some(task) = inner.sync_task.take() {
            task.abort();
        }
    }
}

async fn unsubscribe(transport: &dyn Transport, channel: &CommandChannel) {
    let characteristics = channel.characteristics();
    if let Err(e) = transport
        .unsubscribe(
            channel.device(),
            characteristics.service,
            characteristics.notify,
        )
        .await
    {
        warn!("Failed to unsubscribe: {}", e);
    }
}

/// Builder for [`SessionController`].
pub struct SessionBuilder {
    transport: Arc<dyn Transport>,
    registry: DecoderRegistry,
    store: TelemetryStore,
    timing: SessionTiming,
    collector: Option<Arc<dyn Collector>>,
    device_id: String,
    sync_interval: Duration,
}

impl SessionBuilder {
    /// Use a custom decoder registry.
    pub fn registry(mut self, registry: DecoderRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Use an existing store.
    pub fn store(mut self, store: TelemetryStore) -> Self {
        self.store = store;
        self
    }

    /// Set the scheduler timings. A zero poll interval is raised to 1 ms.
    pub fn timing(mut self, timing: SessionTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Publish snapshots to `collector` while a sync session is set.
    pub fn collector(mut self, collector: Arc<dyn Collector>) -> Self {
        self.collector = Some(collector);
        self
    }

    /// Device identifier sent upstream.
    pub fn device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    /// Upstream sync period. A zero period is raised to 1 ms.
    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Build the controller.
    pub fn build(mut self) -> SessionController {
        self.timing.poll_interval = non_zero_period("poll interval", self.timing.poll_interval);
        let upstream = self.collector.map(|collector| {
            UpstreamSync::new(
                self.store.clone(),
                collector,
                self.device_id,
                self.sync_interval,
            )
        });

        let (state_tx, _) = broadcast::channel(16);
        let (metric_tx, _) = broadcast::channel(256);

        SessionController {
            shared: Arc::new(Shared {
                transport: self.transport,
                registry: self.registry,
                store: self.store,
                timing: self.timing,
                upstream,
                inner: Mutex::new(Inner {
                    state: SessionState::Idle,
                    generation: 0,
                    active: None,
                    sync_session: None,
                    sync_task: None,
                }),
                lifecycle: tokio::sync::Mutex::new(()),
                state_tx,
                metric_tx,
                counters: Counters::default(),
                callback_counter: AtomicU64::new(0),
            }),
        }
    }
}

/// Owns the monitoring session and everything it runs.
#[derive(Clone)]
pub struct SessionController {
    shared: Arc<Shared>,
}

impl SessionController {
    /// Create a controller with default timings and no collector.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::builder(transport).build()
    }

    /// Start building a controller.
    pub fn builder(transport: Arc<dyn Transport>) -> SessionBuilder {
        SessionBuilder {
            transport,
            registry: DecoderRegistry::standard(),
            store: TelemetryStore::new(),
            timing: SessionTiming::default(),
            collector: None,
            device_id: DEFAULT_DEVICE_ID.to_string(),
            sync_interval: DEFAULT_SYNC_INTERVAL,
        }
    }

    /// Start a session.
    ///
    /// Returns `Ok(false)` when the request is incomplete or a session is
    /// already running, and `Ok(true)` once the session is active.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the notification subscription cannot
    /// be opened. The session stays idle.
    pub async fn start(&self, request: SessionRequest) -> Result<bool> {
        let (device, characteristics) = match (request.device, request.characteristics) {
            (Some(device), Some(characteristics)) if !request.pids.is_empty() => {
                (device, characteristics)
            }
            _ => {
                debug!("Incomplete session request, not starting");
                return Ok(false);
            }
        };
        let pids = request.pids;

        let _lifecycle = self.shared.lifecycle.lock().await;
        let generation = {
            let mut inner = self.shared.inner.lock();
            if inner.state != SessionState::Idle {
                debug!("Session is {}, ignoring start", inner.state);
                return Ok(false);
            }
            inner.generation += 1;
            self.shared.transition(&mut inner, SessionState::Starting);
            inner.generation
        };

        info!(
            "Starting session on {} polling {:?}",
            device.display_name(),
            pids
        );

        let channel = CommandChannel::new(
            self.shared.transport.clone(),
            device.clone(),
            characteristics,
        );

        let stream = match self
            .shared
            .transport
            .monitor(&device, characteristics.service, characteristics.notify)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to subscribe to notifications: {}", e);
                let mut inner = self.shared.inner.lock();
                if inner.generation == generation {
                    self.shared.transition(&mut inner, SessionState::Idle);
                }
                return Err(e);
            }
        };

        let started = {
            let mut inner = self.shared.inner.lock();
            if inner.generation == generation && inner.state == SessionState::Starting {
                let weak = Arc::downgrade(&self.shared);
                inner.active = Some(ActiveSession {
                    listen_task: tokio::spawn(listen(weak.clone(), generation, stream)),
                    poll_task: tokio::spawn(poll(
                        weak,
                        generation,
                        channel.clone(),
                        pids,
                        self.shared.timing,
                    )),
                    channel: channel.clone(),
                    runtime: Handle::current(),
                });
                self.shared.transition(&mut inner, SessionState::Active);
                self.shared.restart_sync(&mut inner);
                true
            } else {
                false
            }
        };

        if started {
            info!("Session active");
        } else {
            debug!("Session stopped while starting");
            unsubscribe(self.shared.transport.as_ref(), &channel).await;
        }

        Ok(started)
    }

    /// Stop the session.
    ///
    /// Cancels the poller, the listener and the sync task before anything
    /// else, then removes the subscription and empties the store. Safe to
    /// call in any state.
    pub async fn stop(&self) {
        let active = {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                SessionState::Idle | SessionState::Stopping => {
                    debug!("Session is {}, ignoring stop", inner.state);
                    return;
                }
                SessionState::Starting => {
                    inner.generation += 1;
                    self.shared.transition(&mut inner, SessionState::Idle);
                    return;
                }
                SessionState::Active => {}
            }

            inner.generation += 1;
            self.shared.transition(&mut inner, SessionState::Stopping);

            let active = inner.active.take();
            if let Some(active) = &active {
                active.abort();
            }
            if let Some(task) = inner.sync_task.take() {
                task.abort();
            }
            self.shared.store.clear();
            active
        };

        if let Some(active) = active {
            let _lifecycle = self.shared.lifecycle.lock().await;
            unsubscribe(self.shared.transport.as_ref(), &active.channel).await;
        }

        let mut inner = self.shared.inner.lock();
        self.shared.transition(&mut inner, SessionState::Idle);
        info!("Session stopped");
    }

    /// Set or clear the session identifier upstream sync publishes under.
    ///
    /// Setting the current identifier again keeps the running timer. The
    /// sync task runs on the runtime the session was started on, so this
    /// may be called from any thread.
    pub fn set_sync_session(&self, session_id: Option<String>) {
        let mut inner = self.shared.inner.lock();
        if inner.sync_session == session_id {
            return;
        }

        debug!("Sync session changed to {:?}", session_id);
        inner.sync_session = session_id;
        self.shared.restart_sync(&mut inner);
    }

    /// Current sync session identifier.
    pub fn sync_session(&self) -> Option<String> {
        self.shared.inner.lock().sync_session.clone()
    }

    /// Check whether upstream sync is running.
    pub fn is_syncing(&self) -> bool {
        self.shared.inner.lock().sync_task.is_some()
    }

    /// The shared telemetry store.
    pub fn store(&self) -> &TelemetryStore {
        &self.shared.store
    }

    /// Copy of the latest telemetry.
    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.shared.store.snapshot()
    }

    /// Check whether a session is active.
    pub fn is_monitoring(&self) -> bool {
        self.state().is_active()
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.shared.inner.lock().state
    }

    /// Counters since the controller was created.
    pub fn stats(&self) -> SessionStats {
        self.shared.counters.snapshot()
    }

    /// Subscribe to state changes.
    pub fn subscribe_state(&self) -> broadcast::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    /// Subscribe to decoded metrics as they are stored.
    pub fn subscribe_metrics(&self) -> broadcast::Receiver<ParsedMetric> {
        self.shared.metric_tx.subscribe()
    }

    /// Register a callback for every decoded metric.
    ///
    /// Returns a handle that can be used to unregister the callback.
    pub fn on_metric<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&ParsedMetric) + Send + Sync + 'static,
    {
        let callback_id = self.shared.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.shared.metric_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(metric) => callback(&metric),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Metric callback lagged, skipped {} metrics", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Register a callback for state changes.
    pub fn on_state_changed<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(SessionState) + Send + Sync + 'static,
    {
        let callback_id = self.shared.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.shared.state_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(state) => callback(state),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("state", &self.state())
            .field("timing", &self.shared.timing)
            .finish_non_exhaustive()
    }
}

/// Decode every notification until the subscription ends or fails.
async fn listen(weak: Weak<Shared>, generation: u64, mut stream: NotificationStream) {
    while let Some(item) = stream.next().await {
        let Some(shared) = weak.upgrade() else {
            return;
        };

        match item {
            Ok(payload) => shared.handle_notification(generation, &payload),
            Err(e) => {
                shared.fail(generation, &e.to_string()).await;
                return;
            }
        }
    }

    if let Some(shared) = weak.upgrade() {
        shared.fail(generation, "notification stream ended").await;
    }
}

/// Run the init sequence, then write every PID once per tick.
async fn poll(
    shared: Weak<Shared>,
    generation: u64,
    channel: CommandChannel,
    pids: Vec<String>,
    timing: SessionTiming,
) {
    channel.initialize(timing.settle_delay).await;

    let mut ticker = tokio::time::interval(timing.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        match shared.upgrade() {
            Some(shared) if shared.is_current(generation) => {
                Counters::bump(&shared.counters.ticks);
            }
            _ => return,
        }
        trace!("Poll tick");

        for (index, pid) in pids.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(timing.command_pacing).await;
            }

            match shared.upgrade() {
                Some(shared) if shared.is_current(generation) => {}
                _ => return,
            }

            if let Err(e) = channel.send_command(pid).await {
                warn!("Skipping {}: {}", pid, e);
                if let Some(shared) = shared.upgrade() {
                    Counters::bump(&shared.counters.write_failures);
                }
            }
        }
    }
}
