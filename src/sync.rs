//! Periodic upstream publishing of telemetry snapshots.
//!
//! The sync task is created once per session identifier and reads the store
//! through its shared handle on every tick, so it always publishes the
//! latest values no matter how long ago the timer was started.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::telemetry::{TelemetrySnapshot, TelemetryStore};

/// Default sync period.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5);

/// Default HTTP request timeout for the collector.
pub const DEFAULT_COLLECTOR_TIMEOUT: Duration = Duration::from_secs(10);

/// Device identifier sent with every payload unless configured otherwise.
pub const DEFAULT_DEVICE_ID: &str = "obd-ble-monitor";

/// Shortest period a timer accepts.
pub(crate) const MIN_PERIOD: Duration = Duration::from_millis(1);

/// `period`, raised to [`MIN_PERIOD`] if it is zero.
pub(crate) fn non_zero_period(name: &str, period: Duration) -> Duration {
    if period < MIN_PERIOD {
        warn!("{} of {:?} raised to {:?}", name, period, MIN_PERIOD);
        MIN_PERIOD
    } else {
        period
    }
}

/// One upstream publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
    /// Session or trip the readings belong to.
    pub session_id: String,
    /// Identifier of this monitor.
    pub device_id: String,
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// Latest value per metric name.
    pub data: TelemetrySnapshot,
}

/// Receiver of telemetry snapshots.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Publish one payload.
    async fn publish(&self, payload: &SyncPayload) -> Result<()>;
}

/// Collector that POSTs JSON payloads to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpCollector {
    client: Client,
    url: Url,
}

impl HttpCollector {
    /// Create a collector for `url` with a request timeout.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParameter`] if `url` does not parse, or
    /// [`Error::Sync`] if the HTTP client cannot be built.
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| Error::InvalidParameter {
            name: "collector_url".to_string(),
            value: format!("{} ({})", url, e),
        })?;

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self { client, url })
    }

    /// The endpoint payloads are posted to.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Collector for HttpCollector {
    #[instrument(skip(self, payload), fields(session_id = %payload.session_id))]
    async fn publish(&self, payload: &SyncPayload) -> Result<()> {
        let response = self
            .client
            .post(self.url.clone())
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        debug!("Collector responded {}: {}", status, body);

        if status.is_success() {
            Ok(())
        } else {
            Err(Error::Sync {
                message: format!("collector returned {}", status),
            })
        }
    }
}

/// Publishes store snapshots to a collector on a fixed period.
#[derive(Clone)]
pub struct UpstreamSync {
    store: TelemetryStore,
    collector: Arc<dyn Collector>,
    device_id: String,
    interval: Duration,
}

impl UpstreamSync {
    /// Create a sync over `store`. A zero `interval` is raised to 1 ms.
    pub fn new(
        store: TelemetryStore,
        collector: Arc<dyn Collector>,
        device_id: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            collector,
            device_id: device_id.into(),
            interval: non_zero_period("sync interval", interval),
        }
    }

    /// The sync period.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Publish the current snapshot once.
    ///
    /// Returns `Ok(false)` without publishing when the store is empty.
    pub async fn sync_once(&self, session_id: &str) -> Result<bool> {
        let data = self.store.snapshot();
        if data.is_empty() {
            debug!("No telemetry yet, skipping sync");
            return Ok(false);
        }

        let payload = SyncPayload {
            session_id: session_id.to_string(),
            device_id: self.device_id.clone(),
            timestamp: Utc::now(),
            data,
        };

        self.collector.publish(&payload).await?;
        debug!("Synced {} metrics for session {}", payload.data.len(), session_id);
        Ok(true)
    }

    /// Start the periodic task for `session_id` on the current runtime.
    ///
    /// The first publish happens one period after the call. Failed publishes
    /// are logged and the next tick runs as usual.
    ///
    /// # Panics
    ///
    /// Outside a tokio runtime; use [`spawn_on`](Self::spawn_on) there.
    pub fn spawn(&self, session_id: String) -> JoinHandle<()> {
        self.spawn_on(&Handle::current(), session_id)
    }

    /// Start the periodic task for `session_id` on `runtime`.
    pub fn spawn_on(&self, runtime: &Handle, session_id: String) -> JoinHandle<()> {
        let _entered = runtime.enter();
        let sync = self.clone();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Starting upstream sync for session {} every {:?}",
            session_id, self.interval
        );

        runtime.spawn(async move {
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = sync.sync_once(&session_id).await {
                    warn!("Upstream sync for session {} failed: {}", session_id, e);
                }
            }
        })
    }
}

impl std::fmt::Debug for UpstreamSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamSync")
            .field("device_id", &self.device_id)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::pid::ParsedMetric;
    use crate::testing::RecordingCollector;
    use pretty_assertions::assert_eq;

    fn speed(value: f64) -> ParsedMetric {
        ParsedMetric {
            pid: 0x0D,
            name: "Vehicle Speed",
            value,
            unit: "km/h",
        }
    }

    fn sync_over(store: &TelemetryStore, collector: Arc<RecordingCollector>) -> UpstreamSync {
        UpstreamSync::new(
            store.clone(),
            collector,
            DEFAULT_DEVICE_ID,
            DEFAULT_SYNC_INTERVAL,
        )
    }

    #[tokio::test]
    async fn test_sync_once_skips_empty_store() {
        let store = TelemetryStore::new();
        let collector = Arc::new(RecordingCollector::new());
        let sync = sync_over(&store, collector.clone());

        assert!(!sync.sync_once("trip-1").await.unwrap());
        assert_eq!(collector.attempts(), 0);
    }

    #[tokio::test]
    async fn test_sync_once_publishes_snapshot() {
        let store = TelemetryStore::new();
        store.apply(&speed(60.0));
        let collector = Arc::new(RecordingCollector::new());
        let sync = sync_over(&store, collector.clone());

        assert!(sync.sync_once("trip-1").await.unwrap());

        let payloads = collector.payloads();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].session_id, "trip-1");
        assert_eq!(payloads[0].device_id, DEFAULT_DEVICE_ID);
        assert_eq!(payloads[0].data, store.snapshot());
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_sends_while_empty() {
        let store = TelemetryStore::new();
        let collector = Arc::new(RecordingCollector::new());
        let handle = sync_over(&store, collector.clone()).spawn("trip-1".to_string());

        tokio::time::sleep(Duration::from_secs(26)).await;
        assert_eq!(collector.attempts(), 0);

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sees_updates_made_after_timer_started() {
        let store = TelemetryStore::new();
        let collector = Arc::new(RecordingCollector::new());
        let handle = sync_over(&store, collector.clone()).spawn("trip-1".to_string());

        tokio::time::sleep(Duration::from_secs(1)).await;
        store.apply(&speed(42.0));
        tokio::time::sleep(Duration::from_secs(5)).await;

        let payloads = collector.payloads();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].data.get("Vehicle Speed").unwrap().value, 42.0);

        store.apply(&speed(80.0));
        tokio::time::sleep(Duration::from_secs(5)).await;

        let payloads = collector.payloads();
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[1].data.get("Vehicle Speed").unwrap().value, 80.0);

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_cancel_ticks() {
        let store = TelemetryStore::new();
        store.apply(&speed(10.0));
        let collector = Arc::new(RecordingCollector::failing());
        let handle = sync_over(&store, collector.clone()).spawn("trip-1".to_string());

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(collector.attempts(), 3);
        assert!(collector.payloads().is_empty());

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_raised() {
        let store = TelemetryStore::new();
        store.apply(&speed(10.0));
        let collector = Arc::new(RecordingCollector::new());
        let sync = UpstreamSync::new(store, collector.clone(), DEFAULT_DEVICE_ID, Duration::ZERO);
        assert_eq!(sync.interval(), MIN_PERIOD);

        let handle = sync.spawn("trip-1".to_string());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(collector.attempts() >= 1);

        handle.abort();
    }

    #[test]
    fn test_spawn_on_from_outside_the_runtime() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let store = TelemetryStore::new();
        store.apply(&speed(10.0));
        let collector = Arc::new(RecordingCollector::new());
        let sync = UpstreamSync::new(
            store,
            collector.clone(),
            DEFAULT_DEVICE_ID,
            Duration::from_millis(10),
        );

        let handle = sync.spawn_on(runtime.handle(), "trip-1".to_string());
        runtime.block_on(async { tokio::time::sleep(Duration::from_millis(35)).await });
        assert!(collector.attempts() >= 1);

        handle.abort();
    }

    #[test]
    fn test_payload_json_shape() {
        let data: TelemetrySnapshot = [(
            "Engine RPM".to_string(),
            crate::telemetry::MetricValue {
                value: 1726.0,
                unit: "rpm".to_string(),
            },
        )]
        .into_iter()
        .collect();
        let payload = SyncPayload {
            session_id: "trip-1".to_string(),
            device_id: DEFAULT_DEVICE_ID.to_string(),
            timestamp: DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            data,
        };

        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            serde_json::json!({
                "session_id": "trip-1",
                "device_id": "obd-ble-monitor",
                "timestamp": "2024-05-01T12:00:00Z",
                "data": {"Engine RPM": {"value": 1726.0, "unit": "rpm"}}
            })
        );
    }

    #[test]
    fn test_http_collector_rejects_bad_url() {
        let err = HttpCollector::new("not a url", DEFAULT_COLLECTOR_TIMEOUT).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter { .. }));

        let collector =
            HttpCollector::new("http://localhost:8080/telemetry", DEFAULT_COLLECTOR_TIMEOUT)
                .unwrap();
        assert_eq!(collector.url().path(), "/telemetry");
    }
}
