//! Latest-value telemetry store.
//!
//! Holds one value per metric name and nothing else: a new reading replaces
//! the old one and no history is kept. The store is a cheap handle over
//! shared state, so the notification handler, the upstream sync task and
//! consumers all read and write the same map.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::protocol::pid::ParsedMetric;

/// The latest value of one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    /// Decoded value.
    pub value: f64,
    /// Unit of `value`.
    pub unit: String,
}

impl From<&ParsedMetric> for MetricValue {
    fn from(metric: &ParsedMetric) -> Self {
        Self {
            value: metric.value,
            unit: metric.unit.to_string(),
        }
    }
}

/// Immutable copy of the store at one instant, ordered by metric name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TelemetrySnapshot(BTreeMap<String, MetricValue>);

impl TelemetrySnapshot {
    /// Get one metric.
    pub fn get(&self, name: &str) -> Option<&MetricValue> {
        self.0.get(name)
    }

    /// Number of metrics.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check whether the snapshot holds no metrics.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over metrics in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetricValue)> {
        self.0.iter()
    }

    /// Metric names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Consume the snapshot into its map.
    pub fn into_inner(self) -> BTreeMap<String, MetricValue> {
        self.0
    }
}

impl FromIterator<(String, MetricValue)> for TelemetrySnapshot {
    fn from_iter<I: IntoIterator<Item = (String, MetricValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl std::fmt::Display for TelemetrySnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (name, metric) in &self.0 {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{}: {:.1} {}", name, metric.value, metric.unit)?;
        }
        Ok(())
    }
}

/// Shared latest-value map keyed by metric name.
///
/// Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct TelemetryStore {
    metrics: Arc<RwLock<HashMap<String, MetricValue>>>,
}

impl TelemetryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a decoded metric, replacing any earlier value of the same name.
    pub fn apply(&self, metric: &ParsedMetric) {
        self.metrics
            .write()
            .insert(metric.name.to_string(), MetricValue::from(metric));
    }

    /// Get the latest value of one metric.
    pub fn get(&self, name: &str) -> Option<MetricValue> {
        self.metrics.read().get(name).cloned()
    }

    /// Copy the current contents.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.metrics
            .read()
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// Remove every metric.
    pub fn clear(&self) {
        self.metrics.write().clear();
    }

    /// Number of metrics held.
    pub fn len(&self) -> usize {
        self.metrics.read().len()
    }

    /// Check whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.metrics.read().is_empty()
    }
}
