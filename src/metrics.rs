//! Metric set and wire record types
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::IngestError;

/// Name of the counter incremented on every runtime sample
pub const POLL_COUNT: &str = "PollCount";

/// The kind of a metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Instantaneous value, last write wins
    Gauge,
    /// Accumulated value, updates carry a delta
    Counter,
}

impl MetricKind {
    /// Wire name of this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gauge" => Ok(MetricKind::Gauge),
            "counter" => Ok(MetricKind::Counter),
            other => Err(IngestError::WrongMetricsType(other.to_string())),
        }
    }
}

/// All known counters and gauges
///
/// Cloning produces an independent deep copy, so a clone can be mutated or
/// serialized without holding whatever lock guards the original.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSet {
    #[serde(rename = "GaugeMetrics", default)]
    gauges: HashMap<String, f64>,

    #[serde(rename = "CounterMetrics", default)]
    counters: HashMap<String, i64>,
}

impl MetricSet {
    /// Create an empty metric set
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_counter(&mut self, name: impl Into<String>, value: i64) {
        self.counters.insert(name.into(), value);
    }

    pub fn get_counter(&self, name: &str) -> Option<i64> {
        self.counters.get(name).copied()
    }

    pub fn set_gauge(&mut self, name: impl Into<String>, value: f64) {
        self.gauges.insert(name.into(), value);
    }

    pub fn get_gauge(&self, name: &str) -> Option<f64> {
        self.gauges.get(name).copied()
    }

    /// Add `delta` to a counter, treating an absent counter as zero.
    /// Returns the new value.
    pub fn increment_counter(&mut self, name: &str, delta: i64) -> i64 {
        let entry = self.counters.entry(name.to_string()).or_insert(0);
        *entry = entry.wrapping_add(delta);
        *entry
    }

    /// Iterate over all gauges
    pub fn gauges(&self) -> impl Iterator<Item = (&str, f64)> {
        self.gauges.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Iterate over all counters
    pub fn counters(&self) -> impl Iterator<Item = (&str, i64)> {
        self.counters.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Names of all counters followed by names of all gauges
    pub fn names(&self) -> Vec<String> {
        self.counters
            .keys()
            .chain(self.gauges.keys())
            .cloned()
            .collect()
    }

    /// Total number of entries across both maps
    pub fn len(&self) -> usize {
        self.gauges.len() + self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gauges.is_empty() && self.counters.is_empty()
    }
}

/// A single metric observation as it travels over the wire
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    /// Metric name
    pub id: String,

    /// "gauge" or "counter"; kept as a string so unknown kinds can be reported
    #[serde(rename = "type")]
    pub mtype: String,

    /// Value, if counter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,

    /// Value, if gauge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,

    /// Lowercase hex HMAC of the record
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
}

impl MetricRecord {
    /// Create a gauge record
    pub fn gauge(id: impl Into<String>, value: f64) -> Self {
        Self {
            id: id.into(),
            mtype: MetricKind::Gauge.as_str().to_string(),
            value: Some(value),
            ..Default::default()
        }
    }

    /// Create a counter record
    pub fn counter(id: impl Into<String>, delta: i64) -> Self {
        Self {
            id: id.into(),
            mtype: MetricKind::Counter.as_str().to_string(),
            delta: Some(delta),
            ..Default::default()
        }
    }

    /// Parse the record's kind
    pub fn kind(&self) -> Result<MetricKind, IngestError> {
        self.mtype.parse()
    }

    /// Check that the value matching the kind is present
    pub fn validate(&self) -> Result<MetricKind, IngestError> {
        let kind = self.kind()?;
        match kind {
            MetricKind::Gauge if self.value.is_none() => Err(IngestError::WrongQuery(format!(
                "gauge {} has no value",
                self.id
            ))),
            MetricKind::Counter if self.delta.is_none() => Err(IngestError::WrongQuery(
                format!("counter {} has no delta", self.id),
            )),
            _ => Ok(kind),
        }
    }
}
