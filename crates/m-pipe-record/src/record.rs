//! ---
//! mpipe_section: "02-record-data-model"
//! mpipe_subsection: "module"
//! mpipe_type: "source"
//! mpipe_scope: "code"
//! mpipe_description: "Metric record model and topic identities."
//! mpipe_version: "v0.0.0-prealpha"
//! mpipe_owner: "tbd"
//! ---
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Aggregation semantics of a single metric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Values are summed across reports.
    Counter,
    /// The most recent value wins.
    Gauge,
}

/// One named measurement within a metric record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricValue {
    /// Dotted metric name, e.g. `metrics.process.count`.
    pub name: String,
    /// Counter or gauge semantics.
    pub kind: MetricKind,
    /// Reported value.
    pub value: i64,
}

impl MetricValue {
    /// Construct a counter value.
    pub fn counter(name: impl Into<String>, value: i64) -> Self {
        Self {
            name: name.into(),
            kind: MetricKind::Counter,
            value,
        }
    }

    /// Construct a gauge value.
    pub fn gauge(name: impl Into<String>, value: i64) -> Self {
        Self {
            name: name.into(),
            kind: MetricKind::Gauge,
            value,
        }
    }
}

/// A decoded, immutable metric record: a tag context, a second-resolution
/// timestamp, and one or more named values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricRecord {
    /// Tag key/value pairs identifying the emitting context.
    #[serde(default)]
    pub tags: IndexMap<String, String>,
    /// Epoch seconds at which the values were observed.
    pub timestamp: i64,
    /// Named measurements carried by this record.
    pub values: Vec<MetricValue>,
}

impl MetricRecord {
    /// Assemble a record from its parts.
    pub fn new(
        tags: IndexMap<String, String>,
        timestamp: i64,
        values: Vec<MetricValue>,
    ) -> Self {
        Self {
            tags,
            timestamp,
            values,
        }
    }
}
