use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum accepted metric name length, in bytes.
pub const MAX_NAME_LEN: usize = 256;
/// Accepted metric values lie within `±MAX_VALUE_MAGNITUDE` and are finite.
pub const MAX_VALUE_MAGNITUDE: f64 = 1e15;
/// Maximum number of tags per metric.
pub const MAX_TAGS: usize = 32;
/// Maximum tag key or value length, in bytes.
pub const MAX_TAG_LEN: usize = 128;

/// A single timestamped, named numeric observation.
///
/// Immutable once constructed; validation happens in the batch parser before
/// a `Metric` ever exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// Observation instant, millisecond resolution.
    #[serde(with = "rfc3339_millis")]
    pub timestamp: DateTime<Utc>,
    /// Metric name, `[A-Za-z0-9._]+`, at most [`MAX_NAME_LEN`] bytes.
    pub name: String,
    /// Finite observation value within `±`[`MAX_VALUE_MAGNITUDE`].
    pub value: f64,
    /// Tag set, lexicographically ordered by key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

/// An ordered sequence of metrics attributed to one client.
///
/// The client identifier is the request's `Authorization` header value,
/// taken verbatim; it keys both rate limiting and partition routing.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricBatch {
    pub client_id: String,
    pub metrics: Vec<Metric>,
}

#[derive(Serialize)]
struct WireBatch<'a> {
    metrics: &'a [Metric],
}

impl MetricBatch {
    pub fn new(client_id: String, metrics: Vec<Metric>) -> Self {
        Self { client_id, metrics }
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Serialize to the wire shape `{"metrics":[…]}` used as the queue
    /// record payload.
    pub fn to_wire_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&WireBatch {
            metrics: &self.metrics,
        })
    }
}

/// RFC 3339 timestamps with exactly millisecond precision and a `Z` suffix.
mod rfc3339_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
