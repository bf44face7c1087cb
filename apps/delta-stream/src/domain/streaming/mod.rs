//! Market Data Streaming Types
//!
//! Core domain types for delta streaming: data points and the per-tick
//! delta batch. These types are transport-agnostic and define the canonical
//! JSON shape pushed to viewers.
//!
//! # Wire Shape
//!
//! ```json
//! {
//!   "instrument": "btc",
//!   "price": [{"time": "2025-01-01T00:00:00Z", "open": 1.0, "close": 1.1}],
//!   "fear_greed": []
//! }
//! ```
//!
//! Every registered source key is present, possibly with an empty array.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// =============================================================================
// Data Point
// =============================================================================

/// A single fetched row: a timestamp plus source-specific fields.
///
/// Identified by `(source, time)` within a subscription's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Row timestamp (watermark column).
    pub time: DateTime<Utc>,
    /// Remaining row columns.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl DataPoint {
    /// Create a point with no extra fields.
    #[must_use]
    pub fn at(time: DateTime<Utc>) -> Self {
        Self {
            time,
            fields: Map::new(),
        }
    }

    /// Add a field.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

// =============================================================================
// Delta Batch
// =============================================================================

/// Points fetched for one source during one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDelta {
    /// Source key.
    pub source: String,
    /// Points ordered by time ascending.
    pub points: Vec<DataPoint>,
}

/// All newly fetched points across sources for one poll tick.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaBatch {
    instrument: String,
    sources: Vec<SourceDelta>,
}

impl DeltaBatch {
    /// Create an empty batch for an instrument.
    #[must_use]
    pub fn new(instrument: impl Into<String>) -> Self {
        Self {
            instrument: instrument.into(),
            sources: Vec::new(),
        }
    }

    /// Append a source's points. Keys are kept in insertion order.
    pub fn push(&mut self, source: impl Into<String>, points: Vec<DataPoint>) {
        self.sources.push(SourceDelta {
            source: source.into(),
            points,
        });
    }

    /// Builder form of [`DeltaBatch::push`].
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>, points: Vec<DataPoint>) -> Self {
        self.push(source, points);
        self
    }

    /// Instrument this batch was produced for.
    #[must_use]
    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    /// Per-source deltas in insertion order.
    #[must_use]
    pub fn sources(&self) -> &[SourceDelta] {
        &self.sources
    }

    /// Consume the batch into its per-source deltas.
    #[must_use]
    pub fn into_sources(self) -> Vec<SourceDelta> {
        self.sources
    }

    /// Points for one source, if the key is present.
    #[must_use]
    pub fn points(&self, source: &str) -> Option<&[DataPoint]> {
        self.sources
            .iter()
            .find(|d| d.source == source)
            .map(|d| d.points.as_slice())
    }

    /// Total number of points across sources.
    #[must_use]
    pub fn point_count(&self) -> usize {
        self.sources.iter().map(|d| d.points.len()).sum()
    }

    /// Whether every source is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.point_count() == 0
    }
}

impl Serialize for DeltaBatch {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.sources.len() + 1))?;
        map.serialize_entry("instrument", &self.instrument)?;
        for delta in &self.sources {
            map.serialize_entry(&delta.source, &delta.points)?;
        }
        map.end()
    }
}

#[derive(Deserialize)]
struct RawDeltaBatch {
    instrument: String,
    #[serde(flatten)]
    sources: BTreeMap<String, Vec<DataPoint>>,
}

impl<'de> Deserialize<'de> for DeltaBatch {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawDeltaBatch::deserialize(deserializer)?;
        if raw.instrument.is_empty() {
            return Err(de::Error::custom("delta batch instrument is empty"));
        }
        Ok(Self {
            instrument: raw.instrument,
            sources: raw
                .sources
                .into_iter()
                .map(|(source, points)| SourceDelta { source, points })
                .collect(),
        })
    }
}

impl fmt::Display for DeltaBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} sources, {} points)",
            self.instrument,
            self.sources.len(),
            self.point_count()
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
