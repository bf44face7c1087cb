//! Client Sync Store
//!
//! Mirrors, per source, the full history received for the subscribed
//! instrument plus the strictly-new subset of the latest delta.
//!
//! # Merge Rules
//!
//! - The first batch after (re)subscription initializes each source:
//!   the series becomes the batch points and every point is new.
//! - Later batches merge incrementally: a point enters the series only if no
//!   existing point has the same time, and is reported as new only if it was
//!   absent before the merge.
//! - Subscribing (to any instrument, including the current one) clears every
//!   source back to empty.
//! - Batches for another instrument, or received while unsubscribed, are
//!   ignored.
//!
//! An optional retention horizon bounds history: after each merge points
//! older than `newest - horizon` are pruned, and incoming points older than
//! that cutoff are dropped so redelivery of pruned points stays a no-op.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, TimeDelta, Utc};

use super::streaming::{DataPoint, DeltaBatch};

// =============================================================================
// Series Buffer
// =============================================================================

/// Time-ordered, duplicate-free history for one source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesBuffer {
    points: Vec<DataPoint>,
}

impl SeriesBuffer {
    /// Insert a point unless one with the same time already exists.
    ///
    /// Returns `true` if the point was inserted.
    pub fn insert(&mut self, point: DataPoint) -> bool {
        match self.points.binary_search_by(|p| p.time.cmp(&point.time)) {
            Ok(_) => false,
            Err(idx) => {
                self.points.insert(idx, point);
                true
            }
        }
    }

    /// Whether a point with this time exists.
    #[must_use]
    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        self.points.binary_search_by(|p| p.time.cmp(&time)).is_ok()
    }

    /// Drop points strictly older than `cutoff`. Returns how many were removed.
    pub fn prune_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let idx = self.points.partition_point(|p| p.time < cutoff);
        self.points.drain(..idx);
        idx
    }

    /// Time of the newest point.
    #[must_use]
    pub fn newest(&self) -> Option<DateTime<Utc>> {
        self.points.last().map(|p| p.time)
    }

    /// Points ordered by time ascending.
    #[must_use]
    pub fn as_slice(&self) -> &[DataPoint] {
        &self.points
    }

    /// Number of points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    fn clear(&mut self) {
        self.points.clear();
    }
}

// =============================================================================
// Merge Results
// =============================================================================

/// Per-source state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourcePhase {
    /// No batch received since (re)subscription.
    Empty,
    /// At least one batch merged.
    Populated,
}

/// Kind of merge applied to a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    /// First batch after (re)subscription; consumers should fully redraw.
    Initialized,
    /// Subsequent batch; consumers may append the new points.
    Incremental,
}

/// Summary of one source's merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMerge {
    /// Source key.
    pub source: String,
    /// Initialization or incremental.
    pub kind: MergeKind,
    /// Number of points that were not already in the series.
    pub new_points: usize,
    /// Series length after the merge.
    pub series_len: usize,
}

/// Why a batch was not merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// No instrument is subscribed.
    NotSubscribed,
    /// Batch belongs to a different instrument (typically a late message from
    /// a previous subscription).
    InstrumentMismatch {
        /// Currently subscribed instrument.
        expected: String,
        /// Instrument tagged on the batch.
        received: String,
    },
}

/// Result of [`SyncStore::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Batch merged; one entry per source key in the batch.
    Applied(Vec<SourceMerge>),
    /// Batch discarded.
    Ignored(IgnoreReason),
}

// =============================================================================
// Sync Store
// =============================================================================

#[derive(Debug, Clone)]
struct SourceSync {
    phase: SourcePhase,
    series: SeriesBuffer,
    new_points: Vec<DataPoint>,
}

impl SourceSync {
    const fn empty() -> Self {
        Self {
            phase: SourcePhase::Empty,
            series: SeriesBuffer { points: Vec::new() },
            new_points: Vec::new(),
        }
    }
}

/// Client-side merge engine for one subscription.
#[derive(Debug, Clone, Default)]
pub struct SyncStore {
    instrument: Option<String>,
    sources: BTreeMap<String, SourceSync>,
    retention: Option<TimeDelta>,
}

impl SyncStore {
    /// Create an unsubscribed store with unbounded history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound history to `horizon` behind the newest point of each source.
    #[must_use]
    pub const fn with_retention(mut self, horizon: TimeDelta) -> Self {
        self.retention = Some(horizon);
        self
    }

    /// Start (or restart) a subscription, clearing every source.
    pub fn subscribe(&mut self, instrument: impl Into<String>) {
        let instrument = instrument.into();
        tracing::debug!(instrument = %instrument, "Sync store reset");
        self.instrument = Some(instrument);
        self.sources.clear();
    }

    /// Merge a delta batch.
    pub fn apply(&mut self, batch: DeltaBatch) -> ApplyOutcome {
        match self.instrument.as_deref() {
            None => return ApplyOutcome::Ignored(IgnoreReason::NotSubscribed),
            Some(expected) if expected != batch.instrument() => {
                return ApplyOutcome::Ignored(IgnoreReason::InstrumentMismatch {
                    expected: expected.to_string(),
                    received: batch.instrument().to_string(),
                });
            }
            Some(_) => {}
        }

        for state in self.sources.values_mut() {
            state.new_points.clear();
        }

        let retention = self.retention;
        let merges = batch
            .into_sources()
            .into_iter()
            .map(|delta| {
                let state = self
                    .sources
                    .entry(delta.source.clone())
                    .or_insert_with(SourceSync::empty);
                let kind = merge_source(state, delta.points, retention);
                SourceMerge {
                    source: delta.source,
                    kind,
                    new_points: state.new_points.len(),
                    series_len: state.series.len(),
                }
            })
            .collect();

        ApplyOutcome::Applied(merges)
    }

    /// Subscribed instrument, if any.
    #[must_use]
    pub fn instrument(&self) -> Option<&str> {
        self.instrument.as_deref()
    }

    /// Retention horizon, if bounded.
    #[must_use]
    pub const fn retention(&self) -> Option<TimeDelta> {
        self.retention
    }

    /// Full merged history for a source.
    #[must_use]
    pub fn series(&self, source: &str) -> &[DataPoint] {
        self.sources
            .get(source)
            .map_or(&[], |s| s.series.as_slice())
    }

    /// Points from the latest batch that were not previously known.
    #[must_use]
    pub fn new_points(&self, source: &str) -> &[DataPoint] {
        self.sources
            .get(source)
            .map_or(&[], |s| s.new_points.as_slice())
    }

    /// State of a source.
    #[must_use]
    pub fn phase(&self, source: &str) -> SourcePhase {
        self.sources
            .get(source)
            .map_or(SourcePhase::Empty, |s| s.phase)
    }

    /// Source keys seen since the last subscribe.
    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }
}

fn merge_source(
    state: &mut SourceSync,
    mut incoming: Vec<DataPoint>,
    retention: Option<TimeDelta>,
) -> MergeKind {
    let kind = match state.phase {
        SourcePhase::Empty => {
            state.series.clear();
            MergeKind::Initialized
        }
        SourcePhase::Populated => MergeKind::Incremental,
    };
    state.phase = SourcePhase::Populated;

    // Sort so the retention cutoff sees the batch's newest point first.
    incoming.sort_by_key(|p| p.time);

    let cutoff = retention.and_then(|horizon| {
        let newest = match (state.series.newest(), incoming.last().map(|p| p.time)) {
            (Some(a), Some(b)) => a.max(b),
            (a, b) => a.or(b)?,
        };
        Some(newest - horizon)
    });

    let mut seen = HashSet::with_capacity(incoming.len());
    for point in incoming {
        if cutoff.is_some_and(|c| point.time < c) || !seen.insert(point.time) {
            continue;
        }
        if state.series.insert(point.clone()) {
            state.new_points.push(point);
        }
    }

    if let Some(cutoff) = cutoff {
        let pruned = state.series.prune_before(cutoff);
        if pruned > 0 {
            tracing::trace!(pruned, "Pruned points past retention horizon");
        }
    }

    kind
}

// =============================================================================
// Tests
// =============================================================================
