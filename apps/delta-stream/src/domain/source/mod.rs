//! Source Registry
//!
//! Static enumeration of the time-series datasets a subscription polls.
//! Each source declares its wire key, backing table, fetch scope, watermark
//! column and default lookback window.
//!
//! # Design
//!
//! Sources are registered once at process start and never change. The
//! registry preserves registration order, which is the order sources are
//! queried within a poll tick and the order their keys appear on the wire.
//! New datasets are added by registering a [`Source`], not by editing the
//! poller.

use std::collections::HashSet;

use chrono::TimeDelta;

// =============================================================================
// Source
// =============================================================================

/// How a source's rows relate to the subscribed instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceScope {
    /// Rows are filtered by the subscription's instrument.
    PerInstrument,
    /// Rows are shared by every instrument (the instrument is ignored).
    Global,
}

impl SourceScope {
    /// Get the scope name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PerInstrument => "per_instrument",
            Self::Global => "global",
        }
    }
}

/// A single time-series dataset exposed through the uniform fetch contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    key: &'static str,
    table: &'static str,
    scope: SourceScope,
    watermark_column: &'static str,
    lookback: TimeDelta,
}

impl Source {
    /// Default watermark column shared by all standard sources.
    pub const DEFAULT_WATERMARK_COLUMN: &'static str = "time";

    /// Create an instrument-scoped source.
    #[must_use]
    pub const fn per_instrument(key: &'static str, table: &'static str, lookback: TimeDelta) -> Self {
        Self {
            key,
            table,
            scope: SourceScope::PerInstrument,
            watermark_column: Self::DEFAULT_WATERMARK_COLUMN,
            lookback,
        }
    }

    /// Create a global source.
    #[must_use]
    pub const fn global(key: &'static str, table: &'static str, lookback: TimeDelta) -> Self {
        Self {
            key,
            table,
            scope: SourceScope::Global,
            watermark_column: Self::DEFAULT_WATERMARK_COLUMN,
            lookback,
        }
    }

    /// Override the watermark column.
    #[must_use]
    pub const fn with_watermark_column(mut self, column: &'static str) -> Self {
        self.watermark_column = column;
        self
    }

    /// Key used on the wire and in watermark maps.
    #[must_use]
    pub const fn key(&self) -> &'static str {
        self.key
    }

    /// Backing table name.
    #[must_use]
    pub const fn table(&self) -> &'static str {
        self.table
    }

    /// Fetch scope.
    #[must_use]
    pub const fn scope(&self) -> SourceScope {
        self.scope
    }

    /// Column compared against the watermark.
    #[must_use]
    pub const fn watermark_column(&self) -> &'static str {
        self.watermark_column
    }

    /// Initial lookback used to seed a fresh watermark.
    #[must_use]
    pub const fn lookback(&self) -> TimeDelta {
        self.lookback
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Keys reserved by the delta message envelope.
const RESERVED_KEYS: &[&str] = &["instrument", "error", "reason"];

/// Ordered, immutable set of sources.
///
/// # Example
///
/// ```rust
/// use delta_stream::domain::source::SourceRegistry;
///
/// let registry = SourceRegistry::standard();
/// let keys: Vec<_> = registry.keys().collect();
/// assert_eq!(keys.first(), Some(&"delta_surfaces"));
/// assert_eq!(keys.last(), Some(&"fear_greed"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    sources: Vec<Source>,
}

impl SourceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sources: Vec::new(),
        }
    }

    /// The standard market data sources.
    ///
    /// Instrument-scoped sources look back 7 days; the global sentiment
    /// index looks back 100 days.
    #[must_use]
    pub fn standard() -> Self {
        let week = TimeDelta::days(7);
        Self {
            sources: vec![
                Source::per_instrument("delta_surfaces", "amberdata_delta_surfaces", week),
                Source::per_instrument("funding_data", "deribit_funding_data", week),
                Source::per_instrument("skew_data", "laevitas_25delta_skew", week),
                Source::per_instrument("weighted_funding", "laevitas_weighted_funding", week),
                Source::per_instrument("price", "binance_ohlcv", week),
                Source::global("fear_greed", "fear_greed_index", TimeDelta::days(100)),
            ],
        }
    }

    /// Register a source.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is already registered, is reserved by
    /// the message envelope, or if any identifier is not a plain SQL name.
    pub fn register(&mut self, source: Source) -> Result<(), SourceError> {
        if RESERVED_KEYS.contains(&source.key) {
            return Err(SourceError::ReservedKey(source.key));
        }
        if self.get(source.key).is_some() {
            return Err(SourceError::DuplicateKey(source.key));
        }
        for identifier in [source.key, source.table, source.watermark_column] {
            if !is_plain_identifier(identifier) {
                return Err(SourceError::InvalidIdentifier(identifier));
            }
        }
        if source.lookback <= TimeDelta::zero() {
            return Err(SourceError::NonPositiveLookback(source.key));
        }

        self.sources.push(source);
        Ok(())
    }

    /// Build a registry from sources, validating each.
    ///
    /// # Errors
    ///
    /// Returns the first registration error encountered.
    pub fn from_sources(sources: impl IntoIterator<Item = Source>) -> Result<Self, SourceError> {
        let mut registry = Self::new();
        for source in sources {
            registry.register(source)?;
        }
        Ok(registry)
    }

    /// Look up a source by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.key == key)
    }

    /// Iterate sources in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Source> {
        self.sources.iter()
    }

    /// Iterate source keys in registration order.
    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.sources.iter().map(Source::key)
    }

    /// Number of registered sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Whether no sources are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Check that keys are unique. Always true for registries built through
    /// [`SourceRegistry::register`].
    #[must_use]
    pub fn has_unique_keys(&self) -> bool {
        let mut seen = HashSet::new();
        self.sources.iter().all(|s| seen.insert(s.key))
    }
}

fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Source registration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// A source with the same key already exists.
    #[error("source key already registered: {0}")]
    DuplicateKey(&'static str),
    /// The key collides with a message envelope field.
    #[error("source key is reserved: {0}")]
    ReservedKey(&'static str),
    /// A key, table or column is not a plain lowercase SQL identifier.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(&'static str),
    /// Lookback must be positive.
    #[error("lookback for {0} must be positive")]
    NonPositiveLookback(&'static str),
}

// =============================================================================
// Tests
// =============================================================================
