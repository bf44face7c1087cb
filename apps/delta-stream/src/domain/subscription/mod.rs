//! Subscription State
//!
//! Per-connection subscription: the selected instrument, one watermark per
//! source, and a lifecycle flag.
//!
//! # Design
//!
//! A subscription is an owned value. The connection registry keys it by
//! connection id and hands it to exactly one poller, which is the only
//! writer of its watermarks. Replacing a subscription means building a new
//! one, so every resubscribe starts from fresh lookback watermarks.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};

use super::source::SourceRegistry;

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a viewer connection.
pub type ConnectionId = u64;

/// Maximum accepted instrument length.
const MAX_INSTRUMENT_LEN: usize = 64;

/// A validated instrument name (e.g. `btc`, `eth`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Instrument(String);

impl Instrument {
    /// Parse and validate an instrument name.
    ///
    /// Surrounding whitespace is trimmed. The name must be non-empty, at
    /// most 64 characters, and use only ASCII alphanumerics or `-_.:/`.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first violated rule.
    pub fn parse(raw: &str) -> Result<Self, InstrumentError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(InstrumentError::Empty);
        }
        if trimmed.len() > MAX_INSTRUMENT_LEN {
            return Err(InstrumentError::TooLong(trimmed.len()));
        }
        if let Some(c) = trimmed
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '/')))
        {
            return Err(InstrumentError::InvalidCharacter(c));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Instrument name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Instrument validation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InstrumentError {
    /// Instrument is empty or whitespace.
    #[error("instrument is empty")]
    Empty,
    /// Instrument exceeds the maximum length.
    #[error("instrument is {0} characters, maximum is 64")]
    TooLong(usize),
    /// Instrument contains a disallowed character.
    #[error("instrument contains invalid character {0:?}")]
    InvalidCharacter(char),
}

// =============================================================================
// Watermarks
// =============================================================================

/// Last-seen timestamp per source key.
///
/// Watermarks only move forward: [`Watermarks::advance`] ignores any value
/// not strictly greater than the current one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Watermarks {
    marks: HashMap<&'static str, DateTime<Utc>>,
}

impl Watermarks {
    /// Seed every source with `now - lookback`.
    #[must_use]
    pub fn seeded(registry: &SourceRegistry, now: DateTime<Utc>) -> Self {
        let marks = registry
            .iter()
            .map(|source| (source.key(), now - source.lookback()))
            .collect();
        Self { marks }
    }

    /// Current watermark for a source.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<DateTime<Utc>> {
        self.marks.get(key).copied()
    }

    /// Move a watermark forward.
    ///
    /// Returns `true` if the watermark changed.
    pub fn advance(&mut self, key: &'static str, to: DateTime<Utc>) -> bool {
        match self.marks.get_mut(key) {
            Some(current) if to > *current => {
                *current = to;
                true
            }
            Some(_) => false,
            None => {
                self.marks.insert(key, to);
                true
            }
        }
    }

    /// Number of tracked sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.marks.len()
    }

    /// Whether no sources are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// Lifecycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Being polled.
    Active,
    /// Torn down; no further ticks.
    Closed,
}

/// One connection's interest in one instrument.
#[derive(Debug, Clone)]
pub struct Subscription {
    connection: ConnectionId,
    instrument: Instrument,
    watermarks: Watermarks,
    state: SubscriptionState,
    created_at: DateTime<Utc>,
}

impl Subscription {
    /// Create an active subscription with lookback-seeded watermarks.
    #[must_use]
    pub fn new(
        connection: ConnectionId,
        instrument: Instrument,
        registry: &SourceRegistry,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            connection,
            instrument,
            watermarks: Watermarks::seeded(registry, now),
            state: SubscriptionState::Active,
            created_at: now,
        }
    }

    /// Owning connection.
    #[must_use]
    pub const fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Subscribed instrument.
    #[must_use]
    pub const fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    /// Current watermarks.
    #[must_use]
    pub const fn watermarks(&self) -> &Watermarks {
        &self.watermarks
    }

    /// Current watermark for one source.
    #[must_use]
    pub fn watermark(&self, key: &str) -> Option<DateTime<Utc>> {
        self.watermarks.get(key)
    }

    /// Advance one source's watermark. No-op once closed.
    pub fn advance(&mut self, key: &'static str, to: DateTime<Utc>) -> bool {
        self.is_active() && self.watermarks.advance(key, to)
    }

    /// Lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Whether the subscription is still being polled.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self.state, SubscriptionState::Active)
    }

    /// Mark the subscription closed.
    pub const fn close(&mut self) {
        self.state = SubscriptionState::Closed;
    }

    /// When the subscription was created.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::{TimeDelta, TimeZone};
    use test_case::test_case;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn btc() -> Instrument {
        Instrument::parse("btc").unwrap()
    }

    #[test_case("btc", "btc" ; "plain")]
    #[test_case("  eth  ", "eth" ; "trimmed")]
    #[test_case("BTC-PERPETUAL", "BTC-PERPETUAL" ; "exchange style")]
    #[test_case("sol/usdt", "sol/usdt" ; "pair")]
    fn instrument_accepts(raw: &str, expected: &str) {
        assert_eq!(Instrument::parse(raw).unwrap().as_str(), expected);
    }

    #[test_case("", InstrumentError::Empty ; "empty")]
    #[test_case("   ", InstrumentError::Empty ; "whitespace")]
    #[test_case("btc eth", InstrumentError::InvalidCharacter(' ') ; "inner space")]
    #[test_case("btc'--", InstrumentError::InvalidCharacter('\'') ; "quote")]
    fn instrument_rejects(raw: &str, expected: InstrumentError) {
        assert_eq!(Instrument::parse(raw).unwrap_err(), expected);
    }

    #[test]
    fn instrument_too_long() {
        let raw = "x".repeat(65);
        assert_eq!(
            Instrument::parse(&raw).unwrap_err(),
            InstrumentError::TooLong(65)
        );
    }

    #[test]
    fn new_subscription_seeds_lookback_watermarks() {
        let registry = SourceRegistry::standard();
        let sub = Subscription::new(7, btc(), &registry, now());

        assert_eq!(sub.connection(), 7);
        assert!(sub.is_active());
        assert_eq!(sub.watermarks().len(), registry.len());
        assert_eq!(sub.watermark("price"), Some(now() - TimeDelta::days(7)));
        assert_eq!(
            sub.watermark("delta_surfaces"),
            Some(now() - TimeDelta::days(7))
        );
        assert_eq!(
            sub.watermark("fear_greed"),
            Some(now() - TimeDelta::days(100))
        );
    }

    #[test]
    fn watermark_only_moves_forward() {
        let registry = SourceRegistry::standard();
        let mut sub = Subscription::new(1, btc(), &registry, now());
        let start = sub.watermark("price").unwrap();

        assert!(sub.advance("price", start + TimeDelta::seconds(120)));
        assert!(!sub.advance("price", start + TimeDelta::seconds(60)));
        assert!(!sub.advance("price", start + TimeDelta::seconds(120)));

        assert_eq!(
            sub.watermark("price"),
            Some(start + TimeDelta::seconds(120))
        );
    }

    #[test]
    fn closed_subscription_freezes_watermarks() {
        let registry = SourceRegistry::standard();
        let mut sub = Subscription::new(1, btc(), &registry, now());
        let before = sub.watermarks().clone();

        sub.close();

        assert_eq!(sub.state(), SubscriptionState::Closed);
        assert!(!sub.advance("price", now()));
        assert_eq!(sub.watermarks(), &before);
    }

    #[test]
    fn resubscribe_resets_watermarks() {
        let registry = SourceRegistry::standard();
        let mut first = Subscription::new(1, btc(), &registry, now());
        first.advance("price", now());

        let later = now() + TimeDelta::minutes(5);
        let second = Subscription::new(1, btc(), &registry, later);

        assert_eq!(second.watermark("price"), Some(later - TimeDelta::days(7)));
        assert_eq!(second.created_at(), later);
    }
}
