//! Reconnect Backoff
//!
//! Exponential backoff with jitter between sync client connection attempts.

use std::time::Duration;

use rand::Rng;

use crate::infrastructure::config::ReconnectSettings;

/// Jitter applied to every delay, as a fraction of the delay (±10%).
pub const DEFAULT_JITTER: f64 = 0.1;

/// Backoff state for one client.
///
/// The delay starts at `delay_initial`, grows by `delay_multiplier` per
/// attempt, and is capped at `delay_max`. A successful connection resets it.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    settings: ReconnectSettings,
    jitter: f64,
    current: Duration,
    attempts: u32,
}

impl ReconnectPolicy {
    /// Policy with the default jitter.
    #[must_use]
    pub const fn new(settings: ReconnectSettings) -> Self {
        Self::with_jitter(settings, DEFAULT_JITTER)
    }

    /// Policy with an explicit jitter fraction. Zero disables jitter.
    #[must_use]
    pub const fn with_jitter(settings: ReconnectSettings, jitter: f64) -> Self {
        let current = settings.delay_initial;
        Self {
            settings,
            jitter,
            current,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` once `max_attempts` is spent.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }
        self.attempts += 1;

        let delay = self.jittered(self.current);
        self.current = self.grown(self.current);
        Some(delay)
    }

    /// Reset after a successful connection.
    pub const fn reset(&mut self) {
        self.current = self.settings.delay_initial;
        self.attempts = 0;
    }

    /// Attempts made since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempts
    }

    /// Configured attempt limit (0 = unlimited).
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.settings.max_attempts
    }

    /// Whether another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.settings.max_attempts == 0 || self.attempts < self.settings.max_attempts
    }

    fn grown(&self, from: Duration) -> Duration {
        let max = self.settings.delay_max;
        #[allow(clippy::cast_precision_loss)]
        let scaled = (from.as_millis() as f64 * self.settings.delay_multiplier).round();
        #[allow(clippy::cast_precision_loss)]
        let max_millis = max.as_millis() as f64;

        // Overflow (inf) and NaN saturate at the cap.
        if scaled.is_nan() || scaled >= max_millis {
            return max;
        }
        if scaled <= 0.0 {
            return Duration::ZERO;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millis = scaled as u64;
        Duration::from_millis(millis)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }

        #[allow(clippy::cast_precision_loss)]
        let base = delay.as_millis() as f64;
        let range = base * self.jitter;
        let offset: f64 = rand::rng().random_range(-range..=range);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millis = (base + offset).max(1.0) as u64;
        Duration::from_millis(millis)
    }
}
