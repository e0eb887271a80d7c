use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::{ConfigKey, DEFAULT_BASE_BACKOFF};
use crate::store::JobStore;

/// Longest delay the policy will produce (about 136 years).
const MAX_BACKOFF_SECS: f64 = u32::MAX as f64;

/// Delay before attempt `attempt + 1` may start: `base ^ attempt` seconds.
///
/// Pure and deterministic. For `base >= 1` the delay never decreases as
/// `attempt` grows.
pub fn backoff(base: f64, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let secs = base.powi(exponent);
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(secs.min(MAX_BACKOFF_SECS))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_backoff: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_BACKOFF)
    }
}

impl RetryPolicy {
    pub fn new(base_backoff: f64) -> Self {
        Self { base_backoff }
    }

    /// Read a fresh snapshot of the policy from the store's config table.
    ///
    /// Missing or malformed values fall back to the default; a store error
    /// does too, since the failed job must still be settled.
    pub fn load(store: &dyn JobStore) -> Self {
        let raw = match store.get_config(ConfigKey::BaseBackoff.as_str()) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read base_backoff, using default");
                None
            }
        };
        let base_backoff = raw
            .as_deref()
            .map(|raw| match ConfigKey::BaseBackoff.parse_f64(raw) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(value = raw, error = %e, "Invalid base_backoff, using default");
                    DEFAULT_BASE_BACKOFF
                }
            })
            .unwrap_or(DEFAULT_BASE_BACKOFF);
        Self::new(base_backoff)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        backoff(self.base_backoff, attempt)
    }

    pub fn next_run_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay(attempt)).unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
