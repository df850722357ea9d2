//! Reconnect budget and backoff.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::TransportError;

/// Base unit of the reconnect delay.
pub const BASE_DELAY: Duration = Duration::from_millis(500);

/// Default retry budget, also the floor multiplier of the delay.
pub const DEFAULT_RECONNECT_RETRIES: u32 = 5;

/// Configured value meaning "retry forever".
pub const UNLIMITED_RETRIES: i64 = -1;

/// Maximum number of reconnects after unexpected closes.
///
/// Serialized as an integer where `-1` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum RetryLimit {
    Limited(u32),
    Unlimited,
}

impl RetryLimit {
    pub fn allows(&self, retries: u32) -> bool {
        match self {
            RetryLimit::Limited(max) => retries < *max,
            RetryLimit::Unlimited => true,
        }
    }
}

impl Default for RetryLimit {
    fn default() -> Self {
        RetryLimit::Limited(DEFAULT_RECONNECT_RETRIES)
    }
}

impl TryFrom<i64> for RetryLimit {
    type Error = TransportError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if value == UNLIMITED_RETRIES {
            return Ok(RetryLimit::Unlimited);
        }
        u32::try_from(value)
            .map(RetryLimit::Limited)
            .map_err(|_| {
                TransportError::Config(format!(
                    "max_retries must be -1 or a non-negative integer, got {}",
                    value
                ))
            })
    }
}

impl From<RetryLimit> for i64 {
    fn from(limit: RetryLimit) -> Self {
        match limit {
            RetryLimit::Limited(max) => i64::from(max),
            RetryLimit::Unlimited => UNLIMITED_RETRIES,
        }
    }
}

impl fmt::Display for RetryLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryLimit::Limited(max) => write!(f, "{}", max),
            RetryLimit::Unlimited => f.write_str("unlimited"),
        }
    }
}

/// When and how often to reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_retries: RetryLimit,
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: RetryLimit::default(),
            base_delay: BASE_DELAY,
        }
    }
}

impl ReconnectPolicy {
    /// Whether another reconnect may be scheduled after `retries` so far.
    pub fn allows_retry(&self, retries: u32) -> bool {
        self.max_retries.allows(retries)
    }

    /// Delay before reconnect number `retries`.
    ///
    /// Never shorter than `base_delay * DEFAULT_RECONNECT_RETRIES`; grows
    /// linearly once `retries` passes that default.
    pub fn delay_for(&self, retries: u32) -> Duration {
        self.base_delay
            .saturating_mul(retries.max(DEFAULT_RECONNECT_RETRIES))
    }
}
