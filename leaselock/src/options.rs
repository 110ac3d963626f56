use crate::token::{DefaultTokenGenerator, SharedTokenGenerator, TokenGenerator};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_TTL: Duration = Duration::from_secs(10);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);
/// Longest TTL a lease may carry.
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// What the watchdog does when renewals keep failing with store errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalenessPolicy {
    /// Declare the lease lost once a full TTL has passed since the last
    /// successful renewal. By then the store has expired the record.
    #[default]
    BoundedByTtl,
    /// Keep retrying forever. The record may expire at the store while the
    /// local side still believes it is renewing.
    Unbounded,
}

/// Per-lock configuration. Fixed for the lifetime of an acquisition.
#[derive(Clone)]
pub struct LockOptions {
    pub timeout: Duration,
    pub retry_interval: Duration,
    pub token_generator: SharedTokenGenerator,
    pub staleness: StalenessPolicy,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            token_generator: Arc::new(DefaultTokenGenerator),
            staleness: StalenessPolicy::default(),
        }
    }
}

impl fmt::Debug for LockOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockOptions")
            .field("timeout", &self.timeout)
            .field("retry_interval", &self.retry_interval)
            .field("staleness", &self.staleness)
            .finish_non_exhaustive()
    }
}

impl LockOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    #[must_use]
    pub fn with_token_generator(mut self, generator: impl TokenGenerator + 'static) -> Self {
        self.token_generator = Arc::new(generator);
        self
    }

    #[must_use]
    pub fn with_staleness(mut self, staleness: StalenessPolicy) -> Self {
        self.staleness = staleness;
        self
    }
}

/// Zero TTL means "use the default". TTLs above [`MAX_TTL`] are rejected.
pub(crate) fn effective_ttl(ttl: Duration) -> Result<Duration> {
    if ttl.is_zero() {
        Ok(DEFAULT_TTL)
    } else if ttl > MAX_TTL {
        Err(Error::Config(format!("ttl {ttl:?} exceeds maximum of {MAX_TTL:?}")))
    } else {
        Ok(ttl)
    }
}

/// A quarter of the TTL leaves three missed renewals of slack before the
/// record can expire under a live owner.
pub(crate) fn renewal_interval(ttl: Duration) -> Duration {
    (ttl / 4).max(Duration::from_millis(1))
}
