//! Ownership tokens.
//!
//! A token is the fencing value stored under a lease key. Every mutating
//! store operation compares against it, so it has to be unique across
//! processes and over time for anything but deliberate reentrancy.

use chrono::Utc;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

pub trait TokenGenerator: Send + Sync {
    fn generate(&self) -> String;
}

impl<F> TokenGenerator for F
where
    F: Fn() -> String + Send + Sync,
{
    fn generate(&self) -> String {
        self()
    }
}

pub type SharedTokenGenerator = Arc<dyn TokenGenerator>;

/// `{unix_nanos}-{pid}-{seq}`: wall clock, process id and an in-process
/// monotonic counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTokenGenerator;

impl TokenGenerator for DefaultTokenGenerator {
    fn generate(&self) -> String {
        let nanos = Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_else(|| Utc::now().timestamp_micros().saturating_mul(1_000));
        let seq = SEQUENCE.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{}-{}", nanos, std::process::id(), seq)
    }
}

/// Random v4 UUID per acquisition.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidTokenGenerator;

impl TokenGenerator for UuidTokenGenerator {
    fn generate(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Always hands out the same token. Two acquisitions with the same fixed
/// token on the same key both succeed, which is the only form of reentrancy
/// the lock supports.
#[derive(Clone, PartialEq, Eq)]
pub struct FixedToken(String);

impl FixedToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl fmt::Debug for FixedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FixedToken").field(&self.0).finish()
    }
}

impl TokenGenerator for FixedToken {
    fn generate(&self) -> String {
        self.0.clone()
    }
}
