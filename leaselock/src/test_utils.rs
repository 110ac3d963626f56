use crate::{lease::LostCallback, store::LeaseStore, Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::time::sleep;

/// Wraps a store and simulates an unreliable network in front of it:
/// partitions, added latency and random failures.
#[derive(Debug)]
pub struct FlakyStore {
    inner: Arc<dyn LeaseStore>,
    reachable: AtomicBool,
    latency: Mutex<Duration>,
    failure_rate: Mutex<f64>,
    calls: AtomicUsize,
    failed: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn LeaseStore>) -> Self {
        Self {
            inner,
            reachable: AtomicBool::new(true),
            latency: Mutex::new(Duration::ZERO),
            failure_rate: Mutex::new(0.0),
            calls: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Fraction of calls, in `[0, 1]`, that fail even while reachable.
    pub fn set_failure_rate(&self, rate: f64) {
        *self.failure_rate.lock() = rate.clamp(0.0, 1.0);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn failed_calls(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    async fn gate(&self, op: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            sleep(latency).await;
        }

        let rate = *self.failure_rate.lock();
        let dropped = rate > 0.0 && rand::thread_rng().gen_bool(rate);
        if !self.reachable.load(Ordering::SeqCst) || dropped {
            self.failed.fetch_add(1, Ordering::SeqCst);
            return Err(Error::StoreUnavailable(format!("simulated partition during {op}")));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for FlakyStore {
    async fn acquire_or_renew(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        self.gate("acquire").await?;
        self.inner.acquire_or_renew(key, token, ttl).await
    }

    async fn renew(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        self.gate("renew").await?;
        self.inner.renew(key, token, ttl).await
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        self.gate("release").await?;
        self.inner.release(key, token).await
    }

    async fn owner(&self, key: &str) -> Result<Option<String>> {
        self.gate("owner").await?;
        self.inner.owner(key).await
    }
}

/// Counts invocations of a loss callback.
#[derive(Debug, Clone, Default)]
pub struct CallCounter {
    count: Arc<AtomicUsize>,
}

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> LostCallback {
        let count = self.count.clone();
        Arc::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}
