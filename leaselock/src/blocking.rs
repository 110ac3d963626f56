use crate::{
    lease::{LeaseLock, LostCallback, ReleaseHandle},
    Error, Result,
};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

enum Pause {
    Elapsed,
    Cancelled,
}

impl LeaseLock {
    /// Retry [`try_lock`](Self::try_lock) every `retry_interval` until it
    /// succeeds or the lock's shutdown token fires. Store errors end the
    /// wait immediately.
    pub async fn lock(
        &self,
        key: &str,
        ttl: Duration,
        on_lost: Option<LostCallback>,
    ) -> Result<ReleaseHandle> {
        let shutdown = self.shutdown_token().clone();
        self.lock_with_cancel(&shutdown, key, ttl, on_lost).await
    }

    /// Like [`lock`](Self::lock), but also gives up with [`Error::Cancelled`]
    /// once `cancel` fires. An attempt already in flight runs to completion
    /// (bounded by the store timeout) before cancellation is observed.
    pub async fn lock_with_cancel(
        &self,
        cancel: &CancellationToken,
        key: &str,
        ttl: Duration,
        on_lost: Option<LostCallback>,
    ) -> Result<ReleaseHandle> {
        let mut attempts: u64 = 0;
        loop {
            if self.is_cancelled(cancel) {
                return Err(Error::Cancelled { key: key.to_string() });
            }
            attempts += 1;
            if let Some(handle) = self.try_lock(key, ttl, on_lost.clone()).await? {
                debug!(key, attempts, "blocking lock acquired");
                return Ok(handle);
            }
            if let Pause::Cancelled = self.pause(cancel, self.options().retry_interval).await {
                debug!(key, attempts, "blocking lock cancelled");
                return Err(Error::Cancelled { key: key.to_string() });
            }
        }
    }

    /// Retry until acquired or until `wait` has passed. `Ok(None)` when the
    /// wait budget ran out; at least one attempt is always made.
    pub async fn lock_timeout(
        &self,
        key: &str,
        ttl: Duration,
        on_lost: Option<LostCallback>,
        wait: Duration,
    ) -> Result<Option<ReleaseHandle>> {
        // a wait too long to represent never runs out
        let deadline = Instant::now().checked_add(wait);
        let shutdown = self.shutdown_token().clone();
        loop {
            if let Some(handle) = self.try_lock(key, ttl, on_lost.clone()).await? {
                return Ok(Some(handle));
            }
            let remaining = deadline.map_or(Duration::MAX, |deadline| {
                deadline.saturating_duration_since(Instant::now())
            });
            if remaining.is_zero() {
                debug!(
                    key,
                    waited_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                    "lock wait budget exhausted"
                );
                return Ok(None);
            }
            let pause = remaining.min(self.options().retry_interval);
            if let Pause::Cancelled = self.pause(&shutdown, pause).await {
                return Err(Error::Cancelled { key: key.to_string() });
            }
        }
    }

    fn is_cancelled(&self, cancel: &CancellationToken) -> bool {
        cancel.is_cancelled() || self.shutdown_token().is_cancelled()
    }

    async fn pause(&self, cancel: &CancellationToken, duration: Duration) -> Pause {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Pause::Cancelled,
            () = self.shutdown_token().cancelled() => Pause::Cancelled,
            () = sleep(duration) => Pause::Elapsed,
        }
    }
}
