use crate::{
    options::{effective_ttl, renewal_interval, LockOptions},
    store::LeaseStore,
    watchdog::Watchdog,
    Error, Result,
};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Invoked at most once when the watchdog finds the lease gone.
pub type LostCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    /// Held, and the watchdog is keeping it alive.
    Renewing,
    /// The store no longer maps the key to our token.
    Lost,
    /// Released by the holder.
    Released,
}

/// Shared between a release handle and its watchdog. Whichever of them
/// moves the status out of `Renewing` first decides how the lease ended.
#[derive(Debug)]
pub(crate) struct LeaseState {
    status: Mutex<LeaseStatus>,
    stop: CancellationToken,
    lost: CancellationToken,
}

impl LeaseState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(LeaseStatus::Renewing),
            stop: CancellationToken::new(),
            lost: CancellationToken::new(),
        })
    }

    pub(crate) fn status(&self) -> LeaseStatus {
        *self.status.lock()
    }

    pub(crate) fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    pub(crate) fn lost_token(&self) -> &CancellationToken {
        &self.lost
    }

    /// Move to a terminal status. Returns `false` if another terminal status
    /// already won.
    pub(crate) fn finish(&self, to: LeaseStatus) -> bool {
        let mut status = self.status.lock();
        if *status != LeaseStatus::Renewing || to == LeaseStatus::Renewing {
            return false;
        }
        *status = to;
        match to {
            LeaseStatus::Released => self.stop.cancel(),
            LeaseStatus::Lost => self.lost.cancel(),
            LeaseStatus::Renewing => {}
        }
        true
    }
}

/// Bound a store call by the per-operation timeout.
pub(crate) async fn with_deadline<T>(
    op: &'static str,
    key: &str,
    timeout: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::StoreTimeout {
            op,
            key: key.to_string(),
            timeout,
        }),
    }
}

/// Proof of a held lease. Releasing stops the watchdog and deletes the
/// record if it still carries our token.
///
/// Only the first `release` does anything; later calls return `Ok(false)`.
/// Dropping an unreleased handle releases in the background.
pub struct ReleaseHandle {
    store: Arc<dyn LeaseStore>,
    key: String,
    token: String,
    timeout: Duration,
    state: Arc<LeaseState>,
    consumed: AtomicBool,
}

impl fmt::Debug for ReleaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseHandle")
            .field("key", &self.key)
            .field("token", &self.token)
            .field("status", &self.state.status())
            .finish_non_exhaustive()
    }
}

impl ReleaseHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn status(&self) -> LeaseStatus {
        self.state.status()
    }

    pub fn is_lost(&self) -> bool {
        self.status() == LeaseStatus::Lost
    }

    /// Cancelled when the watchdog detects loss of the lease.
    pub fn lost_token(&self) -> CancellationToken {
        self.state.lost_token().clone()
    }

    /// Returns whether our record was deleted. `false` means the record had
    /// already expired or changed hands, or this handle was released before.
    pub async fn release(&self) -> Result<bool> {
        if self.consumed.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        self.state.finish(LeaseStatus::Released);

        let released = with_deadline(
            "release",
            &self.key,
            self.timeout,
            self.store.release(&self.key, &self.token),
        )
        .await?;

        if released {
            debug!(key = %self.key, token = %self.token, "lease released");
        } else {
            debug!(key = %self.key, token = %self.token, "lease record already gone at release");
        }
        Ok(released)
    }
}

impl Drop for ReleaseHandle {
    fn drop(&mut self) {
        if self.consumed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.finish(LeaseStatus::Released);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(key = %self.key, "release handle dropped outside a runtime, lease left to expire");
            return;
        };
        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        let timeout = self.timeout;
        runtime.spawn(async move {
            match with_deadline("release", &key, timeout, store.release(&key, &token)).await {
                Ok(_) => debug!(key = %key, "dropped lease released"),
                Err(err) => warn!(key = %key, error = %err, "failed to release dropped lease"),
            }
        });
    }
}

/// Store-backed distributed lock.
///
/// Cheap to clone; clones share the store and the process-wide shutdown
/// token that ends blocking acquisitions.
#[derive(Clone, Debug)]
pub struct LeaseLock {
    store: Arc<dyn LeaseStore>,
    options: LockOptions,
    shutdown: CancellationToken,
}

impl LeaseLock {
    pub fn new(store: Arc<dyn LeaseStore>) -> Self {
        Self {
            store,
            options: LockOptions::default(),
            shutdown: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: LockOptions) -> Self {
        self.options = options;
        self
    }

    /// Tie blocking acquisitions to a process-wide shutdown signal.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// One non-blocking attempt. `Ok(None)` means someone else holds the key.
    ///
    /// On success a watchdog renews the lease every `ttl / 4` until the
    /// handle is released or the lease is lost, in which case `on_lost` runs.
    pub async fn try_lock(
        &self,
        key: &str,
        ttl: Duration,
        on_lost: Option<LostCallback>,
    ) -> Result<Option<ReleaseHandle>> {
        let ttl = effective_ttl(ttl)?;
        let token = self.options.token_generator.generate();

        let acquired = with_deadline(
            "acquire",
            key,
            self.options.timeout,
            self.store.acquire_or_renew(key, &token, ttl),
        )
        .await?;

        if !acquired {
            debug!(key, "lease held by another owner");
            return Ok(None);
        }

        let state = LeaseState::new();
        Watchdog {
            store: self.store.clone(),
            key: key.to_string(),
            token: token.clone(),
            ttl,
            interval: renewal_interval(ttl),
            timeout: self.options.timeout,
            staleness: self.options.staleness,
            state: state.clone(),
            on_lost,
        }
        .spawn();

        debug!(
            key,
            token = %token,
            ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            "lease acquired"
        );

        Ok(Some(ReleaseHandle {
            store: self.store.clone(),
            key: key.to_string(),
            token,
            timeout: self.options.timeout,
            state,
            consumed: AtomicBool::new(false),
        }))
    }
}
