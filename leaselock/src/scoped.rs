//! Run a critical section while holding a lease.
//!
//! The handler receives a [`CancellationToken`] that is cancelled when the
//! lease is lost, so cooperative work can stop before another owner starts.
//! The lease is released after the handler finishes, fails or panics.

use crate::{
    lease::{LeaseLock, LostCallback, ReleaseHandle},
    Error,
};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

impl LeaseLock {
    /// Block until the lease is held, then run `handler`.
    pub async fn in_lock<F, Fut, T, E>(&self, key: &str, ttl: Duration, handler: F) -> Result<T, E>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<Error>,
    {
        let parent = self.shutdown_token().clone();
        self.in_lock_with_cancel(&parent, key, ttl, handler).await
    }

    /// Like [`in_lock`](Self::in_lock); `cancel` aborts the wait and is the
    /// parent of the token handed to `handler`.
    pub async fn in_lock_with_cancel<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        key: &str,
        ttl: Duration,
        handler: F,
    ) -> Result<T, E>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<Error>,
    {
        let scope = cancel.child_token();
        let handle = self
            .lock_with_cancel(cancel, key, ttl, Some(cancel_on_lost(&scope)))
            .await?;
        run_scoped(handle, scope, handler).await
    }

    /// Run `handler` only if the lease is free right now. `Ok(None)` means
    /// it was held elsewhere and the handler did not run.
    pub async fn try_in_lock<F, Fut, T, E>(
        &self,
        key: &str,
        ttl: Duration,
        handler: F,
    ) -> Result<Option<T>, E>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<Error>,
    {
        let parent = self.shutdown_token().clone();
        self.try_in_lock_with_cancel(&parent, key, ttl, handler).await
    }

    pub async fn try_in_lock_with_cancel<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        key: &str,
        ttl: Duration,
        handler: F,
    ) -> Result<Option<T>, E>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<Error>,
    {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled { key: key.to_string() }.into());
        }
        let scope = cancel.child_token();
        let Some(handle) = self
            .try_lock(key, ttl, Some(cancel_on_lost(&scope)))
            .await?
        else {
            return Ok(None);
        };
        run_scoped(handle, scope, handler).await.map(Some)
    }
}

fn cancel_on_lost(scope: &CancellationToken) -> LostCallback {
    let scope = scope.clone();
    Arc::new(move || scope.cancel())
}

async fn run_scoped<F, Fut, T, E>(
    handle: ReleaseHandle,
    scope: CancellationToken,
    handler: F,
) -> Result<T, E>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let handler_scope = scope.clone();
    let outcome = AssertUnwindSafe(async move { handler(handler_scope).await })
        .catch_unwind()
        .await;
    scope.cancel();

    // A failed release leaves the record to expire at its TTL; the
    // handler's outcome is still what the caller gets.
    if let Err(err) = handle.release().await {
        warn!(key = handle.key(), error = %err, "failed to release lease after critical section");
    }

    match outcome {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

#[cfg(test)]
mod tests {
    use crate::store::{LeaseStore, MemoryStore};
    use crate::test_utils::FlakyStore;
    use crate::{Error, LeaseLock};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, thiserror::Error)]
    enum JobError {
        #[error("lock: {0}")]
        Lock(#[from] Error),
        #[error("job failed: {0}")]
        Failed(&'static str),
    }

    #[tokio::test]
    async fn test_in_lock_runs_and_releases() {
        let store = Arc::new(MemoryStore::new());
        let lock = LeaseLock::new(store.clone());

        let inner_store = store.clone();
        let value = lock
            .in_lock("job-2", Duration::from_secs(5), |ctx| async move {
                assert!(!ctx.is_cancelled());
                assert!(inner_store.owner("job-2").await?.is_some());
                Ok::<_, Error>(42)
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(store.owner("job-2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_handler_error_passes_through_and_releases() {
        let store = Arc::new(MemoryStore::new());
        let lock = LeaseLock::new(store.clone());

        let err = lock
            .in_lock("job", Duration::from_secs(5), |_ctx| async {
                Err::<(), _>(JobError::Failed("boom"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, JobError::Failed("boom")));
        assert_eq!(store.owner("job").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_try_in_lock_skips_when_held() {
        let store = Arc::new(MemoryStore::new());
        let lock = LeaseLock::new(store.clone());
        let held = lock.try_lock("job", Duration::from_secs(5), None).await.unwrap().unwrap();

        let mut ran = false;
        let outcome = lock
            .try_in_lock("job", Duration::from_secs(5), |_ctx| {
                ran = true;
                async { Ok::<_, Error>(()) }
            })
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert!(!ran);

        held.release().await.unwrap();
        let outcome = lock
            .try_in_lock("job", Duration::from_secs(5), |_ctx| async { Ok::<_, Error>("done") })
            .await
            .unwrap();
        assert_eq!(outcome, Some("done"));
    }

    #[tokio::test]
    async fn test_try_in_lock_with_cancelled_parent() {
        let lock = LeaseLock::new(Arc::new(MemoryStore::new()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = lock
            .try_in_lock_with_cancel(&cancel, "job", Duration::from_secs(5), |_ctx| async {
                Ok::<_, Error>(())
            })
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_parent_cancel_reaches_handler() {
        let lock = LeaseLock::new(Arc::new(MemoryStore::new()));
        let parent = CancellationToken::new();
        let trigger = parent.clone();

        let observed = lock
            .in_lock_with_cancel(&parent, "job", Duration::from_secs(5), |ctx| async move {
                trigger.cancel();
                ctx.cancelled().await;
                Ok::<_, Error>(true)
            })
            .await
            .unwrap();
        assert!(observed);
    }

    #[tokio::test]
    async fn test_panic_still_releases() {
        let store = Arc::new(MemoryStore::new());
        let lock = LeaseLock::new(store.clone());

        let task = tokio::spawn({
            let lock = lock.clone();
            async move {
                lock.in_lock("job", Duration::from_secs(5), |_ctx| async {
                    if true {
                        panic!("critical section blew up");
                    }
                    Ok::<(), Error>(())
                })
                .await
            }
        });
        assert!(task.await.unwrap_err().is_panic());
        assert_eq!(store.owner("job").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_loss_cancels_handler() {
        let inner = Arc::new(MemoryStore::new());
        let flaky = Arc::new(FlakyStore::new(inner.clone()));
        let lock = LeaseLock::new(flaky.clone());

        let partition = flaky.clone();
        let result = lock
            .in_lock("job-2", Duration::from_secs(5), |ctx| async move {
                partition.set_reachable(false);
                tokio::select! {
                    () = ctx.cancelled() => Ok::<_, Error>("cancelled"),
                    () = tokio::time::sleep(Duration::from_secs(20)) => Ok("finished"),
                }
            })
            .await
            .unwrap();

        assert_eq!(result, "cancelled");
    }
}
