use super::LeaseStore;
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Clone)]
struct StoredLease {
    token: String,
    expires_at: Instant,
}

fn expiry(now: Instant, ttl: Duration) -> Result<Instant> {
    now.checked_add(ttl)
        .ok_or_else(|| Error::Config(format!("ttl {ttl:?} overflows the clock")))
}

impl StoredLease {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-process lease store.
///
/// Each operation runs under the map's shard lock for its key, so the
/// compare and the write are one step for every task in this process.
/// Expired records are treated as absent and dropped lazily.
#[derive(Debug, Default)]
pub struct MemoryStore {
    leases: DashMap<String, StoredLease>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unexpired records.
    pub fn live_count(&self) -> usize {
        let now = Instant::now();
        self.leases.iter().filter(|e| e.value().is_live(now)).count()
    }

    /// Unconditionally overwrite a record, bypassing the CAS. Only meant for
    /// simulating another party stealing a lease.
    pub fn force_set(&self, key: &str, token: &str, ttl: Duration) {
        let now = Instant::now();
        let Ok(expires_at) = expiry(now, ttl) else {
            return;
        };
        self.leases.insert(
            key.to_string(),
            StoredLease {
                token: token.to_string(),
                expires_at,
            },
        );
    }

    /// Unconditionally delete a record.
    pub fn force_delete(&self, key: &str) {
        self.leases.remove(key);
    }
}

#[async_trait]
impl LeaseStore for MemoryStore {
    async fn acquire_or_renew(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let fresh = StoredLease {
            token: token.to_string(),
            expires_at: expiry(now, ttl)?,
        };

        match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                if current.is_live(now) && current.token != token {
                    trace!(key, "memory lease held by another token");
                    return Ok(false);
                }
                entry.insert(fresh);
            }
            Entry::Vacant(entry) => {
                entry.insert(fresh);
            }
        }
        Ok(true)
    }

    async fn renew(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let expires_at = expiry(now, ttl)?;
        match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_live(now) {
                    entry.remove();
                    return Ok(false);
                }
                if entry.get().token != token {
                    return Ok(false);
                }
                entry.get_mut().expires_at = expires_at;
                Ok(true)
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let now = Instant::now();
        let removed = self
            .leases
            .remove_if(key, |_, lease| lease.is_live(now) && lease.token == token);
        Ok(removed.is_some())
    }

    async fn owner(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        Ok(self
            .leases
            .get(key)
            .filter(|lease| lease.is_live(now))
            .map(|lease| lease.token.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const TTL: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_acquire_is_exclusive_and_idempotent() {
        let store = MemoryStore::new();
        assert!(store.acquire_or_renew("job", "a", TTL).await.unwrap());
        assert!(!store.acquire_or_renew("job", "b", TTL).await.unwrap());
        // same token re-acquires
        assert!(store.acquire_or_renew("job", "a", TTL).await.unwrap());
        assert_eq!(store.owner("job").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_renew_never_creates() {
        let store = MemoryStore::new();
        assert!(!store.renew("job", "a", TTL).await.unwrap());
        assert_eq!(store.owner("job").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_overflowing_ttl_is_rejected() {
        let store = MemoryStore::new();
        let huge = Duration::from_secs(u64::MAX / 2);
        assert!(matches!(
            store.acquire_or_renew("job", "a", huge).await,
            Err(Error::Config(_))
        ));
        assert_eq!(store.owner("job").await.unwrap(), None);

        assert!(store.acquire_or_renew("job", "a", TTL).await.unwrap());
        assert!(store.renew("job", "a", huge).await.is_err());
        assert_eq!(store.owner("job").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_record_is_absent() {
        let store = MemoryStore::new();
        assert!(store
            .acquire_or_renew("job", "a", Duration::from_secs(2))
            .await
            .unwrap());

        tokio::time::advance(Duration::from_secs(3)).await;

        assert_eq!(store.owner("job").await.unwrap(), None);
        assert!(!store.renew("job", "a", TTL).await.unwrap());
        assert!(store.acquire_or_renew("job", "b", TTL).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_release_keeps_new_owner() {
        let store = MemoryStore::new();
        store
            .acquire_or_renew("job", "old", Duration::from_secs(1))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.acquire_or_renew("job", "new", TTL).await.unwrap());

        assert!(!store.release("job", "old").await.unwrap());
        assert_eq!(store.owner("job").await.unwrap().as_deref(), Some("new"));
        assert_eq!(store.live_count(), 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Acquire(usize),
        Renew(usize),
        Release(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..3usize).prop_map(Op::Acquire),
            (0..3usize).prop_map(Op::Renew),
            (0..3usize).prop_map(Op::Release),
        ]
    }

    proptest! {
        #[test]
        fn prop_store_matches_single_owner_model(ops in proptest::collection::vec(op(), 1..64)) {
            let store = MemoryStore::new();
            let mut owner: Option<usize> = None;

            tokio_test::block_on(async {
                for op in ops {
                    match op {
                        Op::Acquire(who) => {
                            let got = store.acquire_or_renew("k", &who.to_string(), TTL).await.unwrap();
                            let expected = owner.map_or(true, |o| o == who);
                            prop_assert_eq!(got, expected);
                            if got {
                                owner = Some(who);
                            }
                        }
                        Op::Renew(who) => {
                            let got = store.renew("k", &who.to_string(), TTL).await.unwrap();
                            prop_assert_eq!(got, owner == Some(who));
                        }
                        Op::Release(who) => {
                            let got = store.release("k", &who.to_string()).await.unwrap();
                            prop_assert_eq!(got, owner == Some(who));
                            if got {
                                owner = None;
                            }
                        }
                    }
                    let stored = store.owner("k").await.unwrap();
                    prop_assert_eq!(stored, owner.map(|o| o.to_string()));
                }
                Ok(())
            })?;
        }
    }
}
