//! Atomic lease operations against a shared key-value store.
//!
//! Every mutation is a compare-and-swap on the stored token, executed as a
//! single indivisible step by the store. Nothing here writes a key
//! unconditionally.

use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

#[async_trait]
pub trait LeaseStore: Send + Sync + std::fmt::Debug {
    /// Set `key` to `token` with the given expiry if the key is absent or
    /// already holds `token`. Returns `false` when someone else owns it.
    async fn acquire_or_renew(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Reset the expiry of `key` if it still holds `token`. Never creates the key.
    async fn renew(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key` if it still holds `token`.
    async fn release(&self, key: &str, token: &str) -> Result<bool>;

    /// Current owner token of `key`, if any.
    async fn owner(&self, key: &str) -> Result<Option<String>>;
}

/// Selects a store implementation at composition time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    #[default]
    Memory,
    Redis { url: String },
}

impl StoreConfig {
    pub async fn connect(&self) -> Result<Arc<dyn LeaseStore>> {
        match self {
            StoreConfig::Memory => Ok(Arc::new(MemoryStore::new())),
            StoreConfig::Redis { url } => {
                if url.is_empty() {
                    return Err(Error::Config("redis store requires a url".into()));
                }
                Ok(Arc::new(RedisStore::connect(url).await?))
            }
        }
    }
}

/// Millisecond TTL as sent to the store. Sub-millisecond TTLs round up so a
/// lease never gets a zero expiry.
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    let millis = ttl.as_millis().max(1);
    u64::try_from(millis).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_millis_rounds_up() {
        assert_eq!(ttl_millis(Duration::from_secs(10)), 10_000);
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::ZERO), 1);
    }

    #[test]
    fn test_store_config_json() {
        let cfg: StoreConfig =
            serde_json::from_str(r#"{"kind":"redis","url":"redis://127.0.0.1/"}"#).unwrap();
        assert_eq!(
            cfg,
            StoreConfig::Redis {
                url: "redis://127.0.0.1/".into()
            }
        );
        let cfg: StoreConfig = serde_json::from_str(r#"{"kind":"memory"}"#).unwrap();
        assert_eq!(cfg, StoreConfig::Memory);
    }

    #[tokio::test]
    async fn test_connect_rejects_empty_redis_url() {
        let err = StoreConfig::Redis { url: String::new() }
            .connect()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_connect_memory() {
        let store = StoreConfig::Memory.connect().await.unwrap();
        assert!(store
            .acquire_or_renew("k", "t", Duration::from_secs(1))
            .await
            .unwrap());
    }
}
