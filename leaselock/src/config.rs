use crate::{
    options::{LockOptions, StalenessPolicy, DEFAULT_RETRY_INTERVAL, DEFAULT_TIMEOUT},
    store::StoreConfig,
    Error, LeaseLock, Result,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Deployment-level lock settings, loadable from the environment or JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub store: StoreConfig,
    pub timeout_ms: u64,
    pub retry_interval_ms: u64,
    pub staleness: StalenessPolicy,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            timeout_ms: duration_ms(DEFAULT_TIMEOUT),
            retry_interval_ms: duration_ms(DEFAULT_RETRY_INTERVAL),
            staleness: StalenessPolicy::default(),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl LockConfig {
    /// Reads `LEASELOCK_STORE` (`memory` or `redis`), `LEASELOCK_REDIS_URL`,
    /// `LEASELOCK_TIMEOUT_MS`, `LEASELOCK_RETRY_INTERVAL_MS` and
    /// `LEASELOCK_STALENESS` (`bounded_by_ttl` or `unbounded`). Unset
    /// variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        let redis_url = lookup("LEASELOCK_REDIS_URL");
        let store_kind = lookup("LEASELOCK_STORE").unwrap_or_else(|| {
            if redis_url.is_some() {
                "redis".to_string()
            } else {
                "memory".to_string()
            }
        });
        config.store = match store_kind.to_lowercase().as_str() {
            "memory" => StoreConfig::Memory,
            "redis" => StoreConfig::Redis {
                url: redis_url.unwrap_or_else(|| "redis://127.0.0.1:6379/".to_string()),
            },
            other => return Err(Error::Config(format!("unknown store kind {other:?}"))),
        };

        if let Some(value) = lookup("LEASELOCK_TIMEOUT_MS") {
            config.timeout_ms = parse_ms("LEASELOCK_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = lookup("LEASELOCK_RETRY_INTERVAL_MS") {
            config.retry_interval_ms = parse_ms("LEASELOCK_RETRY_INTERVAL_MS", &value)?;
        }
        if let Some(value) = lookup("LEASELOCK_STALENESS") {
            config.staleness = match value.to_lowercase().as_str() {
                "bounded_by_ttl" | "bounded" => StalenessPolicy::BoundedByTtl,
                "unbounded" => StalenessPolicy::Unbounded,
                other => {
                    return Err(Error::Config(format!("unknown staleness policy {other:?}")))
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|err| {
            Error::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(Error::Config("timeout_ms must be positive".into()));
        }
        if self.retry_interval_ms == 0 {
            return Err(Error::Config("retry_interval_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions::default()
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_retry_interval(Duration::from_millis(self.retry_interval_ms))
            .with_staleness(self.staleness)
    }

    /// Connect to the configured store and build a lock on top of it.
    pub async fn build(&self) -> Result<LeaseLock> {
        let store = self.store.connect().await?;
        debug!(store = ?self.store, "lease store ready");
        Ok(LeaseLock::new(store).with_options(self.lock_options()))
    }
}

fn parse_ms(name: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|err| Error::Config(format!("{name}={value:?} is not a millisecond count: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_env_defaults_to_memory() {
        let config = LockConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, LockConfig::default());
        assert_eq!(config.lock_options().timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_env_redis_url_implies_redis() {
        let config = LockConfig::from_lookup(lookup(&[
            ("LEASELOCK_REDIS_URL", "redis://cache:6379/1"),
            ("LEASELOCK_TIMEOUT_MS", "750"),
            ("LEASELOCK_STALENESS", "unbounded"),
        ]))
        .unwrap();
        assert_eq!(
            config.store,
            StoreConfig::Redis {
                url: "redis://cache:6379/1".into()
            }
        );
        let opts = config.lock_options();
        assert_eq!(opts.timeout, Duration::from_millis(750));
        assert_eq!(opts.staleness, StalenessPolicy::Unbounded);
    }

    #[test]
    fn test_env_rejects_garbage() {
        assert!(LockConfig::from_lookup(lookup(&[("LEASELOCK_STORE", "etcd")])).is_err());
        assert!(LockConfig::from_lookup(lookup(&[("LEASELOCK_TIMEOUT_MS", "soon")])).is_err());
        assert!(LockConfig::from_lookup(lookup(&[("LEASELOCK_RETRY_INTERVAL_MS", "0")])).is_err());
    }

    #[test]
    fn test_json_partial_document() {
        let config = LockConfig::from_json(
            r#"{"store":{"kind":"redis","url":"redis://localhost/"},"retry_interval_ms":250}"#,
        )
        .unwrap();
        assert_eq!(config.retry_interval_ms, 250);
        assert_eq!(config.timeout_ms, 3_000);
        assert!(matches!(
            LockConfig::from_json("{not json"),
            Err(Error::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_build_memory_lock() {
        let lock = LockConfig::default().build().await.unwrap();
        let handle = lock.try_lock("cfg", Duration::from_secs(1), None).await.unwrap();
        assert!(handle.is_some());
    }
}
