use super::{ttl_millis, LeaseStore};
use crate::Result;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client, Script};
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

const ACQUIRE_OR_RENEW_SCRIPT: &str = r#"
local prev = redis.call("get", KEYS[1])
if prev == false or prev == ARGV[1] then
    redis.call("set", KEYS[1], ARGV[1], "PX", ARGV[2])
    return 1
end
return 0
"#;

const RENEW_SCRIPT: &str = r#"
local prev = redis.call("get", KEYS[1])
if prev ~= false and prev == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
end
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
local prev = redis.call("get", KEYS[1])
if prev ~= false and prev == ARGV[1] then
    return redis.call("del", KEYS[1])
end
return 0
"#;

struct Scripts {
    acquire_or_renew: Script,
    renew: Script,
    release: Script,
}

impl Scripts {
    fn get() -> &'static Self {
        static SCRIPTS: OnceLock<Scripts> = OnceLock::new();
        SCRIPTS.get_or_init(|| Scripts {
            acquire_or_renew: Script::new(ACQUIRE_OR_RENEW_SCRIPT),
            renew: Script::new(RENEW_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        })
    }
}

/// Redis-backed lease store.
///
/// The three lease operations run as Lua scripts, which Redis executes
/// atomically. `Script` sends `EVALSHA` and falls back to `EVAL` when the
/// server has not cached the script yet.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        debug!("connected to Redis lease store");
        Ok(Self { conn })
    }

    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl LeaseStore for RedisStore {
    async fn acquire_or_renew(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let acquired: i64 = Scripts::get()
            .acquire_or_renew
            .key(key)
            .arg(token)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(acquired == 1)
    }

    async fn renew(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let renewed: i64 = Scripts::get()
            .renew
            .key(key)
            .arg(token)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = Scripts::get()
            .release
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn owner(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let owner: Option<String> = conn.get(key).await?;
        Ok(owner)
    }
}
