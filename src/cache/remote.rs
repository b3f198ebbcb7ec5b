//! Shared cache backends.
//!
//! The response cache always keeps an in-process tier; a [`CacheClient`]
//! adds a shared tier in front of it so several gateway processes can
//! reuse each other's responses. Remote failures are never fatal: the
//! response cache logs them and carries on with the local tier.

use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

/// Minimal key/value store with expiry.
#[async_trait]
pub trait CacheClient: Send + Sync {
    /// Fetch a value, `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value that expires after `ttl`.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Remove every key starting with `prefix`.
    async fn clear_prefix(&self, prefix: &str) -> Result<()>;
}

#[cfg(feature = "redis")]
pub use self::redis_client::RedisCacheClient;

#[cfg(feature = "redis")]
mod redis_client {
    use std::time::Duration;

    use async_trait::async_trait;
    use redis::aio::ConnectionManager;
    use redis::{AsyncCommands, Client};
    use tracing::info;

    use super::CacheClient;
    use crate::{HeimdallError, Result};

    /// Upper bound on the initial connection, so a dead server cannot
    /// stall gateway startup.
    const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Keys requested per `SCAN` round when clearing a prefix.
    const SCAN_BATCH: usize = 500;

    /// [`CacheClient`] backed by Redis (`GET` / `SETEX` / `SCAN` + `DEL`).
    ///
    /// Holds one managed connection that is cloned per call and reconnects
    /// on its own after the server drops it.
    pub struct RedisCacheClient {
        conn: ConnectionManager,
    }

    impl RedisCacheClient {
        /// Connect and verify the server answers.
        pub async fn connect(url: &str) -> Result<Self> {
            let client = Client::open(url)
                .map_err(|e| HeimdallError::Cache(format!("invalid redis url: {e}")))?;
            let mut conn = tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(client))
                .await
                .map_err(|_| HeimdallError::Cache("redis connection timed out".into()))?
                .map_err(cache_err)?;
            let _: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(cache_err)?;
            info!(url, "redis cache connected");
            Ok(Self { conn })
        }
    }

    fn cache_err(e: redis::RedisError) -> HeimdallError {
        HeimdallError::Cache(e.to_string())
    }

    #[async_trait]
    impl CacheClient for RedisCacheClient {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            let mut conn = self.conn.clone();
            conn.get::<_, Option<String>>(key).await.map_err(cache_err)
        }

        async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
            let mut conn = self.conn.clone();
            conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
                .await
                .map_err(cache_err)
        }

        async fn clear_prefix(&self, prefix: &str) -> Result<()> {
            let mut conn = self.conn.clone();
            let pattern = format!("{prefix}*");
            let mut cursor: u64 = 0;
            loop {
                let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async(&mut conn)
                    .await
                    .map_err(cache_err)?;
                if !keys.is_empty() {
                    conn.del::<_, ()>(keys).await.map_err(cache_err)?;
                }
                if next == 0 {
                    return Ok(());
                }
                cursor = next;
            }
        }
    }
}
