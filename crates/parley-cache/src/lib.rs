//! Redis status mirror for Parley
//!
//! Mirrors each expert's busy flag, bound session and remaining billable
//! intervals into Redis so dashboards can read them without touching the
//! engine. The mirror is write-only from the engine's point of view: admission
//! decisions never read it back.
//!
//! # Example
//!
//! ```no_run
//! use parley_cache::RedisCache;
//! use parley_core::traits::StatusMirror;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cache = RedisCache::new("redis://127.0.0.1:6379").await?;
//!     cache.expert_busy("e1", None).await?;
//!     cache.expert_free("e1").await?;
//!     Ok(())
//! }
//! ```

pub mod keys;

use async_trait::async_trait;
use parley_core::error::AppError;
use parley_core::traits::StatusMirror;
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisError};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Redis-backed `StatusMirror`
///
/// Wraps a Redis ConnectionManager, which multiplexes one connection and
/// reconnects on its own.
#[derive(Clone)]
pub struct RedisCache {
    manager: ConnectionManager,
}

impl RedisCache {
    /// Connect to Redis
    ///
    /// # Errors
    ///
    /// Returns `AppError::CacheConnection` if the connection fails
    pub async fn new(url: &str) -> Result<Self, AppError> {
        debug!("Connecting to Redis at {}", url);

        let client = Client::open(url).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            AppError::CacheConnection(format!("Invalid Redis URL: {}", e))
        })?;

        let manager = ConnectionManager::new(client).await.map_err(|e| {
            error!("Failed to establish Redis connection: {}", e);
            AppError::CacheConnection(format!("Connection failed: {}", e))
        })?;

        debug!("Redis connection established successfully");
        Ok(Self { manager })
    }

    /// Ping the Redis server to check connectivity
    pub async fn ping(&self) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                error!("Redis ping failed: {}", e);
                AppError::Cache(format!("Ping failed: {}", e))
            })?;
        Ok(())
    }

    /// Read back the mirrored busy flag
    pub async fn is_expert_busy(&self, expert_id: &str) -> Result<bool, AppError> {
        let mut conn = self.manager.clone();
        conn.exists(keys::expert_busy_key(expert_id))
            .await
            .map_err(Self::map_redis_error)
    }

    /// Read back the mirrored remaining intervals
    pub async fn mirrored_remaining(&self, expert_id: &str) -> Result<Option<i64>, AppError> {
        let mut conn = self.manager.clone();
        conn.get(keys::expert_remaining_key(expert_id))
            .await
            .map_err(Self::map_redis_error)
    }

    #[cfg(test)]
    async fn flush_db(&self) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("FLUSHDB")
            .query_async(&mut conn)
            .await
            .map_err(Self::map_redis_error)?;
        Ok(())
    }

    /// Convert RedisError to AppError
    fn map_redis_error(err: RedisError) -> AppError {
        match err.kind() {
            redis::ErrorKind::IoError => {
                error!("Redis I/O error: {}", err);
                AppError::CacheConnection(format!("I/O error: {}", err))
            }
            redis::ErrorKind::TypeError => {
                warn!("Redis type error: {}", err);
                AppError::Cache(format!("Type mismatch: {}", err))
            }
            _ => {
                error!("Redis error: {}", err);
                AppError::Cache(err.to_string())
            }
        }
    }
}

#[async_trait]
impl StatusMirror for RedisCache {
    async fn expert_busy(&self, expert_id: &str, session_id: Option<Uuid>) -> Result<(), AppError> {
        debug!("SET {} (session {:?})", keys::expert_busy_key(expert_id), session_id);
        let mut conn = self.manager.clone();

        let mut pipe = redis::pipe();
        pipe.set_ex(keys::expert_busy_key(expert_id), "1", keys::STATUS_TTL_SECS)
            .ignore();
        match session_id {
            Some(id) => {
                pipe.set_ex(
                    keys::expert_session_key(expert_id),
                    id.to_string(),
                    keys::STATUS_TTL_SECS,
                )
                .ignore();
            }
            None => {
                pipe.del(keys::expert_session_key(expert_id)).ignore();
            }
        }

        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(Self::map_redis_error)?;
        Ok(())
    }

    async fn expert_free(&self, expert_id: &str) -> Result<(), AppError> {
        debug!("DEL status keys of {}", expert_id);
        let mut conn = self.manager.clone();

        let _: i64 = conn
            .del(&keys::expert_keys(expert_id)[..])
            .await
            .map_err(Self::map_redis_error)?;
        Ok(())
    }

    async fn remaining_intervals(&self, expert_id: &str, remaining: i64) -> Result<(), AppError> {
        debug!("SET {} = {}", keys::expert_remaining_key(expert_id), remaining);
        let mut conn = self.manager.clone();

        let _: () = conn
            .set_ex(
                keys::expert_remaining_key(expert_id),
                remaining,
                keys::STATUS_TTL_SECS,
            )
            .await
            .map_err(Self::map_redis_error)?;
        Ok(())
    }
}
