use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::time::timeout;

mod mock;

pub use mock::{MockRedisCall, MockRedisClient};

// Both dedup layers sit on the hot path, a slow cache must not stall it
const REDIS_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("timed out talking to the cache")]
    Timeout,
    #[error("invalid cache configuration: {0}")]
    InvalidConfiguration(String),
    #[error(transparent)]
    Redis(#[from] Arc<redis::RedisError>),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            CacheError::Timeout
        } else {
            CacheError::Redis(Arc::new(err))
        }
    }
}

/// The two operations both dedup layers need from the key-value cache.
#[async_trait]
pub trait Client: Send + Sync {
    async fn exists(&self, k: String) -> Result<bool, CacheError>;

    /// Mark the key as present for `seconds`.
    async fn set_ex(&self, k: String, seconds: u64) -> Result<(), CacheError>;
}

pub struct RedisClient {
    connection: redis::aio::MultiplexedConnection,
}

impl RedisClient {
    pub async fn new(addr: String) -> Result<RedisClient, CacheError> {
        let client = redis::Client::open(addr)
            .map_err(|e| CacheError::InvalidConfiguration(e.to_string()))?;
        let connection = timeout(
            REDIS_TIMEOUT * 10,
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| CacheError::Timeout)??;

        Ok(RedisClient { connection })
    }
}

#[async_trait]
impl Client for RedisClient {
    async fn exists(&self, k: String) -> Result<bool, CacheError> {
        let mut conn = self.connection.clone();
        let results = conn.exists(k);
        let fut = timeout(REDIS_TIMEOUT, results)
            .await
            .map_err(|_| CacheError::Timeout)?;

        Ok(fut?)
    }

    async fn set_ex(&self, k: String, seconds: u64) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        let seconds = usize::try_from(seconds)
            .map_err(|_| CacheError::InvalidConfiguration(format!("ttl {seconds} too large")))?;
        let results = conn.set_ex::<_, _, ()>(k, 1, seconds);
        timeout(REDIS_TIMEOUT, results)
            .await
            .map_err(|_| CacheError::Timeout)??;

        Ok(())
    }
}
