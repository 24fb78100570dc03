use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, RedisError, Script};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use super::CacheStore;
use crate::{
    error::{GuardError, Result},
    utils::ttl_secs,
};

/// INCRBY, then EXPIRE only if the key has no TTL yet. Runs server side as
/// one atomic step.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCRBY', KEYS[1], ARGV[1])
if redis.call('TTL', KEYS[1]) < 0 then
  redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return count
"#;

/// How the adapter gets "increment with expiry" out of the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncrementStrategy {
    /// One Lua script call doing the increment and the first-write expiry
    #[default]
    Atomic,
    /// INCRBY, then EXPIRE when the returned value equals the amount, i.e.
    /// this call created the key. For servers or proxies without scripting.
    IncrThenExpire,
}

/// Redis client configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub connection_timeout: Option<Duration>,
    pub command_timeout: Option<Duration>,
    pub increment_strategy: IncrementStrategy,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connection_timeout: Some(Duration::from_secs(5)),
            command_timeout: Some(Duration::from_secs(1)),
            increment_strategy: IncrementStrategy::Atomic,
        }
    }
}

/// Redis-backed counter and ban store
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    config: RedisConfig,
    increment_script: Script,
}

impl RedisStore {
    /// Connect and verify the server answers PING
    pub async fn connect(config: RedisConfig) -> Result<Self> {
        info!("Creating Redis client for URL: {}", config.url);

        let client = redis::Client::open(config.url.clone()).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            GuardError::Redis(e)
        })?;

        let connect_timeout = config.connection_timeout.unwrap_or(Duration::from_secs(10));
        let connection = match tokio::time::timeout(connect_timeout, client.get_connection_manager()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!("Failed to create connection manager: {}", e);
                return Err(unavailable("connect", e));
            }
            Err(_) => {
                warn!("Timeout while creating connection manager ({}s)", connect_timeout.as_secs());
                return Err(GuardError::StoreUnavailable(
                    "timeout while creating Redis connection manager".to_string(),
                ));
            }
        };

        let store = Self {
            connection,
            config,
            increment_script: Script::new(INCREMENT_SCRIPT),
        };

        let ping_timeout = store.config.command_timeout.unwrap_or(Duration::from_secs(5));
        match tokio::time::timeout(ping_timeout, store.ping()).await {
            Ok(Ok(())) => info!("Redis PING successful"),
            Ok(Err(e)) => {
                warn!("Redis PING failed: {}", e);
                return Err(e);
            }
            Err(_) => {
                warn!("Redis PING timeout ({}s)", ping_timeout.as_secs());
                return Err(GuardError::StoreUnavailable(
                    "timeout while testing Redis connection".to_string(),
                ));
            }
        }

        info!(
            strategy = ?store.config.increment_strategy,
            "Redis store initialized successfully"
        );
        Ok(store)
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        redis::cmd("PING")
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| unavailable("ping", e))
    }

    async fn increment_atomic(&self, key: &str, amount: u64, ttl: u64) -> Result<u64> {
        let mut conn = self.connection.clone();
        let count: i64 = self
            .increment_script
            .key(key)
            .arg(amount)
            .arg(ttl)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| unavailable("increment", e))?;
        Ok(count.max(0) as u64)
    }

    async fn increment_then_expire(&self, key: &str, amount: u64, ttl: u64) -> Result<u64> {
        let mut conn = self.connection.clone();
        let count: u64 = conn
            .incr(key, amount)
            .await
            .map_err(|e| unavailable("increment", e))?;

        // Only the call that created the key sets the expiry
        if count == amount {
            let _: bool = conn
                .expire(key, ttl as i64)
                .await
                .map_err(|e| unavailable("expire", e))?;
        }
        Ok(count)
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn increment(&self, key: &str, amount: u64, ttl: Duration) -> Result<u64> {
        let ttl = ttl_secs(ttl);
        match self.config.increment_strategy {
            IncrementStrategy::Atomic => self.increment_atomic(key, amount, ttl).await,
            IncrementStrategy::IncrThenExpire => self.increment_then_expire(key, amount, ttl).await,
        }
    }

    async fn read(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.connection.clone();
        conn.get::<_, Option<i64>>(key)
            .await
            .map_err(|e| unavailable("read", e))
    }

    async fn write(&self, key: &str, value: i64, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| unavailable("write", e))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| unavailable("delete", e))
    }

    async fn health_check(&self) -> Result<()> {
        self.ping().await
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

/// Transport failures become `StoreUnavailable`; anything else (type errors,
/// script errors) stays a Redis error.
fn unavailable(operation: &str, err: RedisError) -> GuardError {
    if err.is_io_error() || err.is_timeout() || err.is_connection_dropped() || err.is_connection_refusal() {
        GuardError::StoreUnavailable(format!("redis {} failed: {}", operation, err))
    } else {
        GuardError::Redis(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config_defaults() {
        let config = RedisConfig::default();
        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.increment_strategy, IncrementStrategy::Atomic);
        assert_eq!(config.command_timeout, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_increment_strategy_deserializes_snake_case() {
        let strategy: IncrementStrategy = serde_yaml::from_str("incr_then_expire").unwrap();
        assert_eq!(strategy, IncrementStrategy::IncrThenExpire);
    }

    #[test]
    fn test_io_errors_are_unavailable() {
        let io = RedisError::from(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"));
        assert!(unavailable("increment", io).is_store_unavailable());

        let type_error = RedisError::from((redis::ErrorKind::TypeError, "not an integer"));
        assert!(matches!(unavailable("read", type_error), GuardError::Redis(_)));
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let config = RedisConfig {
            url: "redis://127.0.0.1:1".to_string(),
            connection_timeout: Some(Duration::from_millis(500)),
            ..Default::default()
        };
        assert!(RedisStore::connect(config).await.is_err());
    }
}
