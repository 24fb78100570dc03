//! Counter and ban-flag storage.
//!
//! Backends differ in how they offer "increment with expiry". Each one gets a
//! single adapter here, and everything above this module only sees
//! [`CacheStore`].

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::{IncrementStrategy, RedisConfig, RedisStore};

/// Uniform atomic primitives over a cache backend
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Atomically add `amount` to `key`, creating it with value `amount` if
    /// absent, and return the new value. The TTL is applied only when this
    /// call created the key; later increments never shorten it.
    async fn increment(&self, key: &str, amount: u64, ttl: Duration) -> Result<u64>;

    /// Read an integer value
    async fn read(&self, key: &str) -> Result<Option<i64>>;

    /// Set a value, replacing any existing value and TTL
    async fn write(&self, key: &str, value: i64, ttl: Duration) -> Result<()>;

    /// Remove a key
    async fn delete(&self, key: &str) -> Result<()>;

    /// Health check for the backend
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    /// Short backend name for logs and metrics
    fn backend(&self) -> &'static str;
}
