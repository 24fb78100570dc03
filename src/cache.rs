//! Fixed-window counting on top of a [`CacheStore`].
//!
//! Counters are keyed by `(prefix, window index, rule, discriminator)` and
//! live for one period from their first increment. Bursts of up to twice the
//! limit across a window edge are accepted in exchange for one key per
//! window instead of one entry per request.

use std::{future::Future, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::warn;

use crate::{
    error::{GuardError, Result},
    metrics::Metrics,
    store::CacheStore,
    utils::{current_window, generate_cache_key, TimeSource},
};

/// Default key prefix
pub const DEFAULT_KEY_PREFIX: &str = "rack::attack";

/// Result of counting one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Count {
    /// Post-increment value of the window counter
    pub count: u64,
    /// Unix time at which the current window ends
    pub window_resets_at: i64,
    /// Unix time the count was taken at
    pub now: i64,
}

impl Count {
    /// Seconds until the window resets, in `1..=period`
    pub fn retry_after(&self) -> u64 {
        (self.window_resets_at - self.now).max(1) as u64
    }

    /// Whether this count is over `limit`. The `limit`-th request still passes.
    pub fn exceeds(&self, limit: u64) -> bool {
        self.count > limit
    }
}

/// Counting engine with bounded store calls
#[derive(Clone)]
pub struct Cache {
    store: Arc<dyn CacheStore>,
    prefix: String,
    time_source: TimeSource,
    operation_timeout: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl Cache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            prefix: DEFAULT_KEY_PREFIX.to_string(),
            time_source: TimeSource::new(),
            operation_timeout: Duration::from_millis(250),
            metrics: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_time_source(mut self, time_source: TimeSource) -> Self {
        self.time_source = time_source;
        self
    }

    /// Bound on every store call; an elapsed call is `StoreUnavailable`
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn time_source(&self) -> &TimeSource {
        &self.time_source
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    /// Key under this cache's prefix
    pub fn key(&self, suffix: &str) -> String {
        if self.prefix.is_empty() {
            suffix.to_string()
        } else {
            format!("{}:{}", self.prefix, suffix)
        }
    }

    /// Count one request for `name`/`discriminator` in the current window of
    /// length `period`.
    pub async fn count(&self, name: &str, discriminator: &str, period: Duration) -> Result<Count> {
        let period_secs = period.as_secs().max(1);
        let now = self.time_source.unix_now();
        let window = current_window(now, period_secs);
        let key = generate_cache_key(&self.prefix, name, discriminator, window.index);

        let count = self
            .guarded("increment", self.store.increment(&key, 1, Duration::from_secs(period_secs)))
            .await?;

        Ok(Count {
            count,
            window_resets_at: window.resets_at,
            now,
        })
    }

    /// Key of the counter `count` would use right now
    pub fn current_key(&self, name: &str, discriminator: &str, period: Duration) -> String {
        let window = current_window(self.time_source.unix_now(), period.as_secs().max(1));
        generate_cache_key(&self.prefix, name, discriminator, window.index)
    }

    pub async fn read(&self, key: &str) -> Result<Option<i64>> {
        self.guarded("read", self.store.read(key)).await
    }

    pub async fn write(&self, key: &str, value: i64, ttl: Duration) -> Result<()> {
        self.guarded("write", self.store.write(key, value, ttl)).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.guarded("delete", self.store.delete(key)).await
    }

    /// Health check for the backing store
    pub async fn health_check(&self) -> Result<()> {
        self.guarded("health_check", self.store.health_check()).await
    }

    /// Run one store call under the operation timeout, recording metrics
    async fn guarded<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.operation_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(GuardError::StoreUnavailable(format!(
                "{} {} timed out after {}ms",
                self.store.backend(),
                operation,
                self.operation_timeout.as_millis()
            ))),
        };

        if let Some(metrics) = &self.metrics {
            let outcome = match &result {
                Ok(_) => "ok",
                Err(e) if e.is_store_unavailable() => "unavailable",
                Err(_) => "error",
            };
            metrics.record_store_operation(operation, outcome);
            metrics.record_store_operation_duration(operation, started.elapsed().as_secs_f64());
        }

        if let Err(e) = &result {
            warn!(backend = self.store.backend(), operation, error = %e, "store operation failed");
        }
        result
    }
}
