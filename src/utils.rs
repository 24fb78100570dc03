use chrono::{DateTime, TimeZone, Utc};
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};
use std::time::Duration;

/// Time utilities for window and ban calculations.
///
/// The system source reads the wall clock. A manual source holds a settable
/// unix timestamp, which tests use to move across window and ban boundaries
/// without sleeping.
#[derive(Debug, Clone, Default)]
pub struct TimeSource {
    manual: Option<Arc<AtomicI64>>,
}

impl TimeSource {
    pub fn new() -> Self {
        Self { manual: None }
    }

    /// A time source frozen at `unix_secs` until moved with `advance`/`set`
    pub fn manual(unix_secs: i64) -> Self {
        Self {
            manual: Some(Arc::new(AtomicI64::new(unix_secs))),
        }
    }

    /// Get the current Unix timestamp in seconds
    pub fn unix_now(&self) -> i64 {
        match &self.manual {
            Some(now) => now.load(Ordering::SeqCst),
            None => Utc::now().timestamp(),
        }
    }

    /// Get the current time as a DateTime<Utc>
    pub fn utc_now(&self) -> DateTime<Utc> {
        match &self.manual {
            Some(_) => Utc
                .timestamp_opt(self.unix_now(), 0)
                .single()
                .unwrap_or_else(Utc::now),
            None => Utc::now(),
        }
    }

    /// Move a manual clock forward. Returns false for the system clock.
    pub fn advance(&self, by: Duration) -> bool {
        match &self.manual {
            Some(now) => {
                now.fetch_add(by.as_secs() as i64, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Pin a manual clock to `unix_secs`. Returns false for the system clock.
    pub fn set(&self, unix_secs: i64) -> bool {
        match &self.manual {
            Some(now) => {
                now.store(unix_secs, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }
}

/// A fixed counting window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub index: i64,
    pub resets_at: i64,
}

/// Locate the window containing `now`. Windows are closed on the left, so a
/// timestamp exactly on a boundary belongs to the new window.
pub fn current_window(now: i64, period_secs: u64) -> Window {
    let size = period_secs.max(1) as i64;
    let index = now.div_euclid(size);
    Window {
        index,
        resets_at: (index + 1) * size,
    }
}

/// Generate the counter key for a rule, discriminator and window
pub fn generate_cache_key(prefix: &str, rule: &str, discriminator: &str, window: i64) -> String {
    if prefix.is_empty() {
        format!("{}:{}:{}", window, rule, discriminator)
    } else {
        format!("{}:{}:{}:{}", prefix, window, rule, discriminator)
    }
}

/// Whole seconds of a TTL, never below one second
pub fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}
