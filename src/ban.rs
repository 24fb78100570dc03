//! Ban windows layered on the counting engine.
//!
//! A ban is a record holding the unix time it ends, stored with a TTL of the
//! ban length. A discriminator is banned while that record exists and its
//! end time is still ahead; expiry is the only way back to clean. Concurrent
//! callers crossing the threshold together write the same record.

use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{
    cache::Cache,
    error::{GuardError, Result},
};

/// Thresholds for a ban filter. Only constructed through [`BanPolicy::new`],
/// so every policy in use has non-zero values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BanPolicy {
    find_time: Duration,
    ban_time: Duration,
    max_retry: u64,
}

impl BanPolicy {
    pub fn new(find_time: Duration, ban_time: Duration, max_retry: u64) -> Result<Self> {
        if find_time.as_secs() == 0 {
            return Err(GuardError::MisconfiguredRule(
                "find_time must be at least one second".to_string(),
            ));
        }
        if ban_time.as_secs() == 0 {
            return Err(GuardError::MisconfiguredRule(
                "ban_time must be at least one second".to_string(),
            ));
        }
        if max_retry == 0 {
            return Err(GuardError::MisconfiguredRule(
                "max_retry must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            find_time,
            ban_time,
            max_retry,
        })
    }

    /// Window over which events are counted
    pub fn find_time(&self) -> Duration {
        self.find_time
    }

    /// How long a ban lasts once written
    pub fn ban_time(&self) -> Duration {
        self.ban_time
    }

    /// Event threshold. Fail2Ban bans on reaching it, Allow2Ban on passing it.
    pub fn max_retry(&self) -> u64 {
        self.max_retry
    }
}

/// Shared ban bookkeeping for both filters
#[derive(Clone)]
struct BanTracker {
    cache: Cache,
    scope: &'static str,
}

impl BanTracker {
    fn ban_key(&self, discriminator: &str) -> String {
        self.cache.key(&format!("{}:ban:{}", self.scope, discriminator))
    }

    fn count_name(&self) -> String {
        format!("{}:count", self.scope)
    }

    /// Live ban check. Store failures read as "not banned".
    async fn is_banned(&self, discriminator: &str) -> bool {
        match self.cache.read(&self.ban_key(discriminator)).await {
            Ok(Some(banned_until)) => self.cache.time_source().unix_now() < banned_until,
            Ok(None) => false,
            Err(e) => {
                self.fail_open(discriminator, &e);
                false
            }
        }
    }

    /// Count one event; `None` when the store could not be reached
    async fn record_event(&self, discriminator: &str, policy: &BanPolicy) -> Option<u64> {
        match self
            .cache
            .count(&self.count_name(), discriminator, policy.find_time())
            .await
        {
            Ok(count) => Some(count.count),
            Err(e) => {
                self.fail_open(discriminator, &e);
                None
            }
        }
    }

    /// Write the ban record. Returns false if it could not be stored.
    async fn ban(&self, discriminator: &str, policy: &BanPolicy) -> bool {
        let banned_until = self.cache.time_source().unix_now() + policy.ban_time().as_secs() as i64;
        match self
            .cache
            .write(&self.ban_key(discriminator), banned_until, policy.ban_time())
            .await
        {
            Ok(()) => {
                info!(
                    scope = self.scope,
                    discriminator,
                    banned_until,
                    "discriminator banned"
                );
                true
            }
            Err(e) => {
                self.fail_open(discriminator, &e);
                false
            }
        }
    }

    async fn reset(&self, discriminator: &str, policy: &BanPolicy) -> Result<()> {
        let counter = self
            .cache
            .current_key(&self.count_name(), discriminator, policy.find_time());
        self.cache.delete(&counter).await?;
        self.cache.delete(&self.ban_key(discriminator)).await
    }

    fn fail_open(&self, discriminator: &str, err: &GuardError) {
        warn!(scope = self.scope, discriminator, error = %err, "ban check failed open");
        if let Some(metrics) = self.cache.metrics() {
            metrics.record_fail_open(self.scope);
        }
    }
}

/// Escalating ban: too many offending events inside `find_time` bans the
/// discriminator for `ban_time`.
#[derive(Clone)]
pub struct Fail2Ban {
    tracker: BanTracker,
}

impl Fail2Ban {
    pub fn new(cache: Cache) -> Self {
        Self {
            tracker: BanTracker {
                cache,
                scope: "fail2ban",
            },
        }
    }

    /// Whether `discriminator` is blocked after this request.
    ///
    /// A live ban short-circuits with no side effect. Otherwise an offending
    /// request is counted, and the one that brings the count to
    /// `max_retry` writes the ban and is itself blocked.
    pub async fn filter(&self, discriminator: &str, policy: &BanPolicy, offending: bool) -> bool {
        if self.tracker.is_banned(discriminator).await {
            debug!(discriminator, "fail2ban: already banned");
            return true;
        }
        if !offending {
            return false;
        }

        match self.tracker.record_event(discriminator, policy).await {
            Some(count) if count >= policy.max_retry() => self.tracker.ban(discriminator, policy).await,
            _ => false,
        }
    }

    /// Side-effect-free ban check
    pub async fn is_banned(&self, discriminator: &str) -> bool {
        self.tracker.is_banned(discriminator).await
    }

    /// Lift a ban and clear the current event count
    pub async fn reset(&self, discriminator: &str, policy: &BanPolicy) -> Result<()> {
        self.tracker.reset(discriminator, policy).await
    }
}

/// Allow-after-threshold: up to `max_retry` counted requests pass inside
/// `find_time`, the next one bans the discriminator for `ban_time`.
#[derive(Clone)]
pub struct Allow2Ban {
    tracker: BanTracker,
}

impl Allow2Ban {
    pub fn new(cache: Cache) -> Self {
        Self {
            tracker: BanTracker {
                cache,
                scope: "allow2ban",
            },
        }
    }

    /// Whether `discriminator` is blocked after this request
    pub async fn filter(&self, discriminator: &str, policy: &BanPolicy, counted: bool) -> bool {
        if self.tracker.is_banned(discriminator).await {
            debug!(discriminator, "allow2ban: already banned");
            return true;
        }
        if !counted {
            return false;
        }

        match self.tracker.record_event(discriminator, policy).await {
            Some(count) if count > policy.max_retry() => self.tracker.ban(discriminator, policy).await,
            _ => false,
        }
    }

    pub async fn is_banned(&self, discriminator: &str) -> bool {
        self.tracker.is_banned(discriminator).await
    }

    pub async fn reset(&self, discriminator: &str, policy: &BanPolicy) -> Result<()> {
        self.tracker.reset(discriminator, policy).await
    }
}
