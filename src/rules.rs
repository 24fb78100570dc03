//! Named rule sets and their published snapshot.
//!
//! `Rules` is a plain value edited at configuration time. `Registry` owns the
//! published `Arc<Rules>`: writers build a modified copy and swap it in whole,
//! readers clone the `Arc` once per request. Rules are shared as `Arc<Rule>`
//! and never mutated, so a reader can never see a half-built one.

use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::info;

use crate::{
    ban::BanPolicy,
    error::{GuardError, Result},
    request::Request,
};

/// Maps a request to the key it is grouped by; `None` means no match
pub type Discriminator = Arc<dyn Fn(&Request) -> Option<String> + Send + Sync>;

/// Boolean test on a request
pub type RequestTest = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

/// Return values a rule predicate may use
pub trait Matched {
    fn into_discriminator(self) -> Option<String>;
}

impl Matched for bool {
    /// A bare match groups nothing, so its discriminator is empty
    fn into_discriminator(self) -> Option<String> {
        self.then(String::new)
    }
}

impl Matched for Option<String> {
    fn into_discriminator(self) -> Option<String> {
        self
    }
}

/// Rule kinds, in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Allow,
    Deny,
    Throttle,
    Custom,
    Track,
}

impl RuleKind {
    pub const ALL: [RuleKind; 5] = [
        RuleKind::Allow,
        RuleKind::Deny,
        RuleKind::Throttle,
        RuleKind::Custom,
        RuleKind::Track,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RuleKind::Allow => "allow",
            RuleKind::Deny => "deny",
            RuleKind::Throttle => "throttle",
            RuleKind::Custom => "custom",
            RuleKind::Track => "track",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request budget per fixed window. Only constructed through
/// [`ThrottleLimit::new`], so limit and period are never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleLimit {
    limit: u64,
    period: Duration,
}

impl ThrottleLimit {
    pub fn new(limit: u64, period: Duration) -> Result<Self> {
        if limit == 0 {
            return Err(GuardError::MisconfiguredRule(
                "limit must be greater than zero".to_string(),
            ));
        }
        if period.as_secs() == 0 {
            return Err(GuardError::MisconfiguredRule(
                "period must be at least one second".to_string(),
            ));
        }
        Ok(Self { limit, period })
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn period_secs(&self) -> u64 {
        self.period.as_secs()
    }
}

/// What a rule does once its predicate yields a discriminator
#[derive(Clone)]
pub enum Check {
    /// The match alone decides
    Match,
    /// Count the request; over the limit is a hit
    Throttle(ThrottleLimit),
    /// Escalating ban fed by offending requests
    Fail2Ban { policy: BanPolicy, offending: RequestTest },
    /// Ban once more than `max_retry` counted requests arrive in `find_time`
    Allow2Ban { policy: BanPolicy, counted: RequestTest },
}

impl fmt::Debug for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Check::Match => f.write_str("Match"),
            Check::Throttle(limit) => f.debug_tuple("Throttle").field(limit).finish(),
            Check::Fail2Ban { policy, .. } => f.debug_struct("Fail2Ban").field("policy", policy).finish(),
            Check::Allow2Ban { policy, .. } => f.debug_struct("Allow2Ban").field("policy", policy).finish(),
        }
    }
}

/// An immutable, named rule
pub struct Rule {
    name: String,
    kind: RuleKind,
    discriminator: Discriminator,
    check: Check,
}

impl Rule {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RuleKind {
        self.kind
    }

    pub fn check(&self) -> &Check {
        &self.check
    }

    /// Run the predicate. A panicking predicate counts as no match.
    pub fn discriminate(&self, request: &Request) -> Option<String> {
        let predicate = &self.discriminator;
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| predicate(request))) {
            Ok(discriminator) => discriminator,
            Err(_) => {
                tracing::error!(rule = %self.name, kind = %self.kind, "rule predicate panicked");
                None
            }
        }
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("check", &self.check)
            .finish()
    }
}

fn discriminator<F, M>(predicate: F) -> Discriminator
where
    F: Fn(&Request) -> M + Send + Sync + 'static,
    M: Matched,
{
    Arc::new(move |request: &Request| predicate(request).into_discriminator())
}

fn request_test<F>(test: F) -> RequestTest
where
    F: Fn(&Request) -> bool + Send + Sync + 'static,
{
    Arc::new(test)
}

/// Rules of every kind, each kind in registration order
#[derive(Debug, Clone, Default)]
pub struct Rules {
    allow: Vec<Arc<Rule>>,
    deny: Vec<Arc<Rule>>,
    throttle: Vec<Arc<Rule>>,
    custom: Vec<Arc<Rule>>,
    track: Vec<Arc<Rule>>,
}

impl Rules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests matching `predicate` bypass every other check
    pub fn allow<F, M>(&mut self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&Request) -> M + Send + Sync + 'static,
        M: Matched,
    {
        self.insert(name.into(), RuleKind::Allow, discriminator(predicate), Check::Match);
    }

    /// Requests matching `predicate` are denied
    pub fn deny<F, M>(&mut self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&Request) -> M + Send + Sync + 'static,
        M: Matched,
    {
        self.insert(name.into(), RuleKind::Deny, discriminator(predicate), Check::Match);
    }

    /// Deny discriminators that produced `max_retry` offending requests
    /// within `find_time`, for `ban_time`
    pub fn deny_fail2ban<F, M, O>(
        &mut self,
        name: impl Into<String>,
        policy: BanPolicy,
        predicate: F,
        offending: O,
    ) where
        F: Fn(&Request) -> M + Send + Sync + 'static,
        M: Matched,
        O: Fn(&Request) -> bool + Send + Sync + 'static,
    {
        let check = Check::Fail2Ban {
            policy,
            offending: request_test(offending),
        };
        self.insert(name.into(), RuleKind::Deny, discriminator(predicate), check);
    }

    /// Deny discriminators that made more than `max_retry` counted requests
    /// within `find_time`, for `ban_time`
    pub fn deny_allow2ban<F, M, C>(
        &mut self,
        name: impl Into<String>,
        policy: BanPolicy,
        predicate: F,
        counted: C,
    ) where
        F: Fn(&Request) -> M + Send + Sync + 'static,
        M: Matched,
        C: Fn(&Request) -> bool + Send + Sync + 'static,
    {
        let check = Check::Allow2Ban {
            policy,
            counted: request_test(counted),
        };
        self.insert(name.into(), RuleKind::Deny, discriminator(predicate), check);
    }

    /// Throttle requests by the discriminator `predicate` returns
    pub fn throttle<F>(&mut self, name: impl Into<String>, limit: ThrottleLimit, predicate: F)
    where
        F: Fn(&Request) -> Option<String> + Send + Sync + 'static,
    {
        self.insert(name.into(), RuleKind::Throttle, discriminator(predicate), Check::Throttle(limit));
    }

    /// Observe matching requests without affecting the decision
    pub fn track<F, M>(&mut self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&Request) -> M + Send + Sync + 'static,
        M: Matched,
    {
        self.insert(name.into(), RuleKind::Track, discriminator(predicate), Check::Match);
    }

    /// Observe matching requests only once a discriminator goes over `limit`
    pub fn track_with_limit<F>(&mut self, name: impl Into<String>, limit: ThrottleLimit, predicate: F)
    where
        F: Fn(&Request) -> Option<String> + Send + Sync + 'static,
    {
        self.insert(name.into(), RuleKind::Track, discriminator(predicate), Check::Throttle(limit));
    }

    /// Side-effecting check whose match is recorded but still forwarded
    pub fn custom<F, M>(&mut self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&Request) -> M + Send + Sync + 'static,
        M: Matched,
    {
        self.insert(name.into(), RuleKind::Custom, discriminator(predicate), Check::Match);
    }

    /// Rules of one kind, in evaluation order
    pub fn of_kind(&self, kind: RuleKind) -> &[Arc<Rule>] {
        match kind {
            RuleKind::Allow => &self.allow,
            RuleKind::Deny => &self.deny,
            RuleKind::Throttle => &self.throttle,
            RuleKind::Custom => &self.custom,
            RuleKind::Track => &self.track,
        }
    }

    pub fn get(&self, kind: RuleKind, name: &str) -> Option<&Arc<Rule>> {
        self.of_kind(kind).iter().find(|rule| rule.name == name)
    }

    pub fn remove(&mut self, kind: RuleKind, name: &str) -> Option<Arc<Rule>> {
        let rules = self.kind_mut(kind);
        let position = rules.iter().position(|rule| rule.name == name)?;
        Some(rules.remove(position))
    }

    pub fn len(&self) -> usize {
        RuleKind::ALL.iter().map(|kind| self.of_kind(*kind).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn kind_mut(&mut self, kind: RuleKind) -> &mut Vec<Arc<Rule>> {
        match kind {
            RuleKind::Allow => &mut self.allow,
            RuleKind::Deny => &mut self.deny,
            RuleKind::Throttle => &mut self.throttle,
            RuleKind::Custom => &mut self.custom,
            RuleKind::Track => &mut self.track,
        }
    }

    /// Same name within a kind replaces the old rule at its position
    fn insert(&mut self, name: String, kind: RuleKind, discriminator: Discriminator, check: Check) {
        let rule = Arc::new(Rule {
            name,
            kind,
            discriminator,
            check,
        });
        let rules = self.kind_mut(kind);
        match rules.iter().position(|existing| existing.name == rule.name) {
            Some(position) => rules[position] = rule,
            None => rules.push(rule),
        }
    }
}

/// Published rules shared by concurrent evaluations
#[derive(Debug, Default)]
pub struct Registry {
    current: RwLock<Arc<Rules>>,
}

impl Registry {
    pub fn new(rules: Rules) -> Self {
        Self {
            current: RwLock::new(Arc::new(rules)),
        }
    }

    /// The rules in force right now
    pub async fn snapshot(&self) -> Arc<Rules> {
        self.current.read().await.clone()
    }

    /// Edit a copy of the current rules and publish it
    pub async fn update<F, T>(&self, edit: F) -> T
    where
        F: FnOnce(&mut Rules) -> T,
    {
        let mut current = self.current.write().await;
        let mut next = Rules::clone(&current);
        let result = edit(&mut next);
        *current = Arc::new(next);
        result
    }

    /// Publish a whole new rule set
    pub async fn replace(&self, rules: Rules) {
        info!(rules = rules.len(), "publishing rule set");
        *self.current.write().await = Arc::new(rules);
    }

    pub async fn clear(&self) {
        self.replace(Rules::new()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    fn request(ip: &str) -> Request {
        Request::new(ip, Method::GET, "/")
    }

    #[test]
    fn test_bool_and_option_predicates() {
        let mut rules = Rules::new();
        rules.allow("localhost", |req: &Request| req.ip() == "127.0.0.1");
        rules.track("by-ip", |req: &Request| Some(req.ip().to_string()));

        let allow = rules.get(RuleKind::Allow, "localhost").unwrap();
        assert_eq!(allow.discriminate(&request("127.0.0.1")), Some(String::new()));
        assert_eq!(allow.discriminate(&request("10.0.0.1")), None);

        let track = rules.get(RuleKind::Track, "by-ip").unwrap();
        assert_eq!(track.discriminate(&request("10.0.0.1")), Some("10.0.0.1".to_string()));
    }

    #[test]
    fn test_reregistering_replaces_in_place() {
        let mut rules = Rules::new();
        rules.deny("a", |_: &Request| true);
        rules.deny("b", |_: &Request| true);
        rules.deny("a", |_: &Request| false);

        let names: Vec<&str> = rules.of_kind(RuleKind::Deny).iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(rules.get(RuleKind::Deny, "a").unwrap().discriminate(&request("x")), None);
    }

    #[test]
    fn test_invalid_limits_never_reach_a_rule_set() {
        fn register(rules: &mut Rules, limit: u64, max_retry: u64) -> Result<()> {
            let limit = ThrottleLimit::new(limit, Duration::from_secs(60))?;
            rules.throttle("req/ip", limit, |req: &Request| Some(req.ip().to_string()));
            let policy = BanPolicy::new(Duration::from_secs(60), Duration::from_secs(60), max_retry)?;
            rules.deny_fail2ban("scan", policy, |req: &Request| Some(req.ip().to_string()), |_: &Request| true);
            Ok(())
        }

        let mut rules = Rules::new();
        assert!(matches!(register(&mut rules, 0, 3), Err(GuardError::MisconfiguredRule(_))));
        assert!(rules.is_empty());

        assert!(matches!(register(&mut rules, 5, 0), Err(GuardError::MisconfiguredRule(_))));
        assert!(rules.of_kind(RuleKind::Deny).is_empty());

        assert!(register(&mut rules, 5, 3).is_ok());
        let rule = rules.get(RuleKind::Throttle, "req/ip").unwrap();
        match rule.check() {
            Check::Throttle(limit) => assert_eq!((limit.limit(), limit.period_secs()), (5, 60)),
            _ => panic!("expected a throttle check"),
        }
    }

    #[test]
    fn test_names_are_unique_per_kind_only() {
        let mut rules = Rules::new();
        rules.allow("same", |_: &Request| true);
        rules.deny("same", |_: &Request| true);
        assert_eq!(rules.len(), 2);

        rules.remove(RuleKind::Allow, "same");
        assert_eq!(rules.len(), 1);
        rules.clear();
        assert!(rules.is_empty());
    }

    #[test]
    fn test_panicking_predicate_is_no_match() {
        let mut rules = Rules::new();
        rules.custom("broken", |_: &Request| -> bool { panic!("boom") });

        let rule = rules.get(RuleKind::Custom, "broken").unwrap();
        assert_eq!(rule.discriminate(&request("x")), None);
    }

    #[test]
    fn test_throttle_limit_validation() {
        assert!(ThrottleLimit::new(0, Duration::from_secs(60)).is_err());
        assert!(ThrottleLimit::new(5, Duration::from_millis(500)).is_err());
        let limit = ThrottleLimit::new(5, Duration::from_secs(60)).unwrap();
        assert_eq!(limit.period_secs(), 60);
    }

    #[tokio::test]
    async fn test_registry_publishes_whole_snapshots() {
        let registry = Registry::default();
        let before = registry.snapshot().await;

        registry
            .update(|rules| rules.deny("block", |_: &Request| true))
            .await;

        // an old snapshot stays as it was
        assert!(before.is_empty());
        assert_eq!(registry.snapshot().await.len(), 1);

        registry.clear().await;
        assert!(registry.snapshot().await.is_empty());
    }
}
