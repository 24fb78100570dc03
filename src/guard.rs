//! Request classification.
//!
//! Kinds run in a fixed order: allow, deny, throttle, custom, track. Allow
//! and deny stop at the first match. Every matching throttle rule counts the
//! request, and the first one over its limit decides. Custom and track rules
//! all run and never block.
//!
//! Requests are not serialized against each other. Shared counting state lives
//! in the store, whose increments are atomic.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::{
    ban::{Allow2Ban, Fail2Ban},
    cache::Cache,
    decision::{Decision, MatchData},
    error::Result,
    notify::{Event, Instrumentation},
    request::Request,
    rules::{Check, Registry, Rule, RuleKind, Rules, ThrottleLimit},
};

/// The admission decision function
pub struct Guard {
    registry: Arc<Registry>,
    cache: Cache,
    fail2ban: Fail2Ban,
    allow2ban: Allow2Ban,
    instrumentation: Option<Instrumentation>,
}

impl Guard {
    pub fn new(registry: Arc<Registry>, cache: Cache) -> Self {
        Self {
            fail2ban: Fail2Ban::new(cache.clone()),
            allow2ban: Allow2Ban::new(cache.clone()),
            registry,
            cache,
            instrumentation: None,
        }
    }

    pub fn with_instrumentation(mut self, instrumentation: Instrumentation) -> Self {
        self.instrumentation = Some(instrumentation);
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn fail2ban(&self) -> &Fail2Ban {
        &self.fail2ban
    }

    pub fn allow2ban(&self) -> &Allow2Ban {
        &self.allow2ban
    }

    /// Decide what happens to `request`. Rule matches are published once
    /// the decision is final.
    pub async fn classify(&self, request: &Request) -> Decision {
        let rules = self.registry.snapshot().await;
        let mut matches = Vec::new();
        let decision = self.evaluate(&rules, request, &mut matches).await;
        self.publish(matches, request);
        decision
    }

    /// Health check for the backing store
    pub async fn health_check(&self) -> Result<()> {
        self.cache.health_check().await
    }

    async fn evaluate<'r>(
        &self,
        rules: &'r Rules,
        request: &Request,
        matches: &mut Vec<(&'r Rule, MatchData)>,
    ) -> Decision {
        if let Some(decision) = self.check_allow(rules, request) {
            return decision;
        }
        if let Some(decision) = self.check_deny(rules, request, matches).await {
            return decision;
        }
        if let Some(decision) = self.check_throttle(rules, request, matches).await {
            return decision;
        }

        let flagged = self.run_custom(rules, request, matches);
        self.run_track(rules, request, matches).await;

        flagged.unwrap_or_else(Decision::pass_through)
    }

    fn check_allow(&self, rules: &Rules, request: &Request) -> Option<Decision> {
        rules.of_kind(RuleKind::Allow).iter().find_map(|rule| {
            rule.discriminate(request).map(|discriminator| {
                debug!(rule = rule.name(), "allow rule matched");
                Decision::pass(rule.name(), MatchData::matched(discriminator))
            })
        })
    }

    async fn check_deny<'r>(
        &self,
        rules: &'r Rules,
        request: &Request,
        matches: &mut Vec<(&'r Rule, MatchData)>,
    ) -> Option<Decision> {
        for rule in rules.of_kind(RuleKind::Deny) {
            let Some(discriminator) = rule.discriminate(request) else {
                continue;
            };

            let denied = match rule.check() {
                Check::Match => true,
                Check::Throttle(limit) => self
                    .count_over_limit(rule, limit, discriminator.clone())
                    .await
                    .is_some(),
                Check::Fail2Ban { policy, offending } => {
                    let is_offending = guarded_test(rule, || offending(request));
                    let key = scoped(rule, &discriminator);
                    self.fail2ban.filter(&key, policy, is_offending).await
                }
                Check::Allow2Ban { policy, counted } => {
                    let is_counted = guarded_test(rule, || counted(request));
                    let key = scoped(rule, &discriminator);
                    self.allow2ban.filter(&key, policy, is_counted).await
                }
            };

            if denied {
                let data = MatchData::matched(discriminator);
                matches.push((rule.as_ref(), data.clone()));
                debug!(rule = rule.name(), "deny rule matched");
                return Some(Decision::deny(rule.name(), data));
            }
        }
        None
    }

    async fn check_throttle<'r>(
        &self,
        rules: &'r Rules,
        request: &Request,
        matches: &mut Vec<(&'r Rule, MatchData)>,
    ) -> Option<Decision> {
        let mut decision = None;

        for rule in rules.of_kind(RuleKind::Throttle) {
            let Check::Throttle(limit) = rule.check() else {
                continue;
            };
            let Some(discriminator) = rule.discriminate(request) else {
                continue;
            };
            let Some((data, retry_after)) = self.count_over_limit(rule, limit, discriminator).await else {
                continue;
            };

            if decision.is_none() {
                debug!(rule = rule.name(), retry_after, "throttle rule over limit");
                decision = Some(Decision::throttle(rule.name(), retry_after, data.clone()));
            }
            matches.push((rule.as_ref(), data));
        }
        decision
    }

    fn run_custom<'r>(
        &self,
        rules: &'r Rules,
        request: &Request,
        matches: &mut Vec<(&'r Rule, MatchData)>,
    ) -> Option<Decision> {
        let mut flagged = None;

        for rule in rules.of_kind(RuleKind::Custom) {
            let Some(discriminator) = rule.discriminate(request) else {
                continue;
            };
            let data = MatchData::matched(discriminator);
            if flagged.is_none() {
                flagged = Some(Decision::flagged(rule.name(), data.clone()));
            }
            matches.push((rule.as_ref(), data));
        }
        flagged
    }

    async fn run_track<'r>(
        &self,
        rules: &'r Rules,
        request: &Request,
        matches: &mut Vec<(&'r Rule, MatchData)>,
    ) {
        for rule in rules.of_kind(RuleKind::Track) {
            let Some(discriminator) = rule.discriminate(request) else {
                continue;
            };

            match rule.check() {
                Check::Throttle(limit) => {
                    if let Some((data, _)) = self.count_over_limit(rule, limit, discriminator).await {
                        matches.push((rule.as_ref(), data));
                    }
                }
                _ => matches.push((rule.as_ref(), MatchData::matched(discriminator))),
            }
        }
    }

    /// Count the request against `limit`. Returns match data and retry hint
    /// only when over the limit; store failures fail open.
    async fn count_over_limit(
        &self,
        rule: &Rule,
        limit: &ThrottleLimit,
        discriminator: String,
    ) -> Option<(MatchData, u64)> {
        match self.cache.count(&counter_name(rule), &discriminator, limit.period()).await {
            Ok(count) if count.exceeds(limit.limit()) => Some((
                MatchData {
                    discriminator,
                    count: Some(count.count),
                    limit: Some(limit.limit()),
                    period_secs: Some(limit.period_secs()),
                },
                count.retry_after(),
            )),
            Ok(_) => None,
            Err(e) => {
                warn!(rule = rule.name(), error = %e, "throttle check failed open");
                if let Some(metrics) = self.cache.metrics() {
                    metrics.record_fail_open(rule.kind().as_str());
                }
                None
            }
        }
    }

    fn publish(&self, matches: Vec<(&Rule, MatchData)>, request: &Request) {
        if matches.is_empty() {
            return;
        }
        let at = self.cache.time_source().utc_now();

        for (rule, data) in matches {
            if let Some(metrics) = self.cache.metrics() {
                metrics.record_rule_match(rule.kind().as_str(), rule.name());
            }
            if let Some(instrumentation) = &self.instrumentation {
                instrumentation.notify(Event::new(rule.kind(), rule.name(), request, data, at));
            }
        }
    }
}

/// Counter names carry the kind, since rule names are only unique per kind
fn counter_name(rule: &Rule) -> String {
    format!("{}:{}", rule.kind(), rule.name())
}

/// Ban state is kept per rule so two ban rules never share a counter
fn scoped(rule: &Rule, discriminator: &str) -> String {
    format!("{}:{}", rule.name(), discriminator)
}

/// Run a rule's secondary test; a panic counts as `false`
fn guarded_test<F: FnOnce() -> bool>(rule: &Rule, test: F) -> bool {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(test)).unwrap_or_else(|_| {
        tracing::error!(rule = rule.name(), "rule test panicked");
        false
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ban::BanPolicy,
        decision::Outcome,
        notify::{EventSink, Instrumentation},
        store::MemoryStore,
        utils::TimeSource,
    };
    use async_trait::async_trait;
    use http::Method;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Collect {
        events: Mutex<Vec<Event>>,
    }

    #[async_trait]
    impl EventSink for Collect {
        async fn handle(&self, event: Event) {
            self.events.lock().await.push(event);
        }
    }

    fn guard_at(now: i64, rules: Rules) -> Guard {
        let cache = Cache::new(Arc::new(MemoryStore::default())).with_time_source(TimeSource::manual(now));
        Guard::new(Arc::new(Registry::new(rules)), cache)
    }

    fn get(ip: &str, path: &str) -> Request {
        Request::new(ip, Method::GET, path)
    }

    #[tokio::test]
    async fn test_no_rules_passes() {
        let guard = guard_at(0, Rules::new());
        let decision = guard.classify(&get("1.2.3.4", "/")).await;
        assert_eq!(decision, Decision::pass_through());
        assert_eq!(decision.outcome, Outcome::Pass);
    }

    #[tokio::test]
    async fn test_allow_beats_deny() {
        let mut rules = Rules::new();
        rules.allow("localhost", |req: &Request| req.ip() == "127.0.0.1");
        rules.deny("everyone", |_: &Request| true);
        let guard = guard_at(0, rules);

        let decision = guard.classify(&get("127.0.0.1", "/")).await;
        assert_eq!(decision.outcome, Outcome::Pass);
        assert_eq!(decision.matched_rule.as_deref(), Some("localhost"));

        let decision = guard.classify(&get("10.0.0.1", "/")).await;
        assert_eq!(decision.outcome, Outcome::Deny);
        assert_eq!(decision.matched_rule.as_deref(), Some("everyone"));
    }

    #[tokio::test]
    async fn test_first_over_limit_throttle_decides_but_all_count() {
        let mut rules = Rules::new();
        let tight = ThrottleLimit::new(1, Duration::from_secs(60)).unwrap();
        let loose = ThrottleLimit::new(100, Duration::from_secs(60)).unwrap();
        rules.throttle("loose", loose, |req: &Request| Some(req.ip().to_string()));
        rules.throttle("tight", tight, |req: &Request| Some(req.ip().to_string()));
        let guard = guard_at(30, rules);

        assert_eq!(guard.classify(&get("1.1.1.1", "/")).await.outcome, Outcome::Pass);
        let decision = guard.classify(&get("1.1.1.1", "/")).await;
        assert_eq!(decision.outcome, Outcome::Throttle);
        assert_eq!(decision.matched_rule.as_deref(), Some("tight"));
        assert_eq!(decision.retry_after_secs, Some(30));

        let loose_key = guard.cache().current_key("throttle:loose", "1.1.1.1", Duration::from_secs(60));
        assert_eq!(guard.cache().read(&loose_key).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_fail2ban_deny_rule() {
        let mut rules = Rules::new();
        let policy = BanPolicy::new(Duration::from_secs(120), Duration::from_secs(300), 2).unwrap();
        rules.deny_fail2ban(
            "pentesters",
            policy,
            |req: &Request| Some(req.ip().to_string()),
            |req: &Request| req.path().contains("/etc/passwd"),
        );
        let guard = guard_at(1_000, rules);

        assert_eq!(guard.classify(&get("6.6.6.6", "/etc/passwd")).await.outcome, Outcome::Pass);
        assert_eq!(guard.classify(&get("6.6.6.6", "/etc/passwd")).await.outcome, Outcome::Deny);
        // banned for ordinary paths too
        assert_eq!(guard.classify(&get("6.6.6.6", "/home")).await.outcome, Outcome::Deny);
        assert_eq!(guard.classify(&get("7.7.7.7", "/home")).await.outcome, Outcome::Pass);

        assert!(guard.fail2ban().is_banned("pentesters:6.6.6.6").await);
    }

    #[tokio::test]
    async fn test_custom_flags_but_forwards_and_track_still_runs() {
        let mut rules = Rules::new();
        rules.custom("broken", |_: &Request| -> bool { panic!("custom rule failure") });
        rules.custom("scanner", |req: &Request| req.path().starts_with("/wp-admin"));
        let limit = ThrottleLimit::new(1, Duration::from_secs(60)).unwrap();
        rules.track_with_limit("noisy", limit, |req: &Request| Some(req.ip().to_string()));
        let guard = guard_at(0, rules);

        let decision = guard.classify(&get("5.5.5.5", "/wp-admin/setup.php")).await;
        assert_eq!(decision.outcome, Outcome::Allow);
        assert_eq!(decision.matched_rule.as_deref(), Some("scanner"));
        assert_eq!(decision.match_type, Some(RuleKind::Custom));

        // the track counter ran despite the broken custom rule
        let key = guard.cache().current_key("track:noisy", "5.5.5.5", Duration::from_secs(60));
        assert_eq!(guard.cache().read(&key).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_same_name_throttle_and_track_count_separately() {
        let mut rules = Rules::new();
        let limit = ThrottleLimit::new(1, Duration::from_secs(60)).unwrap();
        rules.throttle("per-ip", limit, |req: &Request| Some(req.ip().to_string()));
        rules.track_with_limit("per-ip", limit, |req: &Request| Some(req.ip().to_string()));
        let guard = guard_at(0, rules);

        assert_eq!(guard.classify(&get("3.3.3.3", "/")).await.outcome, Outcome::Pass);

        let period = Duration::from_secs(60);
        let throttle_key = guard.cache().current_key("throttle:per-ip", "3.3.3.3", period);
        let track_key = guard.cache().current_key("track:per-ip", "3.3.3.3", period);
        assert_eq!(guard.cache().read(&throttle_key).await.unwrap(), Some(1));
        assert_eq!(guard.cache().read(&track_key).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_matches_are_published_with_the_decision() {
        let mut rules = Rules::new();
        let limit = ThrottleLimit::new(1, Duration::from_secs(60)).unwrap();
        rules.throttle("tight", limit, |req: &Request| Some(req.ip().to_string()));
        rules.track("everything", |_: &Request| true);

        let sink = Arc::new(Collect::default());
        let (instrumentation, worker) = Instrumentation::spawn(sink.clone(), 16);
        let guard = guard_at(0, rules).with_instrumentation(instrumentation);

        guard.classify(&get("4.4.4.4", "/")).await;
        let decision = guard.classify(&get("4.4.4.4", "/")).await;
        assert_eq!(decision.outcome, Outcome::Throttle);

        drop(guard);
        worker.await.unwrap();

        let events = sink.events.lock().await;
        let names: Vec<&str> = events.iter().map(|event| event.rule.as_str()).collect();
        // the throttled request stops before track rules run
        assert_eq!(names, vec!["everything", "tight"]);
        assert_eq!(events[1].data.count, Some(2));
        assert_eq!(events[1].kind, RuleKind::Throttle);
    }
}
