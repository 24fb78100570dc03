use serde::Serialize;
use std::fmt;

use crate::rules::RuleKind;

/// Final outcome for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Forwarded, but a custom rule recorded the request
    Allow,
    /// A deny rule matched
    Deny,
    /// A throttle rule went over its limit
    Throttle,
    /// Forwarded unmodified: an allow rule matched, or nothing terminal did
    Pass,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Allow => "allow",
            Outcome::Deny => "deny",
            Outcome::Throttle => "throttle",
            Outcome::Pass => "pass",
        }
    }

    /// Whether the request continues to the application
    pub fn forwards(self) -> bool {
        matches!(self, Outcome::Allow | Outcome::Pass)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a matching rule saw
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct MatchData {
    pub discriminator: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period_secs: Option<u64>,
}

impl MatchData {
    pub fn matched(discriminator: impl Into<String>) -> Self {
        Self {
            discriminator: discriminator.into(),
            ..Default::default()
        }
    }
}

/// Admission decision for one request. `match_type` tells an allowlisted
/// `Pass` (`Some(Allow)`) from a plain pass-through (`None`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub outcome: Outcome,
    pub matched_rule: Option<String>,
    pub match_type: Option<RuleKind>,
    pub retry_after_secs: Option<u64>,
    pub match_data: Option<MatchData>,
}

impl Decision {
    /// Nothing terminal matched
    pub fn pass_through() -> Self {
        Self {
            outcome: Outcome::Pass,
            matched_rule: None,
            match_type: None,
            retry_after_secs: None,
            match_data: None,
        }
    }

    /// Forwarded, but flagged by a custom rule
    pub fn flagged(rule: &str, data: MatchData) -> Self {
        Self::matched(Outcome::Allow, rule, RuleKind::Custom, data)
    }

    /// An allow rule matched
    pub fn pass(rule: &str, data: MatchData) -> Self {
        Self::matched(Outcome::Pass, rule, RuleKind::Allow, data)
    }

    pub fn deny(rule: &str, data: MatchData) -> Self {
        Self::matched(Outcome::Deny, rule, RuleKind::Deny, data)
    }

    pub fn throttle(rule: &str, retry_after_secs: u64, data: MatchData) -> Self {
        Self {
            retry_after_secs: Some(retry_after_secs),
            ..Self::matched(Outcome::Throttle, rule, RuleKind::Throttle, data)
        }
    }

    fn matched(outcome: Outcome, rule: &str, kind: RuleKind, data: MatchData) -> Self {
        Self {
            outcome,
            matched_rule: Some(rule.to_string()),
            match_type: Some(kind),
            retry_after_secs: None,
            match_data: Some(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_decision_carries_retry_after() {
        let data = MatchData {
            discriminator: "1.2.3.4".to_string(),
            count: Some(6),
            limit: Some(5),
            period_secs: Some(60),
        };
        let decision = Decision::throttle("logins/ip", 42, data);

        assert_eq!(decision.outcome, Outcome::Throttle);
        assert_eq!(decision.retry_after_secs, Some(42));
        assert_eq!(decision.match_type, Some(RuleKind::Throttle));
        assert!(!decision.outcome.forwards());
    }

    #[test]
    fn test_decision_serializes() {
        let decision = Decision::deny("bad-agents", MatchData::matched(""));
        let json = serde_json::to_value(&decision).unwrap();

        assert_eq!(json["outcome"], "deny");
        assert_eq!(json["matched_rule"], "bad-agents");
        assert_eq!(json["match_type"], "deny");
        assert!(json["match_data"].get("count").is_none());
    }

    #[test]
    fn test_pass_through_is_pass_without_rule() {
        let decision = Decision::pass_through();
        assert_eq!(decision.outcome, Outcome::Pass);
        assert_eq!(decision.match_type, None);
        assert!(decision.outcome.forwards());
    }

    #[test]
    fn test_flagged_still_forwards() {
        let decision = Decision::flagged("auto-blacklist", MatchData::matched("9.9.9.9"));
        assert!(decision.outcome.forwards());
        assert_eq!(decision.match_type, Some(RuleKind::Custom));
    }
}
