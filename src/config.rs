use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

use crate::{
    ban::BanPolicy,
    cache::DEFAULT_KEY_PREFIX,
    error::{GuardError, Result},
    request::Request,
    rules::{RuleKind, Rules, ThrottleLimit},
    store::{IncrementStrategy, RedisConfig},
};

/// Declarative rule file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RulesConfig {
    #[serde(default)]
    pub allow: Vec<RuleEntry>,
    #[serde(default)]
    pub deny: Vec<RuleEntry>,
    #[serde(default)]
    pub throttle: Vec<RuleEntry>,
    #[serde(default)]
    pub custom: Vec<RuleEntry>,
    #[serde(default)]
    pub track: Vec<RuleEntry>,
}

/// One rule in the file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleEntry {
    pub name: String,
    #[serde(rename = "match", default)]
    pub matcher: RequestMatcher,
    /// `ip`, `real_ip`, `path` or `header:<name>`
    pub discriminator: Option<String>,
    pub limit: Option<u64>,
    /// Seconds
    pub period: Option<u64>,
    pub fail2ban: Option<BanEntry>,
    pub allow2ban: Option<BanEntry>,
}

/// Ban thresholds, times in seconds
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BanEntry {
    pub find_time: u64,
    pub ban_time: u64,
    #[serde(alias = "max_allowed")]
    pub max_retry: u64,
}

impl BanEntry {
    fn policy(&self) -> Result<BanPolicy> {
        BanPolicy::new(
            Duration::from_secs(self.find_time),
            Duration::from_secs(self.ban_time),
            self.max_retry,
        )
    }
}

/// Header condition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeaderMatch {
    pub name: String,
    pub equals: Option<String>,
    pub contains: Option<String>,
}

/// Conditions on a request. All present conditions must hold; an empty
/// matcher matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestMatcher {
    #[serde(default)]
    pub ip: Vec<String>,
    pub method: Option<String>,
    pub path: Option<String>,
    pub path_prefix: Option<String>,
    pub path_contains: Option<String>,
    pub header: Option<HeaderMatch>,
}

impl RequestMatcher {
    pub fn matches(&self, request: &Request) -> bool {
        if !self.ip.is_empty() && !self.ip.iter().any(|ip| ip == request.ip()) {
            return false;
        }
        if let Some(method) = &self.method {
            if !method.eq_ignore_ascii_case(request.method().as_str()) {
                return false;
            }
        }
        if let Some(path) = &self.path {
            if path != request.path() {
                return false;
            }
        }
        if let Some(prefix) = &self.path_prefix {
            if !request.path().starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(fragment) = &self.path_contains {
            if !request.path().contains(fragment.as_str()) {
                return false;
            }
        }
        if let Some(header) = &self.header {
            let Some(value) = request.header(&header.name) else {
                return false;
            };
            if header.equals.as_deref().is_some_and(|expected| expected != value) {
                return false;
            }
            if header
                .contains
                .as_deref()
                .is_some_and(|fragment| !value.contains(fragment))
            {
                return false;
            }
        }
        true
    }
}

/// Where a rule takes its discriminator from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscriminatorSource {
    Ip,
    RealIp,
    Path,
    Header(String),
}

impl DiscriminatorSource {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "ip" => Ok(Self::Ip),
            "real_ip" => Ok(Self::RealIp),
            "path" => Ok(Self::Path),
            other => match other.strip_prefix("header:") {
                Some(name) if !name.is_empty() => Ok(Self::Header(name.to_ascii_lowercase())),
                _ => Err(GuardError::MisconfiguredRule(format!(
                    "unknown discriminator '{}'",
                    raw
                ))),
            },
        }
    }

    pub fn extract(&self, request: &Request) -> Option<String> {
        match self {
            Self::Ip => Some(request.ip().to_string()),
            Self::RealIp => Some(request.real_ip().to_string()),
            Self::Path => Some(request.path().to_string()),
            Self::Header(name) => request.header(name).map(str::to_string),
        }
    }
}

impl RuleEntry {
    fn source(&self) -> Result<Option<DiscriminatorSource>> {
        self.discriminator.as_deref().map(DiscriminatorSource::parse).transpose()
    }

    /// Predicate: the matcher must hold, then the discriminator (empty when
    /// none is configured) is extracted
    fn predicate(&self) -> Result<impl Fn(&Request) -> Option<String> + Send + Sync + 'static> {
        let matcher = self.matcher.clone();
        let source = self.source()?;
        Ok(move |request: &Request| {
            if !matcher.matches(request) {
                return None;
            }
            match &source {
                Some(source) => source.extract(request),
                None => Some(String::new()),
            }
        })
    }

    fn throttle_limit(&self) -> Result<ThrottleLimit> {
        match (self.limit, self.period) {
            (Some(limit), Some(period)) => ThrottleLimit::new(limit, Duration::from_secs(period)),
            _ => Err(GuardError::MisconfiguredRule(format!(
                "rule '{}' needs both limit and period",
                self.name
            ))),
        }
    }

    /// Reject options the rule's kind has no use for
    fn reject_unused(&self, kind: RuleKind) -> Result<()> {
        let counted = matches!(kind, RuleKind::Throttle | RuleKind::Track);
        let banned = kind == RuleKind::Deny;

        let unused = [
            ("limit", self.limit.is_some() && !counted),
            ("period", self.period.is_some() && !counted),
            ("fail2ban", self.fail2ban.is_some() && !banned),
            ("allow2ban", self.allow2ban.is_some() && !banned),
        ];
        match unused.iter().find(|(_, present)| *present) {
            Some((option, _)) => Err(GuardError::MisconfiguredRule(format!(
                "{} rule '{}' does not take '{}'",
                kind, self.name, option
            ))),
            None => Ok(()),
        }
    }

    fn require_discriminator(&self) -> Result<()> {
        if self.discriminator.is_none() {
            return Err(GuardError::MisconfiguredRule(format!(
                "rule '{}' needs a discriminator",
                self.name
            )));
        }
        Ok(())
    }
}

impl RulesConfig {
    /// Build the rule set, rejecting invalid rules
    pub fn compile(&self) -> Result<Rules> {
        let mut rules = Rules::new();

        for entry in &self.allow {
            entry.reject_unused(RuleKind::Allow)?;
            rules.allow(entry.name.clone(), entry.predicate()?);
        }

        for entry in &self.deny {
            entry.reject_unused(RuleKind::Deny)?;
            let predicate = entry.predicate()?;
            match (&entry.fail2ban, &entry.allow2ban) {
                (Some(_), Some(_)) => {
                    return Err(GuardError::MisconfiguredRule(format!(
                        "rule '{}' cannot use both fail2ban and allow2ban",
                        entry.name
                    )));
                }
                // the matcher picks the offending requests; the ban applies to
                // every request from the discriminator
                (Some(ban), None) => {
                    entry.require_discriminator()?;
                    let matcher = entry.matcher.clone();
                    let source = entry.source()?;
                    rules.deny_fail2ban(
                        entry.name.clone(),
                        ban.policy()?,
                        move |request: &Request| source.as_ref().and_then(|s| s.extract(request)),
                        move |request: &Request| matcher.matches(request),
                    );
                }
                (None, Some(ban)) => {
                    entry.require_discriminator()?;
                    let matcher = entry.matcher.clone();
                    let source = entry.source()?;
                    rules.deny_allow2ban(
                        entry.name.clone(),
                        ban.policy()?,
                        move |request: &Request| source.as_ref().and_then(|s| s.extract(request)),
                        move |request: &Request| matcher.matches(request),
                    );
                }
                (None, None) => rules.deny(entry.name.clone(), predicate),
            }
        }

        for entry in &self.throttle {
            entry.reject_unused(RuleKind::Throttle)?;
            entry.require_discriminator()?;
            rules.throttle(entry.name.clone(), entry.throttle_limit()?, entry.predicate()?);
        }

        for entry in &self.custom {
            entry.reject_unused(RuleKind::Custom)?;
            rules.custom(entry.name.clone(), entry.predicate()?);
        }

        for entry in &self.track {
            entry.reject_unused(RuleKind::Track)?;
            if entry.limit.is_some() || entry.period.is_some() {
                entry.require_discriminator()?;
                rules.track_with_limit(entry.name.clone(), entry.throttle_limit()?, entry.predicate()?);
            } else {
                rules.track(entry.name.clone(), entry.predicate()?);
            }
        }

        Ok(rules)
    }
}

/// Load rules from a YAML string
pub fn load_rules_from_yaml(yaml: &str) -> Result<RulesConfig> {
    serde_yaml::from_str(yaml).map_err(|e| GuardError::Config(format!("Failed to parse YAML: {}", e)))
}

/// Load rules from a YAML file
pub fn load_rules_from_file(path: impl AsRef<Path>) -> Result<RulesConfig> {
    let content = std::fs::read_to_string(path)?;
    load_rules_from_yaml(&content)
}

/// Which store backs counters and bans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

/// Store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default)]
    pub increment_strategy: IncrementStrategy,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_redis_url(),
            increment_strategy: IncrementStrategy::default(),
            connection_timeout_ms: default_connection_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            memory_capacity: default_memory_capacity(),
        }
    }
}

impl StoreSettings {
    pub fn redis_config(&self) -> RedisConfig {
        RedisConfig {
            url: self.url.clone(),
            connection_timeout: Some(Duration::from_millis(self.connection_timeout_ms)),
            command_timeout: Some(Duration::from_millis(self.command_timeout_ms)),
            increment_strategy: self.increment_strategy,
        }
    }
}

/// Runtime settings for the sidecar
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    #[serde(default = "default_key_prefix")]
    pub cache_key_prefix: String,
    /// Bound on each store call, in milliseconds
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default = "default_notify_queue_size")]
    pub notify_queue_size: usize,
    pub rules_path: Option<String>,
    #[serde(default)]
    pub store: StoreSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            cache_key_prefix: default_key_prefix(),
            operation_timeout_ms: default_operation_timeout_ms(),
            notify_queue_size: default_notify_queue_size(),
            rules_path: None,
            store: StoreSettings::default(),
        }
    }
}

impl Settings {
    /// Defaults, overridden by an optional file, overridden by `GUARD__*`
    /// environment variables (e.g. `GUARD__STORE__BACKEND=redis`)
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("GUARD").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_operation_timeout_ms() -> u64 {
    250
}

fn default_notify_queue_size() -> usize {
    1024
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_connection_timeout_ms() -> u64 {
    5000
}

fn default_command_timeout_ms() -> u64 {
    1000
}

fn default_memory_capacity() -> u64 {
    100_000
}
