//! Request Guard
//!
//! A request admission layer in front of an application. Each request is
//! classified against named allow, deny, throttle, custom and track rules;
//! throttles count in fixed windows and deny rules can escalate into
//! Fail2Ban or Allow2Ban bans. Counters and bans live in a shared cache
//! store (Redis or in-process), and store failures fail open.

pub mod ban;
pub mod cache;
pub mod config;
pub mod decision;
pub mod error;
pub mod guard;
pub mod metrics;
pub mod notify;
pub mod request;
pub mod rules;
pub mod service;
pub mod store;
pub mod utils;

// Re-export main types
pub use ban::{Allow2Ban, BanPolicy, Fail2Ban};
pub use cache::Cache;
pub use config::{load_rules_from_file, load_rules_from_yaml, RulesConfig, Settings};
pub use decision::{Decision, MatchData, Outcome};
pub use error::{GuardError, Result};
pub use guard::Guard;
pub use request::Request;
pub use rules::{Registry, RuleKind, Rules, ThrottleLimit};
pub use service::{AdmissionResponse, AdmissionService, DefaultResponder, Responder};
pub use store::{CacheStore, MemoryStore, RedisStore};
