use http::{header, HeaderMap, HeaderValue, StatusCode};
use std::{path::Path, sync::Arc};
use tracing::{info, warn};

use crate::{
    config::load_rules_from_file,
    decision::{Decision, Outcome},
    error::Result,
    guard::Guard,
    metrics::Metrics,
    request::Request,
};

/// What the host should do with a classified request
#[derive(Debug, Clone)]
pub struct AdmissionResponse {
    pub decision: Decision,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
    /// Hand the request on to the application
    pub forward: bool,
}

impl AdmissionResponse {
    /// Default responses: 403 for denied, 429 with `Retry-After` for
    /// throttled, pass-through otherwise
    pub fn from_decision(decision: Decision) -> Self {
        let mut headers = HeaderMap::new();
        let (status, body) = match decision.outcome {
            Outcome::Allow | Outcome::Pass => (StatusCode::OK, String::new()),
            Outcome::Deny => (StatusCode::FORBIDDEN, "Forbidden\n".to_string()),
            Outcome::Throttle => {
                if let Some(retry_after) = decision.retry_after_secs {
                    headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
                }
                (StatusCode::TOO_MANY_REQUESTS, "Retry later\n".to_string())
            }
        };

        Self {
            forward: decision.outcome.forwards(),
            decision,
            status,
            headers,
            body,
        }
    }
}

/// Turns a decision into the response the host sends
pub trait Responder: Send + Sync {
    fn respond(&self, decision: Decision) -> AdmissionResponse;
}

/// 403 / 429 responses from [`AdmissionResponse::from_decision`]
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResponder;

impl Responder for DefaultResponder {
    fn respond(&self, decision: Decision) -> AdmissionResponse {
        AdmissionResponse::from_decision(decision)
    }
}

impl<F> Responder for F
where
    F: Fn(Decision) -> AdmissionResponse + Send + Sync,
{
    fn respond(&self, decision: Decision) -> AdmissionResponse {
        self(decision)
    }
}

/// Entry point for hosts: classify and translate into a response
pub struct AdmissionService {
    guard: Arc<Guard>,
    metrics: Arc<Metrics>,
    responder: Arc<dyn Responder>,
}

impl AdmissionService {
    pub fn new(guard: Arc<Guard>, metrics: Arc<Metrics>) -> Self {
        Self {
            guard,
            metrics,
            responder: Arc::new(DefaultResponder),
        }
    }

    /// Replace the default denied/throttled responses
    pub fn with_responder(mut self, responder: Arc<dyn Responder>) -> Self {
        self.responder = responder;
        self
    }

    pub fn guard(&self) -> &Arc<Guard> {
        &self.guard
    }

    /// Classify a request
    pub async fn check(&self, request: &Request) -> AdmissionResponse {
        let _timer = self.metrics.start_classify_timer();
        let decision = self.guard.classify(request).await;

        self.metrics.record_decision(
            decision.outcome.as_str(),
            decision.matched_rule.as_deref().unwrap_or(""),
        );

        self.responder.respond(decision)
    }

    /// Compile a rule file and publish it. The rules in force are kept when
    /// the file is invalid.
    pub async fn load_rules(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let compiled = load_rules_from_file(path).and_then(|config| config.compile());

        match compiled {
            Ok(rules) => {
                info!(path = %path.display(), rules = rules.len(), "loaded rules");
                self.guard.registry().replace(rules).await;
                self.metrics.record_rules_load_success();
                Ok(())
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load rules");
                self.metrics.record_rules_load_error();
                Err(e)
            }
        }
    }

    /// Health check for the service
    pub async fn health_check(&self) -> Result<()> {
        self.guard.health_check().await
    }
}
