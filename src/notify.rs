//! Best-effort instrumentation.
//!
//! `notify` never waits: events go into a bounded queue and are dropped (and
//! counted) when it is full. A background task hands them to an `EventSink`.
//! Nothing here can change a decision.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info};

use crate::{decision::MatchData, metrics::Metrics, request::Request, rules::RuleKind};

/// Request fields carried on an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestSummary {
    pub ip: String,
    pub method: String,
    pub path: String,
}

impl From<&Request> for RequestSummary {
    fn from(request: &Request) -> Self {
        Self {
            ip: request.ip().to_string(),
            method: request.method().to_string(),
            path: request.path().to_string(),
        }
    }
}

/// One rule match
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub name: String,
    pub rule: String,
    pub kind: RuleKind,
    pub request: RequestSummary,
    pub data: MatchData,
    pub at: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: RuleKind, rule: &str, request: &Request, data: MatchData, at: DateTime<Utc>) -> Self {
        Self {
            name: format!("request_guard.{}", kind),
            rule: rule.to_string(),
            kind,
            request: RequestSummary::from(request),
            data,
            at,
        }
    }
}

/// Destination for instrumentation events
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn handle(&self, event: Event);
}

/// Writes events to the `tracing` log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn handle(&self, event: Event) {
        info!(
            event = %event.name,
            rule = %event.rule,
            ip = %event.request.ip,
            method = %event.request.method,
            path = %event.request.path,
            discriminator = %event.data.discriminator,
            count = ?event.data.count,
            "rule matched"
        );
    }
}

/// Handle used by the evaluator to emit events
#[derive(Clone)]
pub struct Instrumentation {
    tx: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
    metrics: Option<Arc<Metrics>>,
}

impl Instrumentation {
    /// Start the delivery task. It ends once every handle is dropped.
    pub fn spawn(sink: Arc<dyn EventSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Event>(capacity.max(1));
        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                sink.handle(event).await;
            }
            debug!("instrumentation queue closed");
        });

        let instrumentation = Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            metrics: None,
        };
        (instrumentation, worker)
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Queue an event without waiting
    pub fn notify(&self, event: Event) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            if let Some(metrics) = &self.metrics {
                metrics.record_notification_dropped();
            }
        }
    }

    /// Events lost to a full or closed queue
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
