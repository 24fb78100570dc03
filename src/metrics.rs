use prometheus::{
    Counter, CounterVec, Histogram, HistogramOpts, HistogramVec, IntCounter, Opts, Registry,
};
use std::sync::Arc;

/// Metrics collector for the request guard
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Decision metrics
    decisions: CounterVec,
    rule_matches: CounterVec,
    fail_open: CounterVec,

    // Store metrics
    store_operations: CounterVec,
    store_operation_duration: HistogramVec,
    store_evictions: IntCounter,

    // Instrumentation
    notifications_dropped: IntCounter,

    // Service metrics
    rules_load_success: Counter,
    rules_load_error: Counter,
    classify_duration: Histogram,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let decisions = CounterVec::new(
            Opts::new(
                "request_guard_decisions_total",
                "Number of admission decisions by outcome",
            ),
            &["outcome", "rule"],
        )?;

        let rule_matches = CounterVec::new(
            Opts::new(
                "request_guard_rule_matches_total",
                "Number of rule matches by kind and rule name",
            ),
            &["kind", "rule"],
        )?;

        let fail_open = CounterVec::new(
            Opts::new(
                "request_guard_fail_open_total",
                "Number of checks that failed open because the store was unavailable",
            ),
            &["check"],
        )?;

        let store_operations = CounterVec::new(
            Opts::new(
                "request_guard_store_operations_total",
                "Number of store operations by type and result",
            ),
            &["operation", "result"],
        )?;

        let store_operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "request_guard_store_operation_duration_seconds",
                "Duration of store operations in seconds",
            ),
            &["operation"],
        )?;

        let store_evictions = IntCounter::new(
            "request_guard_store_evictions_total",
            "Number of live counters evicted from the memory store at capacity",
        )?;

        let notifications_dropped = IntCounter::new(
            "request_guard_notifications_dropped_total",
            "Number of instrumentation events dropped on a full or closed queue",
        )?;

        let rules_load_success = Counter::new(
            "request_guard_rules_load_success_total",
            "Number of successful rule loads",
        )?;

        let rules_load_error = Counter::new(
            "request_guard_rules_load_error_total",
            "Number of failed rule loads",
        )?;

        let classify_duration = Histogram::with_opts(HistogramOpts::new(
            "request_guard_classify_duration_seconds",
            "Duration of request classification in seconds",
        ))?;

        registry.register(Box::new(decisions.clone()))?;
        registry.register(Box::new(rule_matches.clone()))?;
        registry.register(Box::new(fail_open.clone()))?;
        registry.register(Box::new(store_operations.clone()))?;
        registry.register(Box::new(store_operation_duration.clone()))?;
        registry.register(Box::new(store_evictions.clone()))?;
        registry.register(Box::new(notifications_dropped.clone()))?;
        registry.register(Box::new(rules_load_success.clone()))?;
        registry.register(Box::new(rules_load_error.clone()))?;
        registry.register(Box::new(classify_duration.clone()))?;

        Ok(Self {
            registry,
            decisions,
            rule_matches,
            fail_open,
            store_operations,
            store_operation_duration,
            store_evictions,
            notifications_dropped,
            rules_load_success,
            rules_load_error,
            classify_duration,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a final decision
    pub fn record_decision(&self, outcome: &str, rule: &str) {
        self.decisions.with_label_values(&[outcome, rule]).inc();
    }

    /// Record a rule match, including non-terminal ones (custom, track)
    pub fn record_rule_match(&self, kind: &str, rule: &str) {
        self.rule_matches.with_label_values(&[kind, rule]).inc();
    }

    /// Record a check that failed open
    pub fn record_fail_open(&self, check: &str) {
        self.fail_open.with_label_values(&[check]).inc();
    }

    /// Record a store operation
    pub fn record_store_operation(&self, operation: &str, result: &str) {
        self.store_operations.with_label_values(&[operation, result]).inc();
    }

    /// Record store operation duration
    pub fn record_store_operation_duration(&self, operation: &str, duration_seconds: f64) {
        self.store_operation_duration
            .with_label_values(&[operation])
            .observe(duration_seconds);
    }

    /// Record a live counter evicted at capacity
    pub fn record_store_eviction(&self) {
        self.store_evictions.inc();
    }

    pub fn store_evictions(&self) -> u64 {
        self.store_evictions.get()
    }

    /// Record a dropped instrumentation event
    pub fn record_notification_dropped(&self) {
        self.notifications_dropped.inc();
    }

    /// Number of dropped instrumentation events so far
    pub fn notifications_dropped(&self) -> u64 {
        self.notifications_dropped.get()
    }

    /// Record successful rule load
    pub fn record_rules_load_success(&self) {
        self.rules_load_success.inc();
    }

    /// Record failed rule load
    pub fn record_rules_load_error(&self) {
        self.rules_load_error.inc();
    }

    /// Create a timer for measuring classification duration
    pub fn start_classify_timer(&self) -> prometheus::HistogramTimer {
        self.classify_duration.start_timer()
    }
}
