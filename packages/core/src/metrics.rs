//! Prometheus metrics registry for the notification scheduler.
//!
//! [`AppMetrics`] owns all registered metrics and the [`Registry`] they
//! belong to. Construct it once at startup, wrap in `Arc`, and pass it
//! to the dispatcher, the delivery queue and the HTTP middleware.
//!
//! Exposed at `GET /metrics` in Prometheus text exposition format
//! (`text/plain; version=0.0.4`).

use prometheus::{Counter, CounterVec, Histogram, HistogramOpts, Opts, Registry};

/// All application-level Prometheus metrics.
pub struct AppMetrics {
    /// Total number of dispatcher sweeps started.
    pub sweeps_total: Counter,
    /// Sweeps aborted because the due-query failed.
    pub sweep_errors_total: Counter,
    /// Notifications marked sent and handed to the publisher.
    pub notifications_dispatched_total: Counter,
    /// Due notifications that another actor sent or deleted first.
    pub dispatch_races_total: Counter,
    /// Per-notification store failures inside a sweep.
    pub dispatch_failures_total: Counter,
    /// Queue handoffs that failed after the notification was marked sent.
    pub publish_errors_total: Counter,
    /// Delivery attempts by subscription and outcome.
    pub deliveries_total: CounterVec,
    /// Queued messages dropped because their subscription was retired.
    pub orphaned_messages_total: Counter,
    /// HTTP request count, labelled by method, path, and status code.
    pub http_requests_total: CounterVec,
    /// HTTP request latency histogram in seconds.
    pub http_request_duration: Histogram,
    /// The registry that owns all of the above metrics.
    pub registry: Registry,
}

impl AppMetrics {
    /// Create and register all metrics. Returns an error if any metric
    /// name is invalid or duplicated.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let sweeps_total = Counter::with_opts(Opts::new(
            "notifier_sweeps_total",
            "Dispatcher sweeps started",
        ))?;

        let sweep_errors_total = Counter::with_opts(Opts::new(
            "notifier_sweep_errors_total",
            "Dispatcher sweeps aborted by a storage error",
        ))?;

        let notifications_dispatched_total = Counter::with_opts(Opts::new(
            "notifier_notifications_dispatched_total",
            "Notifications marked sent by the dispatcher",
        ))?;

        let dispatch_races_total = Counter::with_opts(Opts::new(
            "notifier_dispatch_races_total",
            "Due notifications already sent or deleted by another actor",
        ))?;

        let dispatch_failures_total = Counter::with_opts(Opts::new(
            "notifier_dispatch_failures_total",
            "Per-notification storage failures during a sweep",
        ))?;

        let publish_errors_total = Counter::with_opts(Opts::new(
            "notifier_publish_errors_total",
            "Failed delivery queue handoffs",
        ))?;

        let deliveries_total = CounterVec::new(
            Opts::new(
                "notifier_deliveries_total",
                "Delivery attempts by subscription and outcome",
            ),
            &["subscription", "outcome"],
        )?;

        let orphaned_messages_total = Counter::with_opts(Opts::new(
            "notifier_queue_orphaned_messages_total",
            "Queued messages dropped for subscriptions no longer registered",
        ))?;

        let http_requests_total = CounterVec::new(
            Opts::new(
                "notifier_http_requests_total",
                "HTTP requests by method, path, and status",
            ),
            &["method", "path", "status"],
        )?;

        let http_request_duration = Histogram::with_opts(
            HistogramOpts::new(
                "notifier_http_request_duration_seconds",
                "HTTP request latency in seconds",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        )?;

        registry.register(Box::new(sweeps_total.clone()))?;
        registry.register(Box::new(sweep_errors_total.clone()))?;
        registry.register(Box::new(notifications_dispatched_total.clone()))?;
        registry.register(Box::new(dispatch_races_total.clone()))?;
        registry.register(Box::new(dispatch_failures_total.clone()))?;
        registry.register(Box::new(publish_errors_total.clone()))?;
        registry.register(Box::new(deliveries_total.clone()))?;
        registry.register(Box::new(orphaned_messages_total.clone()))?;
        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration.clone()))?;

        Ok(Self {
            sweeps_total,
            sweep_errors_total,
            notifications_dispatched_total,
            dispatch_races_total,
            dispatch_failures_total,
            publish_errors_total,
            deliveries_total,
            orphaned_messages_total,
            http_requests_total,
            http_request_duration,
            registry,
        })
    }

    /// Render all metrics as Prometheus text format (for the `/metrics` endpoint).
    pub fn render(&self) -> Result<String, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&metric_families, &mut buf)?;
        Ok(String::from_utf8(buf).unwrap_or_default())
    }
}
