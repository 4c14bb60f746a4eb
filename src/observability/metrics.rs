//! Prometheus metrics for the execution core.
//!
//! Push-based only: metrics are registered and readable via [`Metrics::render`]
//! or [`Metrics::snapshot`], there is no embedded HTTP exporter. A caller that
//! wants scraping wires `render()` behind its own listener.

use prometheus::{
    CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use serde::Serialize;

/// Stable-contract metrics for the safety and execution core.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub order_submit_latency_ms: HistogramVec,
    pub idempotency_hit_total: CounterVec,
    pub open_intents: GaugeVec,
    pub ws_connect_total: CounterVec,
    pub ws_disconnect_total: CounterVec,
    pub ws_gap_detected_total: CounterVec,
    pub ws_resync_total: CounterVec,
    pub watchdog_state: GaugeVec,
    pub risk_success_rate: GaugeVec,
    pub risk_error_rate: GaugeVec,
    pub recon_divergence_total: CounterVec,
    pub stuck_resolver_retries_total: CounterVec,
    pub stuck_resolver_failures_total: CounterVec,
    pub replace_chain_depth: GaugeVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let order_submit_latency_ms = HistogramVec::new(
            HistogramOpts::new(
                "order_submit_latency_ms",
                "Time from submit() call to broker ack, in milliseconds",
            )
            .buckets(vec![5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0]),
            &["venue"],
        )?;
        registry.register(Box::new(order_submit_latency_ms.clone()))?;

        let idempotency_hit_total = CounterVec::new(
            Opts::new(
                "idempotency_hit_total",
                "Requests short-circuited by an existing ledger entry",
            ),
            &["operation"],
        )?;
        registry.register(Box::new(idempotency_hit_total.clone()))?;

        let open_intents = GaugeVec::new(
            Opts::new("open_intents", "Currently non-terminal order intents"),
            &["venue"],
        )?;
        registry.register(Box::new(open_intents.clone()))?;

        let ws_connect_total = CounterVec::new(
            Opts::new("ws_connect_total", "Successful venue WebSocket connections"),
            &["venue"],
        )?;
        registry.register(Box::new(ws_connect_total.clone()))?;

        let ws_disconnect_total = CounterVec::new(
            Opts::new("ws_disconnect_total", "Venue WebSocket disconnects"),
            &["venue", "reason"],
        )?;
        registry.register(Box::new(ws_disconnect_total.clone()))?;

        let ws_gap_detected_total = CounterVec::new(
            Opts::new("ws_gap_detected_total", "Order-book sequence gaps detected"),
            &["venue", "symbol"],
        )?;
        registry.register(Box::new(ws_gap_detected_total.clone()))?;

        let ws_resync_total = CounterVec::new(
            Opts::new("ws_resync_total", "Order-book resyncs triggered by a gap"),
            &["venue", "symbol"],
        )?;
        registry.register(Box::new(ws_resync_total.clone()))?;

        let watchdog_state = GaugeVec::new(
            Opts::new("watchdog_state", "Broker watchdog state: 0=OK, 1=DEGRADED, 2=DOWN"),
            &["venue"],
        )?;
        registry.register(Box::new(watchdog_state.clone()))?;

        let risk_success_rate = GaugeVec::new(
            Opts::new("risk_success_rate", "Risk governor rolling success rate"),
            &["venue"],
        )?;
        registry.register(Box::new(risk_success_rate.clone()))?;

        let risk_error_rate = GaugeVec::new(
            Opts::new("risk_error_rate", "Risk governor rolling error rate"),
            &["venue"],
        )?;
        registry.register(Box::new(risk_error_rate.clone()))?;

        let recon_divergence_total = CounterVec::new(
            Opts::new("recon_divergence_total", "Reconciliation divergences found"),
            &["venue", "symbol", "severity"],
        )?;
        registry.register(Box::new(recon_divergence_total.clone()))?;

        let stuck_resolver_retries_total = CounterVec::new(
            Opts::new("stuck_resolver_retries_total", "Stuck-order cancel/resubmit retries"),
            &["venue", "symbol"],
        )?;
        registry.register(Box::new(stuck_resolver_retries_total.clone()))?;

        let stuck_resolver_failures_total = CounterVec::new(
            Opts::new("stuck_resolver_failures_total", "Stuck-order resolver terminal failures"),
            &["venue", "symbol", "reason"],
        )?;
        registry.register(Box::new(stuck_resolver_failures_total.clone()))?;

        let replace_chain_depth = GaugeVec::new(
            Opts::new("replace_chain_depth", "Depth of the replace forward-chain for the most recently replaced intent"),
            &["venue"],
        )?;
        registry.register(Box::new(replace_chain_depth.clone()))?;

        Ok(Self {
            registry,
            order_submit_latency_ms,
            idempotency_hit_total,
            open_intents,
            ws_connect_total,
            ws_disconnect_total,
            ws_gap_detected_total,
            ws_resync_total,
            watchdog_state,
            risk_success_rate,
            risk_error_rate,
            recon_divergence_total,
            stuck_resolver_retries_total,
            stuck_resolver_failures_total,
            replace_chain_depth,
        })
    }

    /// Renders all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder.encode_to_string(&families).unwrap_or_default()
    }

    pub fn observe_submit_latency(&self, venue: &str, millis: f64) {
        self.order_submit_latency_ms.with_label_values(&[venue]).observe(millis);
    }

    pub fn inc_idempotency_hit(&self, operation: &str) {
        self.idempotency_hit_total.with_label_values(&[operation]).inc();
    }

    pub fn set_open_intents(&self, venue: &str, count: f64) {
        self.open_intents.with_label_values(&[venue]).set(count);
    }

    pub fn inc_ws_connect(&self, venue: &str) {
        self.ws_connect_total.with_label_values(&[venue]).inc();
    }

    pub fn inc_ws_disconnect(&self, venue: &str, reason: &str) {
        self.ws_disconnect_total.with_label_values(&[venue, reason]).inc();
    }

    pub fn inc_ws_gap(&self, venue: &str, symbol: &str) {
        self.ws_gap_detected_total.with_label_values(&[venue, symbol]).inc();
    }

    pub fn inc_ws_resync(&self, venue: &str, symbol: &str) {
        self.ws_resync_total.with_label_values(&[venue, symbol]).inc();
    }

    /// `state` is 0=OK, 1=DEGRADED, 2=DOWN, matching `BrokerState`'s declaration order.
    pub fn set_watchdog_state(&self, venue: &str, state: f64) {
        self.watchdog_state.with_label_values(&[venue]).set(state);
    }

    pub fn set_risk_rates(&self, venue: &str, success_rate: f64, error_rate: f64) {
        self.risk_success_rate.with_label_values(&[venue]).set(success_rate);
        self.risk_error_rate.with_label_values(&[venue]).set(error_rate);
    }

    pub fn inc_recon_divergence(&self, venue: &str, symbol: &str, severity: &str) {
        self.recon_divergence_total.with_label_values(&[venue, symbol, severity]).inc();
    }

    pub fn inc_stuck_retry(&self, venue: &str, symbol: &str) {
        self.stuck_resolver_retries_total.with_label_values(&[venue, symbol]).inc();
    }

    pub fn inc_stuck_failure(&self, venue: &str, symbol: &str, reason: &str) {
        self.stuck_resolver_failures_total.with_label_values(&[venue, symbol, reason]).inc();
    }

    pub fn set_replace_chain_depth(&self, venue: &str, depth: f64) {
        self.replace_chain_depth.with_label_values(&[venue]).set(depth);
    }

    /// A JSON-serialisable snapshot for structured logging, mirroring this
    /// codebase's existing stance of shipping metrics as log lines rather
    /// than standing up an embedded scrape endpoint.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: chrono::Utc::now().to_rfc3339(),
            text: self.render(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("failed to construct Metrics registry")
    }
}

#[derive(Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation_renders_empty_series() {
        let metrics = Metrics::new().expect("construct");
        metrics.inc_ws_connect("binance");
        let output = metrics.render();
        assert!(output.contains("ws_connect_total"));
        assert!(output.contains("binance"));
    }

    #[test]
    fn test_watchdog_state_gauge() {
        let metrics = Metrics::new().expect("construct");
        metrics.set_watchdog_state("okx", 1.0);
        let output = metrics.render();
        assert!(output.contains("watchdog_state"));
    }

    #[test]
    fn test_snapshot_has_timestamp_and_text() {
        let metrics = Metrics::new().expect("construct");
        let snap = metrics.snapshot();
        assert!(!snap.timestamp.is_empty());
        assert!(snap.text.is_empty() || snap.text.contains('\n') || snap.text.is_empty());
    }
}
