//! Typed incident/event record (§6, §11) emitted by every internal guard —
//! Watchdog auto-hold, Reconciler critical divergence, Resolver max-retries,
//! Account health — and handed to an injected sink set. The sink
//! implementation (Telegram, PagerDuty, ...) is an external collaborator and
//! out of scope here; only the typed event and the swallow-on-failure policy
//! are ambient plumbing owned by this crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Info,
    Warn,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: String,
    pub severity: EventSeverity,
    pub title: String,
    pub detail: String,
    pub tags: BTreeMap<String, String>,
    pub ctx: serde_json::Value,
    pub ts: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: impl Into<String>, severity: EventSeverity, title: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            severity,
            title: title.into(),
            detail: String::new(),
            tags: BTreeMap::new(),
            ctx: serde_json::Value::Null,
            ts: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_ctx(mut self, ctx: serde_json::Value) -> Self {
        self.ctx = ctx;
        self
    }
}

/// A destination for [`Event`]s. Implementations (Telegram, PagerDuty, a log
/// file) live outside this crate; a guard only ever sees this trait.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, event: &Event) -> anyhow::Result<()>;
}

/// Fans an event out to every registered sink. A sink failure is logged and
/// swallowed — per policy, alerting must never block trading.
#[derive(Default)]
pub struct EventBus {
    sinks: Vec<Box<dyn EventSink>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn register(&mut self, sink: Box<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub async fn publish(&self, event: Event) {
        for sink in &self.sinks {
            if let Err(err) = sink.send(&event).await {
                warn!(kind = %event.kind, error = %err, "event sink failed, swallowing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct FailingSink;

    #[async_trait]
    impl EventSink for FailingSink {
        async fn send(&self, _event: &Event) -> anyhow::Result<()> {
            anyhow::bail!("unreachable endpoint")
        }
    }

    struct CountingSink {
        count: Arc<AtomicU32>,
    }

    #[async_trait]
    impl EventSink for CountingSink {
        async fn send(&self, _event: &Event) -> anyhow::Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_publish_swallows_sink_failures_and_reaches_other_sinks() {
        let count = Arc::new(AtomicU32::new(0));
        let mut bus = EventBus::new();
        bus.register(Box::new(FailingSink));
        bus.register(Box::new(CountingSink { count: count.clone() }));

        let event = Event::new("RECON_DIVERGENCE", EventSeverity::Critical, "position mismatch")
            .with_detail("BTC-USDT delta 0.5")
            .with_tag("venue", "binance");
        bus.publish(event).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_event_serializes_severity_lowercase() {
        let event = Event::new("STUCK_MAX_RETRIES", EventSeverity::Warn, "order stuck");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"severity\":\"warn\""));
    }
}
