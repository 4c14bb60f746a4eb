//! Stuck-order Resolver (§4.12): background poll loop that cancels and
//! retries orders sitting open past `pending_timeout`, escalating to a
//! one-shot incident once `max_retries` is exhausted.

use crate::config::StuckResolverConfig;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;

pub const STUCK_TIMEOUT_REASON: &str = "STUCK_TIMEOUT";
pub const STUCK_MAX_RETRIES_REASON: &str = "STUCK_MAX_RETRIES";

/// Narrow view the poll loop needs of each currently-open intent; the
/// router supplies these from the ledger each cycle.
#[derive(Debug, Clone)]
pub struct OpenIntentView {
    pub intent_id: String,
    pub client_ts: DateTime<Utc>,
    pub filled_qty: Decimal,
    pub is_terminal: bool,
}

/// Cancel/resubmit actions the resolver drives through the order router;
/// kept as a trait so the resolver can be unit-tested without a broker.
#[async_trait]
pub trait OrderActions: Send + Sync {
    async fn cancel(&self, intent_id: &str, reason: &str) -> Result<()>;
    async fn resubmit(&self, intent_id: &str) -> Result<String>;
}

#[derive(Debug, Clone)]
pub enum Incident {
    MaxRetriesReached { intent_id: String },
    CancelFailed { intent_id: String, error: String },
}

struct TrackedState {
    retry_count: u32,
    backoff_until: Option<DateTime<Utc>>,
    maxed_out: bool,
    last_filled_qty: Decimal,
}

impl TrackedState {
    fn fresh() -> Self {
        Self {
            retry_count: 0,
            backoff_until: None,
            maxed_out: false,
            last_filled_qty: Decimal::ZERO,
        }
    }
}

pub struct StuckOrderResolver {
    config: StuckResolverConfig,
    state: Mutex<HashMap<String, TrackedState>>,
}

impl StuckOrderResolver {
    pub fn new(config: StuckResolverConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HashMap::new()),
        }
    }

    fn backoff_for(&self, retry_count: u32) -> f64 {
        let table = &self.config.backoff_sec;
        if table.is_empty() {
            return 1.0;
        }
        table[(retry_count as usize) % table.len()]
    }

    /// Runs one poll cycle over `open`, returning any incidents raised.
    /// Garbage-collects tracked state for intents no longer in `open`.
    pub async fn poll_once(&self, open: &[OpenIntentView], actions: &dyn OrderActions) -> Vec<Incident> {
        let mut incidents = Vec::new();
        let now = Utc::now();
        let pending_timeout = ChronoDuration::milliseconds((self.config.pending_timeout_sec * 1000.0) as i64);

        for view in open {
            if view.is_terminal {
                continue;
            }
            let age = now - view.client_ts;
            if age <= pending_timeout {
                continue;
            }

            let (retry_count, backoff_until, maxed_out, is_new_fill) = {
                let mut state = self.state.lock();
                let entry = state.entry(view.intent_id.clone()).or_insert_with(TrackedState::fresh);
                let is_new_fill = view.filled_qty > entry.last_filled_qty;
                if is_new_fill {
                    entry.retry_count = 0;
                    entry.backoff_until = None;
                    entry.last_filled_qty = view.filled_qty;
                }
                (entry.retry_count, entry.backoff_until, entry.maxed_out, is_new_fill)
            };

            if is_new_fill {
                continue;
            }
            if maxed_out {
                continue;
            }

            if retry_count >= self.config.max_retries {
                let mut state = self.state.lock();
                if let Some(entry) = state.get_mut(&view.intent_id) {
                    if !entry.maxed_out {
                        entry.maxed_out = true;
                        incidents.push(Incident::MaxRetriesReached { intent_id: view.intent_id.clone() });
                    }
                }
                continue;
            }

            if let Some(until) = backoff_until {
                if now < until {
                    continue;
                }
            }

            if let Err(err) = actions.cancel(&view.intent_id, STUCK_TIMEOUT_REASON).await {
                incidents.push(Incident::CancelFailed { intent_id: view.intent_id.clone(), error: err.to_string() });
                continue;
            }

            tokio::time::sleep(std::time::Duration::from_secs_f64(self.config.cancel_grace_sec)).await;

            if actions.resubmit(&view.intent_id).await.is_ok() {
                let mut state = self.state.lock();
                if let Some(entry) = state.get_mut(&view.intent_id) {
                    entry.retry_count += 1;
                    let delay = self.backoff_for(entry.retry_count);
                    entry.backoff_until = Some(now + ChronoDuration::milliseconds((delay * 1000.0) as i64));
                }
            }
        }

        let open_ids: std::collections::HashSet<&str> = open.iter().map(|v| v.intent_id.as_str()).collect();
        self.state.lock().retain(|id, _| open_ids.contains(id.as_str()));

        incidents
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct MockActions {
        cancel_calls: AtomicU32,
        resubmit_calls: AtomicU32,
        cancel_should_fail: bool,
    }

    #[async_trait]
    impl OrderActions for MockActions {
        async fn cancel(&self, _intent_id: &str, _reason: &str) -> Result<()> {
            self.cancel_calls.fetch_add(1, Ordering::SeqCst);
            if self.cancel_should_fail {
                anyhow::bail!("network error");
            }
            Ok(())
        }

        async fn resubmit(&self, _intent_id: &str) -> Result<String> {
            self.resubmit_calls.fetch_add(1, Ordering::SeqCst);
            Ok("new-intent".to_string())
        }
    }

    fn config() -> StuckResolverConfig {
        StuckResolverConfig {
            enabled: true,
            pending_timeout_sec: 8.0,
            cancel_grace_sec: 0.0,
            max_retries: 2,
            backoff_sec: vec![1.0, 2.0, 5.0],
            poll_interval_sec: 0.5,
        }
    }

    #[tokio::test]
    async fn test_fresh_order_within_timeout_is_skipped() {
        let resolver = StuckOrderResolver::new(config());
        let actions = Arc::new(MockActions { cancel_calls: AtomicU32::new(0), resubmit_calls: AtomicU32::new(0), cancel_should_fail: false });
        let open = vec![OpenIntentView { intent_id: "a".into(), client_ts: Utc::now(), filled_qty: Decimal::ZERO, is_terminal: false }];
        resolver.poll_once(&open, actions.as_ref()).await;
        assert_eq!(actions.cancel_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_timed_out_order_is_cancelled_and_resubmitted() {
        let resolver = StuckOrderResolver::new(config());
        let actions = Arc::new(MockActions { cancel_calls: AtomicU32::new(0), resubmit_calls: AtomicU32::new(0), cancel_should_fail: false });
        let stale_ts = Utc::now() - ChronoDuration::seconds(20);
        let open = vec![OpenIntentView { intent_id: "a".into(), client_ts: stale_ts, filled_qty: Decimal::ZERO, is_terminal: false }];
        resolver.poll_once(&open, actions.as_ref()).await;
        assert_eq!(actions.cancel_calls.load(Ordering::SeqCst), 1);
        assert_eq!(actions.resubmit_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_failure_does_not_bump_retry_counter() {
        let resolver = StuckOrderResolver::new(config());
        let actions = Arc::new(MockActions { cancel_calls: AtomicU32::new(0), resubmit_calls: AtomicU32::new(0), cancel_should_fail: true });
        let stale_ts = Utc::now() - ChronoDuration::seconds(20);
        let open = vec![OpenIntentView { intent_id: "a".into(), client_ts: stale_ts, filled_qty: Decimal::ZERO, is_terminal: false }];
        let incidents = resolver.poll_once(&open, actions.as_ref()).await;
        assert!(matches!(incidents.as_slice(), [Incident::CancelFailed { .. }]));
        assert_eq!(actions.resubmit_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_max_retries_raises_incident_once() {
        let mut cfg = config();
        cfg.max_retries = 0;
        let resolver = StuckOrderResolver::new(cfg);
        let actions = Arc::new(MockActions { cancel_calls: AtomicU32::new(0), resubmit_calls: AtomicU32::new(0), cancel_should_fail: false });
        let stale_ts = Utc::now() - ChronoDuration::seconds(20);
        let open = vec![OpenIntentView { intent_id: "a".into(), client_ts: stale_ts, filled_qty: Decimal::ZERO, is_terminal: false }];

        let incidents_first = resolver.poll_once(&open, actions.as_ref()).await;
        assert!(matches!(incidents_first.as_slice(), [Incident::MaxRetriesReached { .. }]));

        let incidents_second = resolver.poll_once(&open, actions.as_ref()).await;
        assert!(incidents_second.is_empty());
        assert_eq!(actions.cancel_calls.load(Ordering::SeqCst), 0);
    }
}
