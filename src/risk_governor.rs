//! Risk Governor (§4.9): sliding success/error-rate window over order
//! outcomes, combined with broker health, producing throttle and
//! auto-hold decisions for the pre-trade gate and supervisor.

use crate::config::{BrokerState, RiskGovernorConfig};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

const MAX_BUFFERED_EVENTS: usize = 16_384;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Ok,
    Error,
}

#[derive(Debug, Clone)]
pub struct RiskDecision {
    pub throttled: bool,
    pub reason: Option<String>,
    pub success_rate: f64,
    pub error_rate: f64,
    pub orders_total: u64,
    pub orders_ok: u64,
    pub orders_error: u64,
    pub window_started_at: Instant,
    pub auto_hold_reason: Option<String>,
    pub broker_state: BrokerState,
    pub broker_reason: Option<String>,
}

#[derive(Clone, Copy)]
struct WindowEntry {
    start_bucket: i64,
    throttled: bool,
}

struct Inner {
    events: VecDeque<(Instant, Outcome, String)>,
    error_breakdown: HashMap<String, u32>,
    current_window_bucket: Option<i64>,
    current_window_throttled: bool,
    window_history: VecDeque<WindowEntry>,
    last_auto_hold_window: Option<i64>,
    start: Instant,
}

/// Tracks rolling order outcomes and consults broker health (§4.8) to
/// decide whether new orders should be throttled. `window_sec`-bucketed
/// history drives the "N consecutive throttled windows" auto-hold rule.
pub struct RiskGovernor {
    config: RiskGovernorConfig,
    inner: Mutex<Inner>,
}

impl RiskGovernor {
    pub fn new(config: RiskGovernorConfig) -> Self {
        let history_cap = (config.hold_after_windows as usize + 1).max(4);
        Self {
            config,
            inner: Mutex::new(Inner {
                events: VecDeque::new(),
                error_breakdown: HashMap::new(),
                current_window_bucket: None,
                current_window_throttled: false,
                window_history: VecDeque::with_capacity(history_cap),
                last_auto_hold_window: None,
                start: Instant::now(),
            }),
        }
    }

    pub fn record_order_success(&self, category: &str) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.events.push_back((now, Outcome::Ok, category.to_string()));
        self.prune(&mut inner, now);
        if inner.events.len() > MAX_BUFFERED_EVENTS {
            inner.events.pop_front();
        }
    }

    pub fn record_order_error(&self, category: &str) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.events.push_back((now, Outcome::Error, category.to_string()));
        *inner.error_breakdown.entry(category.to_string()).or_insert(0) += 1;
        self.prune(&mut inner, now);
        if inner.events.len() > MAX_BUFFERED_EVENTS {
            inner.events.pop_front();
        }
    }

    fn prune(&self, inner: &mut Inner, now: Instant) {
        let window = Duration::from_secs_f64(self.config.window_sec as f64);
        while let Some((ts, kind, category)) = inner.events.front() {
            if now.duration_since(*ts) < window {
                break;
            }
            let kind = *kind;
            let category = category.clone();
            inner.events.pop_front();
            if kind == Outcome::Error {
                if let Some(count) = inner.error_breakdown.get_mut(&category) {
                    if *count <= 1 {
                        inner.error_breakdown.remove(&category);
                    } else {
                        *count -= 1;
                    }
                }
            }
        }
    }

    fn counts(inner: &Inner) -> (u64, u64, u64) {
        let total = inner.events.len() as u64;
        let errors = inner.events.iter().filter(|(_, kind, _)| *kind == Outcome::Error).count() as u64;
        (total, total - errors, errors)
    }

    pub fn compute(&self, broker_state: BrokerState, broker_reason: Option<String>) -> RiskDecision {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.prune(&mut inner, now);
        let (total, ok, error) = Self::counts(&inner);
        let success_rate = if total > 0 { ok as f64 / total as f64 } else { 1.0 };
        let error_rate = if total > 0 { error as f64 / total as f64 } else { 0.0 };

        let reason = self.decide_reason(success_rate, error_rate, broker_state, broker_reason.as_deref());
        let throttled = reason.is_some();
        let window_started_at = inner.start;
        let auto_hold_reason = self.update_windows(&mut inner, now, throttled, reason.as_deref());

        RiskDecision {
            throttled,
            reason,
            success_rate,
            error_rate,
            orders_total: total,
            orders_ok: ok,
            orders_error: error,
            window_started_at,
            auto_hold_reason,
            broker_state,
            broker_reason,
        }
    }

    fn decide_reason(
        &self,
        success_rate: f64,
        error_rate: f64,
        broker_state: BrokerState,
        broker_reason: Option<&str>,
    ) -> Option<String> {
        if success_rate < self.config.min_success_rate {
            return Some("LOW_SUCCESS_RATE".to_string());
        }
        if error_rate > self.config.max_order_error_rate {
            return Some("HIGH_ORDER_ERRORS".to_string());
        }
        if broker_state < self.config.min_broker_state {
            return Some(match broker_reason {
                Some(r) => format!("BROKER_DEGRADED:{r}"),
                None => "BROKER_DEGRADED".to_string(),
            });
        }
        None
    }

    fn window_bucket(&self, now: Instant, inner_start: Instant) -> i64 {
        let elapsed = now.duration_since(inner_start).as_secs_f64();
        (elapsed / self.config.window_sec as f64).floor() as i64
    }

    fn update_windows(&self, inner: &mut Inner, now: Instant, throttled: bool, reason: Option<&str>) -> Option<String> {
        let bucket = self.window_bucket(now, inner.start);

        match inner.current_window_bucket {
            None => {
                inner.current_window_bucket = Some(bucket);
                inner.current_window_throttled = throttled;
            }
            Some(current) if current != bucket => {
                inner.window_history.push_back(WindowEntry {
                    start_bucket: current,
                    throttled: inner.current_window_throttled,
                });
                if inner.window_history.len() > (self.config.hold_after_windows as usize + 1).max(4) {
                    inner.window_history.pop_front();
                }
                inner.current_window_bucket = Some(bucket);
                inner.current_window_throttled = throttled;
            }
            Some(_) => {
                inner.current_window_throttled = inner.current_window_throttled || throttled;
            }
        }

        let mut history: Vec<WindowEntry> = inner.window_history.iter().copied().collect();
        history.push(WindowEntry {
            start_bucket: inner.current_window_bucket.unwrap_or(bucket),
            throttled: inner.current_window_throttled,
        });

        let hold_after = self.config.hold_after_windows as usize;
        if hold_after > 0 && history.len() >= hold_after {
            let tail = &history[history.len() - hold_after..];
            if tail.iter().all(|e| e.throttled) {
                let latest = tail.last().unwrap().start_bucket;
                if inner.last_auto_hold_window != Some(latest) {
                    inner.last_auto_hold_window = Some(latest);
                    return Some(format!("RISK::{}", reason.unwrap_or("UNKNOWN")));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RiskGovernorConfig {
        RiskGovernorConfig {
            window_sec: 60,
            min_success_rate: 0.9,
            max_order_error_rate: 0.1,
            min_broker_state: BrokerState::Up,
            hold_after_windows: 1,
        }
    }

    #[test]
    fn test_low_success_rate_throttles() {
        let governor = RiskGovernor::new(config());
        for _ in 0..5 {
            governor.record_order_error("reject");
        }
        let decision = governor.compute(BrokerState::Up, None);
        assert!(decision.throttled);
        assert_eq!(decision.reason.as_deref(), Some("LOW_SUCCESS_RATE"));
    }

    #[test]
    fn test_healthy_flow_is_not_throttled() {
        let governor = RiskGovernor::new(config());
        for _ in 0..10 {
            governor.record_order_success("ok");
        }
        let decision = governor.compute(BrokerState::Up, None);
        assert!(!decision.throttled);
    }

    #[test]
    fn test_broker_degraded_blocks_when_min_state_is_up() {
        let governor = RiskGovernor::new(config());
        governor.record_order_success("ok");
        let decision = governor.compute(BrokerState::Degraded, Some("ws_lag_ms_p95_elevated".to_string()));
        assert!(decision.throttled);
        assert_eq!(decision.reason.as_deref(), Some("BROKER_DEGRADED:ws_lag_ms_p95_elevated"));
    }
}
