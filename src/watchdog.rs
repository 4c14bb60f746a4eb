//! Broker Watchdog (§4.8): per-venue sliding-window health classification
//! feeding the pre-trade gate and the safety supervisor. Adapted from the
//! worst-of-severity scan pattern used elsewhere in this codebase for
//! circuit breaking, generalised to multiple independently-windowed metrics.

use crate::config::{BrokerState, WatchdogConfig};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{info, warn};

const LAG_WINDOW_S: f64 = 120.0;
const RATE_WINDOW_S: f64 = 60.0;
const REST_WINDOW_S: f64 = 300.0;
const ORDER_WINDOW_S: f64 = 300.0;
const HISTORY_WINDOW_MULTIPLIER: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestErrorKind {
    Timeout,
    Http5xx,
    Other,
}

#[derive(Debug, Clone)]
pub struct WatchdogEvent {
    pub venue: String,
    pub state: BrokerState,
    pub reason: String,
    pub auto_hold: bool,
}

#[derive(Debug, Clone)]
pub struct VenueSnapshot {
    pub venue: String,
    pub state: BrokerState,
    pub last_reason: String,
    pub burn_rate: f64,
    pub ws_lag_ms_p95: f64,
    pub ws_disconnects_per_min: f64,
    pub rest_5xx_rate: f64,
    pub rest_timeouts_rate: f64,
    pub order_reject_rate: f64,
    pub reject_codes: HashMap<String, u32>,
}

struct VenueState {
    ws_lag_samples: VecDeque<(Instant, f64)>,
    ws_disconnects: VecDeque<Instant>,
    rest_total: VecDeque<Instant>,
    rest_5xx: VecDeque<Instant>,
    rest_timeouts: VecDeque<Instant>,
    order_total: VecDeque<Instant>,
    order_rejects: VecDeque<(Instant, String)>,
    reject_codes: HashMap<String, u32>,
    state: BrokerState,
    last_reason: String,
    burn_rate: f64,
    history: VecDeque<(Instant, BrokerState)>,
    throttled: bool,
}

impl VenueState {
    fn new() -> Self {
        Self {
            ws_lag_samples: VecDeque::new(),
            ws_disconnects: VecDeque::new(),
            rest_total: VecDeque::new(),
            rest_5xx: VecDeque::new(),
            rest_timeouts: VecDeque::new(),
            order_total: VecDeque::new(),
            order_rejects: VecDeque::new(),
            reject_codes: HashMap::new(),
            state: BrokerState::Up,
            last_reason: String::new(),
            burn_rate: 0.0,
            history: VecDeque::new(),
            throttled: false,
        }
    }
}

/// Process-wide, per-venue health classifier. Holds no references to the
/// router or supervisor directly — callers subscribe to `events()` and
/// react, keeping the watchdog itself free of upward dependencies.
pub struct BrokerWatchdog {
    config: WatchdogConfig,
    venues: Mutex<HashMap<String, VenueState>>,
    events: broadcast::Sender<WatchdogEvent>,
    any_throttled: Mutex<bool>,
}

impl BrokerWatchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            venues: Mutex::new(HashMap::new()),
            events,
            any_throttled: Mutex::new(false),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<WatchdogEvent> {
        self.events.subscribe()
    }

    fn canonical(venue: &str) -> String {
        venue.to_lowercase()
    }

    pub fn record_ws_lag(&self, venue: &str, lag_ms: f64) {
        let now = Instant::now();
        let mut venues = self.venues.lock();
        let state = venues.entry(Self::canonical(venue)).or_insert_with(VenueState::new);
        state.ws_lag_samples.push_back((now, lag_ms));
        drop(venues);
        self.evaluate(venue, None);
    }

    pub fn record_ws_disconnect(&self, venue: &str) {
        let now = Instant::now();
        let mut venues = self.venues.lock();
        let state = venues.entry(Self::canonical(venue)).or_insert_with(VenueState::new);
        state.ws_disconnects.push_back(now);
        drop(venues);
        self.evaluate(venue, None);
    }

    pub fn record_rest_ok(&self, venue: &str) {
        let now = Instant::now();
        let mut venues = self.venues.lock();
        let state = venues.entry(Self::canonical(venue)).or_insert_with(VenueState::new);
        state.rest_total.push_back(now);
        drop(venues);
        self.evaluate(venue, None);
    }

    pub fn record_rest_error(&self, venue: &str, kind: RestErrorKind) {
        let now = Instant::now();
        let mut venues = self.venues.lock();
        let state = venues.entry(Self::canonical(venue)).or_insert_with(VenueState::new);
        state.rest_total.push_back(now);
        match kind {
            RestErrorKind::Http5xx => state.rest_5xx.push_back(now),
            RestErrorKind::Timeout => state.rest_timeouts.push_back(now),
            RestErrorKind::Other => {}
        }
        drop(venues);
        self.evaluate(venue, None);
    }

    pub fn record_order_submit(&self, venue: &str) {
        let now = Instant::now();
        let mut venues = self.venues.lock();
        let state = venues.entry(Self::canonical(venue)).or_insert_with(VenueState::new);
        state.order_total.push_back(now);
        drop(venues);
        self.evaluate(venue, None);
    }

    pub fn record_order_reject(&self, venue: &str, code: Option<&str>) {
        let now = Instant::now();
        let code = code.unwrap_or("unknown").to_string();
        let mut venues = self.venues.lock();
        let state = venues.entry(Self::canonical(venue)).or_insert_with(VenueState::new);
        state.order_rejects.push_back((now, code.clone()));
        *state.reject_codes.entry(code).or_insert(0) += 1;
        drop(venues);
        self.evaluate(venue, None);
    }

    pub fn state_for(&self, venue: &str) -> BrokerState {
        self.venues
            .lock()
            .get(&Self::canonical(venue))
            .map(|s| s.state)
            .unwrap_or(BrokerState::Up)
    }

    pub fn throttled(&self) -> bool {
        *self.any_throttled.lock()
    }

    pub fn should_block_orders(&self, venue: &str) -> bool {
        self.config.block_on_down && self.state_for(venue) == BrokerState::Down
    }

    pub fn snapshot(&self) -> Vec<VenueSnapshot> {
        let mut venues = self.venues.lock();
        let names: Vec<String> = venues.keys().cloned().collect();
        drop(venues);
        let mut out = Vec::new();
        for name in names {
            let mut venues = self.venues.lock();
            let state = venues.get_mut(&name).unwrap();
            let now = Instant::now();
            let metrics = Self::collect_metrics(state, now);
            out.push(VenueSnapshot {
                venue: name.clone(),
                state: state.state,
                last_reason: state.last_reason.clone(),
                burn_rate: state.burn_rate,
                ws_lag_ms_p95: metrics[0],
                ws_disconnects_per_min: metrics[1],
                rest_5xx_rate: metrics[2],
                rest_timeouts_rate: metrics[3],
                order_reject_rate: metrics[4],
                reject_codes: state.reject_codes.clone(),
            });
        }
        out.sort_by(|a, b| a.venue.cmp(&b.venue));
        out
    }

    fn evaluate(&self, venue: &str, reason_hint: Option<&str>) {
        let canonical = Self::canonical(venue);
        let now = Instant::now();
        let mut venues = self.venues.lock();
        let state = venues.entry(canonical.clone()).or_insert_with(VenueState::new);
        let metrics = Self::collect_metrics(state, now);

        let thresholds = [
            (&self.config.thresholds.ws_lag_ms_p95, "ws_lag_ms_p95_elevated", "ws_lag_ms_p95_spike"),
            (
                &self.config.thresholds.ws_disconnects_per_min,
                "ws_disconnects_per_min_elevated",
                "ws_disconnects_per_min_spike",
            ),
            (&self.config.thresholds.rest_5xx_rate, "rest_5xx_rate_elevated", "rest_5xx_rate_spike"),
            (
                &self.config.thresholds.rest_timeouts_rate,
                "rest_timeouts_rate_elevated",
                "rest_timeouts_rate_spike",
            ),
            (
                &self.config.thresholds.order_reject_rate,
                "order_reject_rate_elevated",
                "order_reject_rate_spike",
            ),
        ];

        let mut severity = BrokerState::Up;
        let mut reason = reason_hint.map(|s| s.to_string()).unwrap_or_default();

        for (i, (pair, degraded_reason, down_reason)) in thresholds.iter().enumerate() {
            let value = metrics[i];
            if value >= pair.down && pair.down > 0.0 {
                severity = BrokerState::Down;
                if reason.is_empty() {
                    reason = down_reason.to_string();
                }
                break;
            }
            if value >= pair.degraded && pair.degraded > 0.0 && severity != BrokerState::Down {
                severity = BrokerState::Degraded;
                if reason.is_empty() {
                    reason = degraded_reason.to_string();
                }
            }
        }

        let burn_rate = Self::compute_burn_rate(state, severity, now, self.config.error_budget_window_s as f64);
        if severity == BrokerState::Up && burn_rate > 1.0 {
            severity = BrokerState::Degraded;
            if reason.is_empty() {
                reason = "error_budget_exhausted".to_string();
            }
        }

        if reason.is_empty() {
            reason = state.last_reason.clone();
        }

        self.apply_state(venue, state, severity, burn_rate, reason);
    }

    fn collect_metrics(state: &mut VenueState, now: Instant) -> [f64; 5] {
        Self::prune(&mut state.ws_lag_samples, now, LAG_WINDOW_S, |(ts, _)| *ts);
        Self::prune(&mut state.ws_disconnects, now, RATE_WINDOW_S, |ts| *ts);
        Self::prune(&mut state.rest_total, now, REST_WINDOW_S, |ts| *ts);
        Self::prune(&mut state.rest_5xx, now, REST_WINDOW_S, |ts| *ts);
        Self::prune(&mut state.rest_timeouts, now, REST_WINDOW_S, |ts| *ts);
        Self::prune(&mut state.order_total, now, ORDER_WINDOW_S, |ts| *ts);

        let cutoff = now - Duration::from_secs_f64(ORDER_WINDOW_S);
        while let Some((ts, code)) = state.order_rejects.front() {
            if *ts >= cutoff {
                break;
            }
            let code = code.clone();
            state.order_rejects.pop_front();
            if let Some(count) = state.reject_codes.get_mut(&code) {
                if *count <= 1 {
                    state.reject_codes.remove(&code);
                } else {
                    *count -= 1;
                }
            }
        }

        let lag_values: Vec<f64> = state.ws_lag_samples.iter().map(|(_, v)| *v).collect();
        let ws_lag = percentile(&lag_values, 95.0);
        let disconnect_rate = rate_per_minute(state.ws_disconnects.len(), RATE_WINDOW_S);
        let rest_total = state.rest_total.len();
        let rest_5xx_rate = if rest_total > 0 {
            state.rest_5xx.len() as f64 / rest_total as f64
        } else {
            0.0
        };
        let rest_timeout_rate = if rest_total > 0 {
            state.rest_timeouts.len() as f64 / rest_total as f64
        } else {
            0.0
        };
        let order_total = state.order_total.len();
        let order_reject_rate = if order_total > 0 {
            state.order_rejects.len() as f64 / order_total as f64
        } else {
            0.0
        };

        [ws_lag, disconnect_rate, rest_5xx_rate, rest_timeout_rate, order_reject_rate]
    }

    fn prune<T>(dq: &mut VecDeque<T>, now: Instant, window_s: f64, ts_of: impl Fn(&T) -> Instant) {
        let cutoff = now - Duration::from_secs_f64(window_s);
        while let Some(front) = dq.front() {
            if ts_of(front) >= cutoff {
                break;
            }
            dq.pop_front();
        }
    }

    fn compute_burn_rate(state: &mut VenueState, severity: BrokerState, now: Instant, window_s: f64) -> f64 {
        let window = window_s.max(60.0);
        let cutoff = now - Duration::from_secs_f64(window);
        let history_window = Duration::from_secs_f64(window * HISTORY_WINDOW_MULTIPLIER);
        while let Some((ts, _)) = state.history.front() {
            if now.duration_since(*ts) <= history_window {
                break;
            }
            state.history.pop_front();
        }

        let mut effective: Vec<(Instant, BrokerState)> = state.history.iter().cloned().collect();
        if effective.last().map(|(_, s)| *s) != Some(severity) {
            effective.push((now, severity));
        }

        let mut total_bad = 0.0f64;
        let mut prev_ts = now;
        let mut prev_state = severity;
        for (ts, entry_state) in effective.iter().rev() {
            let clamped = if *ts < cutoff { cutoff } else { *ts };
            let duration = prev_ts.saturating_duration_since(clamped).as_secs_f64().max(0.0);
            if matches!(prev_state, BrokerState::Degraded | BrokerState::Down) {
                total_bad += duration;
            }
            prev_ts = clamped;
            prev_state = *entry_state;
            if clamped <= cutoff {
                break;
            }
        }

        let burn_rate = if window > 0.0 { total_bad / window } else { 0.0 };
        state.burn_rate = burn_rate;
        burn_rate
    }

    fn apply_state(&self, venue: &str, state: &mut VenueState, severity: BrokerState, burn_rate: f64, reason: String) {
        let now = Instant::now();
        let previous = state.state;
        state.state = severity;
        state.last_reason = reason.clone();
        state.burn_rate = burn_rate;
        if state.history.back().map(|(_, s)| *s) != Some(severity) {
            state.history.push_back((now, severity));
        }

        if previous != severity {
            info!(venue, ?severity, reason = %reason, "watchdog state transition");
        }

        let newly_bad = severity != BrokerState::Up;
        let mut any_throttled = self.any_throttled.lock();
        if newly_bad && !state.throttled {
            state.throttled = true;
            *any_throttled = true;
            let _ = self.events.send(WatchdogEvent {
                venue: venue.to_string(),
                state: severity,
                reason: reason.clone(),
                auto_hold: false,
            });
        } else if !newly_bad && state.throttled {
            state.throttled = false;
            *any_throttled = false;
            let _ = self.events.send(WatchdogEvent {
                venue: venue.to_string(),
                state: severity,
                reason: reason.clone(),
                auto_hold: false,
            });
        }
        drop(any_throttled);

        if severity == BrokerState::Down && previous != BrokerState::Down && self.config.auto_hold_on_down {
            warn!(venue, reason = %reason, "watchdog auto-hold triggered");
            let _ = self.events.send(WatchdogEvent {
                venue: venue.to_string(),
                state: severity,
                reason,
                auto_hold: true,
            });
        }
    }
}

fn percentile(values: &[f64], pct: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut ordered = values.to_vec();
    ordered.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let k = (ordered.len() - 1) as f64 * (pct / 100.0);
    let f = k.floor() as usize;
    let c = k.ceil() as usize;
    if f == c {
        ordered[f]
    } else {
        ordered[f] * (c as f64 - k) + ordered[c] * (k - f as f64)
    }
}

fn rate_per_minute(count: usize, window_s: f64) -> f64 {
    if window_s <= 0.0 {
        return count as f64;
    }
    count as f64 * 60.0 / window_s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchdogConfig;

    #[test]
    fn test_ws_lag_spike_marks_down() {
        let watchdog = BrokerWatchdog::new(WatchdogConfig {
            thresholds: crate::config::WatchdogThresholds {
                ws_lag_ms_p95: crate::config::ThresholdPair { degraded: 100.0, down: 500.0 },
                ws_disconnects_per_min: crate::config::ThresholdPair { degraded: 2.0, down: 6.0 },
                rest_5xx_rate: crate::config::ThresholdPair { degraded: 0.02, down: 0.10 },
                rest_timeouts_rate: crate::config::ThresholdPair { degraded: 0.02, down: 0.10 },
                order_reject_rate: crate::config::ThresholdPair { degraded: 0.01, down: 0.05 },
            },
            error_budget_window_s: 600,
            auto_hold_on_down: true,
            block_on_down: true,
        });

        watchdog.record_ws_lag("binance", 900.0);
        assert_eq!(watchdog.state_for("binance"), BrokerState::Down);
        assert!(watchdog.should_block_orders("binance"));
    }

    #[test]
    fn test_percentile_interpolation() {
        assert_eq!(percentile(&[1.0, 2.0, 3.0, 4.0], 50.0), 2.5);
        assert_eq!(percentile(&[], 95.0), 0.0);
    }
}
