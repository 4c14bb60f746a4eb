//! Per-venue websocket lifecycle: connect/disconnect state machine,
//! heartbeat staleness detection and exponential backoff with jitter (§4.4).
//! Built fresh (the upstream REST/WS managers in this codebase use a
//! simpler fixed-doubling backoff; this one needs the stability-window
//! reset the safety core relies on to avoid ratcheting delays forever).

use crate::domain::book::BookState;
use parking_lot::Mutex;
use rand::Rng;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub base_s: f64,
    pub maximum_s: f64,
    pub stable_window_s: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_s: 0.25,
            maximum_s: 30.0,
            stable_window_s: 60.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectorEvent {
    pub venue: String,
    pub state: BookState,
    pub reason: Option<String>,
}

struct Inner {
    state: BookState,
    last_reason: Option<String>,
    attempt: u32,
    stable_since: Option<Instant>,
    last_seen: Option<Instant>,
}

/// Drives one venue's connect/reconnect lifecycle. Cheap to clone the
/// handle (it's `Arc`-free by design: callers wrap it themselves if they
/// need to share it across tasks, matching how the stream pipeline owns it).
pub struct WsConnector {
    venue: String,
    config: BackoffConfig,
    inner: Mutex<Inner>,
    events: broadcast::Sender<ConnectorEvent>,
}

impl WsConnector {
    pub fn new(venue: impl Into<String>, config: BackoffConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            venue: venue.into(),
            config,
            inner: Mutex::new(Inner {
                state: BookState::Connecting,
                last_reason: None,
                attempt: 0,
                stable_since: None,
                last_seen: None,
            }),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> BookState {
        self.inner.lock().state
    }

    fn set_state(&self, state: BookState, reason: Option<String>) {
        let mut inner = self.inner.lock();
        let changed = inner.state != state;
        if !changed && reason.is_none() {
            return;
        }
        inner.state = state;
        if reason.is_some() {
            inner.last_reason = reason.clone();
        }
        drop(inner);
        info!(venue = %self.venue, ?state, reason = reason.as_deref(), "ws connector state transition");
        let _ = self.events.send(ConnectorEvent {
            venue: self.venue.clone(),
            state,
            reason,
        });
    }

    pub fn on_open(&self) {
        self.mark_seen();
        self.set_state(BookState::Connected, Some("connected".to_string()));
    }

    pub fn on_message(&self) {
        self.mark_seen();
    }

    pub fn mark_seen(&self) {
        self.inner.lock().last_seen = Some(Instant::now());
    }

    pub fn stale_for(&self) -> Option<f64> {
        self.inner.lock().last_seen.map(|t| t.elapsed().as_secs_f64())
    }

    /// Records a connection failure, returning the backoff delay to wait
    /// before the next reconnect attempt.
    pub fn on_disconnect(&self, reason: impl Into<String>) -> f64 {
        let reason = reason.into();
        self.record_failure();
        let delay = self.next_backoff_delay();
        self.set_state(BookState::Down, Some(reason));
        delay
    }

    pub fn reconnect_now(&self, reason: impl Into<String>) -> f64 {
        self.on_disconnect(reason)
    }

    /// Treats a heartbeat gap as a disconnect with reason `heartbeat_timeout`
    /// and returns the backoff delay, if the timeout has indeed elapsed.
    pub fn check_heartbeat(&self, timeout: Duration) -> Option<f64> {
        let stale = self.stale_for()?;
        if stale > timeout.as_secs_f64() {
            warn!(venue = %self.venue, stale_for_s = stale, "heartbeat timeout");
            Some(self.on_disconnect("heartbeat_timeout"))
        } else {
            None
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.attempt += 1;
        inner.stable_since = None;
    }

    /// No-op before the first backoff attempt. Otherwise starts (or
    /// continues) the stability clock and resets `attempt` to zero once
    /// `stable_window_s` has elapsed with no intervening failure.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.attempt == 0 {
            return;
        }
        let now = Instant::now();
        let since = *inner.stable_since.get_or_insert(now);
        if now.duration_since(since).as_secs_f64() >= self.config.stable_window_s {
            inner.attempt = 0;
            inner.stable_since = None;
        }
    }

    fn next_backoff_delay(&self) -> f64 {
        let attempt = self.inner.lock().attempt.max(1);
        let exponential = self.config.base_s * 2f64.powi(attempt as i32 - 1);
        let capped = exponential.min(self.config.maximum_s);
        let low = capped.max(self.config.base_s);
        let high = (capped * 1.5).max(self.config.base_s);
        if (high - low).abs() < f64::EPSILON {
            low
        } else {
            rand::rng().random_range(low..=high)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_then_caps() {
        let connector = WsConnector::new("binance", BackoffConfig::default());
        let first = connector.on_disconnect("dropped");
        assert!(first >= 0.25 && first <= 0.375 + 1e-9);

        for _ in 0..20 {
            connector.on_disconnect("dropped");
        }
        let capped = connector.next_backoff_delay();
        assert!(capped <= 30.0 * 1.5 + 1e-9);
    }

    #[test]
    fn test_success_resets_attempt_after_stable_window() {
        let connector = WsConnector::new("okx", BackoffConfig {
            base_s: 0.01,
            maximum_s: 1.0,
            stable_window_s: 0.0,
        });
        connector.on_disconnect("dropped");
        assert!(connector.inner.lock().attempt > 0);
        connector.record_success();
        assert_eq!(connector.inner.lock().attempt, 0);
    }

    #[test]
    fn test_idempotent_state_transition_without_reason() {
        let connector = WsConnector::new("bybit", BackoffConfig::default());
        let mut rx = connector.subscribe();
        connector.on_open();
        connector.set_state(BookState::Connected, None);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
