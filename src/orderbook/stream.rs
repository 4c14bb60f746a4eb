//! Per-venue snapshot/diff pipeline (§4.5): gap detection, venue-specific
//! tolerance rules, and the resync flow that re-synchronises a symbol's
//! book from a fresh snapshot after a gap or apply failure.

use crate::domain::book::{BookDiffEvent, BookState};
use crate::domain::venue::MarketDataFeed;
use crate::orderbook::connector::WsConnector;
use crate::orderbook::store::BookStore;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

pub enum DiffDecision {
    Apply(BookDiffEvent),
    Ignore,
    Gap,
}

/// Strategy hook distinguishing Binance-style overlap tolerance from
/// OKX/Bybit-style strict monotonicity (§4.5).
pub trait VenueDiffPolicy: Send + Sync {
    fn validate_diff(&self, last_seq: Option<u64>, event: BookDiffEvent) -> DiffDecision;
}

pub struct OverlapTolerantPolicy;

impl VenueDiffPolicy for OverlapTolerantPolicy {
    fn validate_diff(&self, last_seq: Option<u64>, event: BookDiffEvent) -> DiffDecision {
        let Some(last) = last_seq else {
            return DiffDecision::Apply(event);
        };
        if event.seq_to <= last {
            return DiffDecision::Ignore;
        }
        if event.seq_from <= last {
            let mut trimmed = event;
            trimmed.seq_from = last + 1;
            return DiffDecision::Apply(trimmed);
        }
        if event.seq_from == last + 1 {
            return DiffDecision::Apply(event);
        }
        DiffDecision::Gap
    }
}

pub struct StrictMonotonicPolicy;

impl VenueDiffPolicy for StrictMonotonicPolicy {
    fn validate_diff(&self, last_seq: Option<u64>, event: BookDiffEvent) -> DiffDecision {
        match last_seq {
            None => DiffDecision::Apply(event),
            Some(last) if event.seq_from == last + 1 => DiffDecision::Apply(event),
            Some(_) => DiffDecision::Gap,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOutcome {
    Queued,
    Applied,
    Ignored,
    GapDetected,
}

/// Owns one venue's diff policy, the shared book store and the connector
/// whose backoff state reflects fetch failures during resync.
pub struct OrderBookStream<P: VenueDiffPolicy> {
    venue: String,
    policy: P,
    store: Arc<BookStore>,
    connector: Arc<WsConnector>,
    pending: Mutex<HashMap<String, Vec<BookDiffEvent>>>,
}

impl<P: VenueDiffPolicy> OrderBookStream<P> {
    pub fn new(venue: impl Into<String>, policy: P, store: Arc<BookStore>, connector: Arc<WsConnector>) -> Self {
        Self {
            venue: venue.into(),
            policy,
            store,
            connector,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn handle_snapshot(&self, symbol: &str, bids: Vec<(Decimal, Decimal)>, asks: Vec<(Decimal, Decimal)>, last_seq: u64) {
        self.store.apply_snapshot(&self.venue, symbol, bids, asks, last_seq);
        self.connector.record_success();

        let drained = self.pending.lock().remove(symbol).unwrap_or_default();
        for event in drained {
            self.handle_diff(symbol, event);
        }
    }

    /// Applies a single diff, or queues it if no snapshot has landed yet
    /// for `symbol`. Returns the outcome so the caller's run loop can
    /// decide whether a resync needs to be kicked off.
    pub fn handle_diff(&self, symbol: &str, event: BookDiffEvent) -> DiffOutcome {
        let last_seq = self.store.last_applied_seq(&self.venue, symbol);
        if last_seq.is_none() {
            self.pending.lock().entry(symbol.to_string()).or_default().push(event);
            return DiffOutcome::Queued;
        }

        match self.policy.validate_diff(last_seq, event) {
            DiffDecision::Ignore => DiffOutcome::Ignored,
            DiffDecision::Gap => {
                warn!(venue = %self.venue, symbol, "order book gap detected");
                self.store.record_resync(&self.venue, symbol, "gap_detected");
                self.store.set_state(&self.venue, symbol, BookState::Resyncing, Some("gap_detected".to_string()));
                DiffOutcome::GapDetected
            }
            DiffDecision::Apply(adjusted) => match self.store.apply_diff_for(&self.venue, symbol, adjusted) {
                Ok(()) => DiffOutcome::Applied,
                Err(_) => {
                    self.store.record_resync(&self.venue, symbol, "apply_failed");
                    self.store.set_state(&self.venue, symbol, BookState::Resyncing, Some("apply_failed".to_string()));
                    DiffOutcome::GapDetected
                }
            },
        }
    }

    /// Resync flow: fetch a fresh snapshot and re-arm the symbol. On fetch
    /// failure, the connector is told to reconnect; the symbol's `ready`
    /// state is left untouched and retried on the next failure path.
    pub async fn resync(&self, symbol: &str, feed: &dyn MarketDataFeed, reason: &str) {
        self.store.record_resync(&self.venue, symbol, reason);
        self.store.set_state(&self.venue, symbol, BookState::Resyncing, Some(reason.to_string()));

        match feed.fetch_snapshot(symbol).await {
            Ok((bids, asks, last_seq)) => {
                self.handle_snapshot(symbol, bids, asks, last_seq);
                self.store.set_state(&self.venue, symbol, BookState::Connected, Some("resync_complete".to_string()));
                info!(venue = %self.venue, symbol, "resync complete");
            }
            Err(err) => {
                warn!(venue = %self.venue, symbol, error = %err, "resync snapshot fetch failed");
                self.connector.reconnect_now(format!("resync_fetch_failed: {err}"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn diff(seq_from: u64, seq_to: u64) -> BookDiffEvent {
        BookDiffEvent {
            seq_from,
            seq_to,
            bids: vec![(dec!(100), dec!(1))],
            asks: vec![],
            ts_ms: 0,
        }
    }

    #[test]
    fn test_binance_overlap_diff_is_trimmed() {
        let store = Arc::new(BookStore::new());
        let connector = Arc::new(WsConnector::new("binance", Default::default()));
        let stream = OrderBookStream::new("binance", OverlapTolerantPolicy, store.clone(), connector);

        stream.handle_snapshot("BTCUSDT", vec![(dec!(99), dec!(1))], vec![(dec!(101), dec!(1))], 100);
        assert_eq!(stream.handle_diff("BTCUSDT", diff(101, 101)), DiffOutcome::Applied);
        assert_eq!(stream.handle_diff("BTCUSDT", diff(99, 102)), DiffOutcome::Applied);
        assert_eq!(store.last_applied_seq("binance", "BTCUSDT"), Some(102));
    }

    #[test]
    fn test_okx_gap_triggers_resync() {
        let store = Arc::new(BookStore::new());
        let connector = Arc::new(WsConnector::new("okx", Default::default()));
        let stream = OrderBookStream::new("okx", StrictMonotonicPolicy, store.clone(), connector);

        stream.handle_snapshot("BTCUSDT", vec![(dec!(99), dec!(1))], vec![(dec!(101), dec!(1))], 10);
        assert_eq!(stream.handle_diff("BTCUSDT", diff(11, 11)), DiffOutcome::Applied);
        assert_eq!(stream.handle_diff("BTCUSDT", diff(13, 13)), DiffOutcome::GapDetected);
    }

    #[test]
    fn test_diff_before_snapshot_is_queued() {
        let store = Arc::new(BookStore::new());
        let connector = Arc::new(WsConnector::new("okx", Default::default()));
        let stream = OrderBookStream::new("okx", StrictMonotonicPolicy, store, connector);
        assert_eq!(stream.handle_diff("BTCUSDT", diff(1, 1)), DiffOutcome::Queued);
    }
}
