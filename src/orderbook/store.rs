//! Thread-safe in-memory cache of `OrderBookRecord`s keyed by `(venue, symbol)`
//! (§4.3). Reads never block writers for long: each record is guarded
//! independently so one venue's resync can't stall another's top-of-book read.

use crate::domain::book::{BookDiffEvent, BookState, OrderBookRecord};
use crate::domain::errors::NonMonotonicDiffError;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct BookStatusEntry {
    pub venue: String,
    pub symbol: String,
    pub state: BookState,
    pub last_seq: Option<u64>,
    pub staleness_s: f64,
    pub resyncs: u64,
    pub last_reason: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct TopOfBook {
    pub bid: Decimal,
    pub bid_size: Decimal,
    pub ask: Decimal,
    pub ask_size: Decimal,
    pub seq: Option<u64>,
}

pub struct BookStore {
    records: RwLock<HashMap<(String, String), RwLock<OrderBookRecord>>>,
}

impl Default for BookStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BookStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    fn key(venue: &str, symbol: &str) -> (String, String) {
        (venue.to_string(), symbol.to_string())
    }

    fn ensure(&self, venue: &str, symbol: &str) {
        let key = Self::key(venue, symbol);
        if self.records.read().contains_key(&key) {
            return;
        }
        self.records
            .write()
            .entry(key)
            .or_insert_with(|| RwLock::new(OrderBookRecord::new(venue, symbol)));
    }

    pub fn apply_snapshot(
        &self,
        venue: &str,
        symbol: &str,
        bids: Vec<(Decimal, Decimal)>,
        asks: Vec<(Decimal, Decimal)>,
        last_seq: u64,
    ) {
        self.ensure(venue, symbol);
        let records = self.records.read();
        let record = &records[&Self::key(venue, symbol)];
        record.write().apply_snapshot(bids, asks, last_seq);
    }

    /// Applies a diff after validating strict sequence continuity. Callers
    /// that need the Binance overlap-trim behaviour pre-trim the event
    /// before calling this (see `orderbook::stream`'s venue strategy hook).
    pub fn apply_diff_for(&self, venue: &str, symbol: &str, event: BookDiffEvent) -> Result<(), NonMonotonicDiffError> {
        self.ensure(venue, symbol);
        let records = self.records.read();
        let record = &records[&Self::key(venue, symbol)];
        let mut guard = record.write();

        if let Some(last_seq) = guard.last_applied_seq {
            let expected = last_seq + 1;
            if event.seq_from != expected {
                return Err(NonMonotonicDiffError {
                    venue: venue.to_string(),
                    symbol: symbol.to_string(),
                    expected,
                    got: event.seq_from,
                });
            }
        }

        guard.apply_diff(event);
        Ok(())
    }

    pub fn record_resync(&self, venue: &str, symbol: &str, reason: impl Into<String>) {
        self.ensure(venue, symbol);
        let records = self.records.read();
        records[&Self::key(venue, symbol)].write().record_resync(reason);
    }

    pub fn set_state(&self, venue: &str, symbol: &str, state: BookState, reason: Option<String>) {
        self.ensure(venue, symbol);
        let records = self.records.read();
        records[&Self::key(venue, symbol)].write().set_state(state, reason);
    }

    pub fn get_top_of_book(&self, venue: &str, symbol: &str) -> Option<TopOfBook> {
        let records = self.records.read();
        let record = records.get(&Self::key(venue, symbol))?.read();
        let (bid, bid_size, ask, ask_size) = record.top_of_book()?;
        Some(TopOfBook {
            bid,
            bid_size,
            ask,
            ask_size,
            seq: record.last_applied_seq,
        })
    }

    pub fn get_staleness_s(&self, venue: &str, symbol: &str) -> f64 {
        let records = self.records.read();
        match records.get(&Self::key(venue, symbol)) {
            Some(record) => record.read().staleness_s(),
            None => f64::INFINITY,
        }
    }

    pub fn last_applied_seq(&self, venue: &str, symbol: &str) -> Option<u64> {
        let records = self.records.read();
        records.get(&Self::key(venue, symbol))?.read().last_applied_seq
    }

    pub fn status_snapshot(&self) -> Vec<BookStatusEntry> {
        let records = self.records.read();
        let mut entries: Vec<BookStatusEntry> = records
            .iter()
            .map(|((venue, symbol), record)| {
                let guard = record.read();
                BookStatusEntry {
                    venue: venue.clone(),
                    symbol: symbol.clone(),
                    state: guard.state,
                    last_seq: guard.last_applied_seq,
                    staleness_s: guard.staleness_s(),
                    resyncs: guard.resync_count,
                    last_reason: guard.last_reason.clone(),
                }
            })
            .collect();
        entries.sort_by(|a, b| (a.venue.as_str(), a.symbol.as_str()).cmp(&(b.venue.as_str(), b.symbol.as_str())));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_apply_diff_rejects_gap() {
        let store = BookStore::new();
        store.apply_snapshot("okx", "BTCUSDT", vec![(dec!(100), dec!(1))], vec![(dec!(101), dec!(1))], 10);
        let err = store.apply_diff_for(
            "okx",
            "BTCUSDT",
            BookDiffEvent {
                seq_from: 12,
                seq_to: 12,
                bids: vec![],
                asks: vec![],
                ts_ms: 0,
            },
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_status_snapshot_sorted_by_venue_symbol() {
        let store = BookStore::new();
        store.apply_snapshot("okx", "BTCUSDT", vec![], vec![], 1);
        store.apply_snapshot("binance", "ETHUSDT", vec![], vec![], 1);
        let statuses = store.status_snapshot();
        assert_eq!(statuses[0].venue, "binance");
        assert_eq!(statuses[1].venue, "okx");
    }
}
