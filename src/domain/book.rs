use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookState {
    Connecting,
    Connected,
    Resyncing,
    Degraded,
    Down,
}

#[derive(Debug, Clone)]
pub struct BookDiffEvent {
    pub seq_from: u64,
    pub seq_to: u64,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
    pub ts_ms: i64,
}

const DIFF_HISTORY_CAPACITY: usize = 20;

/// Per-`(venue, symbol)` book cache. Bids are kept descending by price,
/// asks ascending; a size of zero deletes the level. Diffs are applied
/// strictly in sequence order under the caller's lock (see `orderbook::store`).
#[derive(Debug, Clone)]
pub struct OrderBookRecord {
    pub venue: String,
    pub symbol: String,
    bids: BTreeMap<DescPrice, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    pub last_applied_seq: Option<u64>,
    pub last_update_ts: DateTime<Utc>,
    pub state: BookState,
    pub last_reason: Option<String>,
    pub resync_count: u64,
    diff_history: VecDeque<BookDiffEvent>,
}

/// Reverse-ordered price so bids stay sorted descending inside a `BTreeMap`.
type DescPrice = std::cmp::Reverse<Decimal>;

fn desc_price(price: Decimal) -> DescPrice {
    std::cmp::Reverse(price)
}

impl OrderBookRecord {
    pub fn new(venue: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            venue: venue.into(),
            symbol: symbol.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_applied_seq: None,
            last_update_ts: Utc::now(),
            state: BookState::Connecting,
            last_reason: None,
            resync_count: 0,
            diff_history: VecDeque::new(),
        }
    }

    pub fn apply_snapshot(
        &mut self,
        bids: Vec<(Decimal, Decimal)>,
        asks: Vec<(Decimal, Decimal)>,
        last_seq: u64,
    ) {
        self.bids.clear();
        self.asks.clear();
        for (price, size) in bids {
            if size > Decimal::ZERO {
                self.bids.insert(desc_price(price), size);
            }
        }
        for (price, size) in asks {
            if size > Decimal::ZERO {
                self.asks.insert(price, size);
            }
        }
        self.last_applied_seq = Some(last_seq);
        self.last_update_ts = Utc::now();
        self.diff_history.clear();
        self.state = BookState::Connected;
    }

    /// Applies a diff whose monotonicity has already been validated by the
    /// caller (the stream layer owns gap detection per §4.5).
    pub fn apply_diff(&mut self, event: BookDiffEvent) {
        for (price, size) in &event.bids {
            if *size == Decimal::ZERO {
                self.bids.remove(&desc_price(*price));
            } else {
                self.bids.insert(desc_price(*price), *size);
            }
        }
        for (price, size) in &event.asks {
            if *size == Decimal::ZERO {
                self.asks.remove(price);
            } else {
                self.asks.insert(*price, *size);
            }
        }
        self.last_applied_seq = Some(event.seq_to);
        self.last_update_ts = Utc::now();
        if self.diff_history.len() >= DIFF_HISTORY_CAPACITY {
            self.diff_history.pop_front();
        }
        self.diff_history.push_back(event);
    }

    pub fn record_resync(&mut self, reason: impl Into<String>) {
        self.resync_count += 1;
        self.state = BookState::Resyncing;
        self.last_reason = Some(reason.into());
    }

    pub fn set_state(&mut self, state: BookState, reason: Option<String>) {
        self.state = state;
        if reason.is_some() {
            self.last_reason = reason;
        }
    }

    pub fn top_of_book(&self) -> Option<(Decimal, Decimal, Decimal, Decimal)> {
        let (&std::cmp::Reverse(bid_price), &bid_size) = self.bids.iter().next()?;
        let (&ask_price, &ask_size) = self.asks.iter().next()?;
        Some((bid_price, bid_size, ask_price, ask_size))
    }

    pub fn staleness_s(&self) -> f64 {
        (Utc::now() - self.last_update_ts).num_milliseconds() as f64 / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_snapshot_then_diff() {
        let mut book = OrderBookRecord::new("binance", "BTCUSDT");
        book.apply_snapshot(vec![(dec!(100), dec!(1))], vec![(dec!(101), dec!(1))], 10);
        assert_eq!(book.last_applied_seq, Some(10));
        let top = book.top_of_book().unwrap();
        assert_eq!(top.0, dec!(100));
        assert_eq!(top.2, dec!(101));

        book.apply_diff(BookDiffEvent {
            seq_from: 11,
            seq_to: 11,
            bids: vec![(dec!(100), Decimal::ZERO)],
            asks: vec![(dec!(101.5), dec!(2))],
            ts_ms: 0,
        });
        assert_eq!(book.last_applied_seq, Some(11));
        assert!(book.top_of_book().is_none() || book.top_of_book().unwrap().0 != dec!(100));
    }

    #[test]
    fn test_bids_sorted_descending() {
        let mut book = OrderBookRecord::new("binance", "BTCUSDT");
        book.apply_snapshot(
            vec![(dec!(99), dec!(1)), (dec!(101), dec!(1)), (dec!(100), dec!(1))],
            vec![],
            1,
        );
        let top = book.top_of_book();
        assert!(top.is_none()); // no asks yet
        let std::cmp::Reverse(best_bid) = *book.bids.keys().next().unwrap();
        assert_eq!(best_bid, dec!(101));
    }
}
