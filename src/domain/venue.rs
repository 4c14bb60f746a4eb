use crate::domain::book::BookDiffEvent;
use crate::domain::intent::{OrderScope, OrderSide};
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

#[derive(Debug, Clone)]
pub struct BrokerOrderAck {
    pub broker_order_id: String,
}

#[derive(Debug, Clone)]
pub struct BrokerOrderStatus {
    pub broker_order_id: String,
    pub filled_qty: Decimal,
    pub remaining_qty: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub is_terminal: bool,
}

#[derive(Debug, Clone)]
pub struct SymbolSpecs {
    pub tick_size: Option<Decimal>,
    pub step_size: Option<Decimal>,
    pub min_notional: Option<Decimal>,
    pub min_qty: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct VenuePosition {
    pub symbol: String,
    pub qty: Decimal,
}

#[derive(Debug, Clone)]
pub struct VenueBalance {
    pub asset: String,
    pub total: Decimal,
}

#[derive(Debug, Clone)]
pub struct VenueOpenOrder {
    pub client_order_id: String,
    pub symbol: String,
    pub qty: Decimal,
}

/// Narrow broker interface (§6). Every venue (binance, okx, bybit, ...)
/// implements this; the router never depends on a concrete broker type.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    fn venue(&self) -> &str;

    async fn create_order(
        &self,
        scope: &OrderScope,
        qty: Decimal,
        price: Option<Decimal>,
        idemp_key: &str,
        reduce_only: bool,
    ) -> Result<BrokerOrderAck>;

    async fn cancel(&self, broker_order_id: &str) -> Result<()>;

    async fn get_order_by_client_id(&self, client_id: &str) -> Result<Option<BrokerOrderStatus>>;

    async fn positions(&self) -> Result<Vec<VenuePosition>>;

    async fn balances(&self) -> Result<Vec<VenueBalance>>;

    async fn get_mark_price(&self, symbol: &str) -> Result<Option<Decimal>>;

    async fn get_symbol_specs(&self, symbol: &str) -> Result<SymbolSpecs>;

    /// Whether this venue honours a reduce-only flag natively; the
    /// Pre-trade Gate uses this to decide the reduce-only Freeze Registry
    /// bypass (see DESIGN.md open-question decisions).
    fn supports_reduce_only(&self) -> bool {
        false
    }

    /// Lists this venue's currently open orders for the reconciler's
    /// open-order divergence check. Venues with no listing endpoint may
    /// leave this at its default empty result.
    async fn open_orders(&self) -> Result<Vec<VenueOpenOrder>> {
        Ok(Vec::new())
    }
}

/// Upstream market-data feed for one venue: snapshot fetch plus the
/// diff stream the `orderbook::stream` pipeline consumes.
#[async_trait]
pub trait MarketDataFeed: Send + Sync {
    async fn fetch_snapshot(&self, symbol: &str) -> Result<(Vec<(Decimal, Decimal)>, Vec<(Decimal, Decimal)>, u64)>;

    async fn next_diff(&mut self, symbol: &str) -> Result<Option<BookDiffEvent>>;
}

pub fn side_for_order(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "buy",
        OrderSide::Sell => "sell",
    }
}
