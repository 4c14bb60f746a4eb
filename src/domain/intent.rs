use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const FILL_QTY_EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 6);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
}

/// Lifecycle state of an `OrderIntent`. Terminal states are sinks; see
/// `OrderIntent::can_transition_to` for the allowed-transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentState {
    New,
    Pending,
    Sent,
    Acked,
    Partial,
    Filled,
    Canceled,
    Rejected,
    Expired,
    Replaced,
}

impl IntentState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            IntentState::Filled
                | IntentState::Canceled
                | IntentState::Rejected
                | IntentState::Expired
                | IntentState::Replaced
        )
    }

    fn allowed_targets(self) -> &'static [IntentState] {
        use IntentState::*;
        match self {
            New => &[
                Pending, Sent, Acked, Partial, Filled, Canceled, Rejected, Expired,
            ],
            Pending => &[
                Sent, Acked, Partial, Filled, Rejected, Canceled, Expired, Replaced,
            ],
            Sent => &[Acked, Partial, Filled, Rejected, Canceled, Expired, Replaced],
            Acked => &[
                Pending, Sent, Partial, Filled, Canceled, Expired, Replaced,
            ],
            Partial => &[Pending, Sent, Filled, Canceled, Expired, Replaced],
            Filled | Canceled | Rejected | Expired | Replaced => &[],
        }
    }

    pub fn can_transition_to(self, target: IntentState) -> bool {
        self.allowed_targets().contains(&target)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderScope {
    pub account: String,
    pub venue: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub tif: TimeInForce,
    pub strategy: Option<String>,
}

/// Primary logical unit of the execution core: an order request carried
/// through its full broker lifecycle under ledger ownership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub intent_id: String,
    pub request_id: String,
    pub scope: OrderScope,
    pub qty: Decimal,
    pub price: Option<Decimal>,
    pub filled_qty: Decimal,
    pub remaining_qty: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub state: IntentState,
    pub broker_order_id: Option<String>,
    pub replaced_by: Option<String>,
    pub created_ts: DateTime<Utc>,
    pub updated_ts: DateTime<Utc>,
}

impl OrderIntent {
    pub fn new(intent_id: String, request_id: String, scope: OrderScope, qty: Decimal, price: Option<Decimal>) -> Self {
        let now = Utc::now();
        Self {
            intent_id,
            request_id,
            scope,
            qty,
            price,
            filled_qty: Decimal::ZERO,
            remaining_qty: qty,
            avg_fill_price: None,
            state: IntentState::New,
            broker_order_id: None,
            replaced_by: None,
            created_ts: now,
            updated_ts: now,
        }
    }

    pub fn is_inflight(&self) -> bool {
        matches!(
            self.state,
            IntentState::New | IntentState::Pending | IntentState::Sent | IntentState::Acked | IntentState::Partial
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    Active,
    Superseded,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequestLedgerRow {
    pub intent_id: String,
    pub request_id: String,
    pub state: RequestState,
    pub superseded_by: Option<String>,
    pub created_ts: DateTime<Utc>,
    pub updated_ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelState {
    Pending,
    Sent,
    Acked,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelIntent {
    pub intent_id: String,
    pub request_id: String,
    pub broker_order_id: Option<String>,
    pub account: String,
    pub venue: String,
    pub reason: String,
    pub state: CancelState,
    pub created_ts: DateTime<Utc>,
    pub updated_ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub ts: DateTime<Utc>,
    pub qty: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub realised_pnl: Decimal,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Position {
    pub net_qty: Decimal,
    pub vwap: Decimal,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Balance {
    pub total: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_have_no_transitions() {
        assert!(!IntentState::Filled.can_transition_to(IntentState::Acked));
        assert!(!IntentState::Canceled.can_transition_to(IntentState::Sent));
    }

    #[test]
    fn test_new_can_reach_sent_and_acked() {
        assert!(IntentState::New.can_transition_to(IntentState::Sent));
        assert!(IntentState::Sent.can_transition_to(IntentState::Acked));
        assert!(IntentState::Acked.can_transition_to(IntentState::Partial));
        assert!(IntentState::Partial.can_transition_to(IntentState::Filled));
    }
}
