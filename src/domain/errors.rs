use rust_decimal::Decimal;
use thiserror::Error;

/// Rejection raised by the pre-trade gate. `reason` is one of the fixed
/// vocabulary strings checked by callers and tests (e.g. `qty_step`,
/// `price_tick`, `min_notional`, `FROZEN_BY_RISK`, `SAFE_MODE_HOLD`,
/// `EXPOSURE_CAPS::GLOBAL`).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("pretrade validation failed: {reason}")]
pub struct PretradeValidationError {
    pub reason: String,
    pub field: Option<String>,
    pub details: Option<String>,
}

impl PretradeValidationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            field: None,
            details: None,
        }
    }

    pub fn with_field(reason: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            field: Some(field.into()),
            details: None,
        }
    }
}

/// Raised when the ledger is asked to move an `OrderIntent` through an
/// illegal state transition. Indicates a bug in the caller, never a
/// recoverable business condition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("illegal order state transition for {intent_id}: {from:?} -> {to:?}")]
pub struct OrderStateTransitionError {
    pub intent_id: String,
    pub from: String,
    pub to: String,
}

/// Broker-call failure surfaced by the Order Router.
#[derive(Debug, Error)]
pub enum OrderRouterError {
    #[error("broker call failed for {venue}/{symbol}: {reason}")]
    BrokerCall {
        venue: String,
        symbol: String,
        reason: String,
    },

    #[error("broker call timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    #[error("ledger error: {reason}")]
    Ledger { reason: String },

    #[error(transparent)]
    Transition(#[from] OrderStateTransitionError),

    #[error(transparent)]
    Pretrade(#[from] PretradeValidationError),

    #[error("runtime is in HOLD: {reason}")]
    HoldActive { reason: String },
}

/// Sub-class of pretrade rejection carrying the throttle decision that
/// produced it, for callers that want to inspect success/error rates.
#[derive(Debug, Error, Clone)]
#[error("pretrade gate throttled: {reason} (success_rate={success_rate}, error_rate={error_rate})")]
pub struct PretradeGateThrottled {
    pub reason: String,
    pub success_rate: f64,
    pub error_rate: f64,
}

/// Internal-only error from the order-book stream; a non-monotonic diff
/// never escapes the stream, it always triggers a resync.
#[derive(Debug, Error, Clone)]
#[error("non-monotonic diff for {venue}/{symbol}: expected {expected}, got {got}")]
pub struct NonMonotonicDiffError {
    pub venue: String,
    pub symbol: String,
    pub expected: u64,
    pub got: u64,
}

/// Errors surfaced while computing reconciliation divergence.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to fetch exchange state for {venue}: {reason}")]
    ExchangeFetchFailed { venue: String, reason: String },

    #[error("failed to read ledger positions: {reason}")]
    LedgerReadFailed { reason: String },
}

/// Errors from the ledger/outbox persistence layer.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("intent {intent_id} scope mismatch: existing {existing}, requested {requested}")]
    ScopeMismatch {
        intent_id: String,
        existing: String,
        requested: String,
    },

    #[error(transparent)]
    Transition(#[from] OrderStateTransitionError),

    #[error("journal io error: {0}")]
    Journal(String),
}

/// Errors from broker venue configuration / symbol specs, used by the
/// quantisation step of the pre-trade gate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuantizationError {
    #[error("{field} invalid: {value:?}")]
    Invalid { field: String, value: String },

    #[error("qty {value} below step {limit}")]
    QtyStep { value: Decimal, limit: Decimal },

    #[error("price {value} below tick {limit}")]
    PriceTick { value: Decimal, limit: Decimal },

    #[error("qty {value} below step size {limit}, floors to zero")]
    QtyBelowStep { value: Decimal, limit: Decimal },

    #[error("price {value} below tick size {limit}, floors to zero")]
    PriceBelowTick { value: Decimal, limit: Decimal },

    #[error("notional {value} below min_notional {limit}")]
    MinNotional { value: Decimal, limit: Decimal },

    #[error("qty {value} below min_qty {limit}")]
    MinQty { value: Decimal, limit: Decimal },
}

impl QuantizationError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Invalid { .. } => "invalid",
            Self::QtyStep { .. } => "qty_step",
            Self::PriceTick { .. } => "price_tick",
            Self::QtyBelowStep { .. } => "qty_below_step",
            Self::PriceBelowTick { .. } => "price_below_tick",
            Self::MinNotional { .. } => "min_notional",
            Self::MinQty { .. } => "min_qty",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pretrade_error_formatting() {
        let err = PretradeValidationError::new("FROZEN_BY_RISK");
        assert!(err.to_string().contains("FROZEN_BY_RISK"));
    }

    #[test]
    fn test_quantization_reason_codes() {
        let err = QuantizationError::QtyStep {
            value: Decimal::new(15, 1),
            limit: Decimal::new(1, 1),
        };
        assert_eq!(err.reason(), "qty_step");
    }
}
