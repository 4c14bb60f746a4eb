//! Integration coverage for the Order Router's exact-once submit semantics
//! (SPEC_FULL.md §8 duplicate-submit scenario): two `submit()` calls with
//! the same `request_id` must reach the broker at most once.

use async_trait::async_trait;
use execution_core::config::Config;
use execution_core::domain::intent::{OrderScope, OrderSide, OrderType, TimeInForce};
use execution_core::domain::venue::{BrokerAdapter, BrokerOrderAck, BrokerOrderStatus, SymbolSpecs, VenueBalance, VenuePosition};
use execution_core::freeze::FreezeRegistry;
use execution_core::ledger::outbox::Outbox;
use execution_core::ledger::Ledger;
use execution_core::observability::Metrics;
use execution_core::risk_governor::RiskGovernor;
use execution_core::router::OrderRouter;
use execution_core::supervisor::SafetySupervisor;
use execution_core::watchdog::BrokerWatchdog;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

struct CountingBroker {
    calls: AtomicU32,
}

#[async_trait]
impl BrokerAdapter for CountingBroker {
    fn venue(&self) -> &str {
        "paper"
    }

    async fn create_order(
        &self,
        _scope: &OrderScope,
        _qty: Decimal,
        _price: Option<Decimal>,
        idemp_key: &str,
        _reduce_only: bool,
    ) -> anyhow::Result<BrokerOrderAck> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(BrokerOrderAck { broker_order_id: format!("broker-{idemp_key}") })
    }

    async fn cancel(&self, _broker_order_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn get_order_by_client_id(&self, _client_id: &str) -> anyhow::Result<Option<BrokerOrderStatus>> {
        Ok(None)
    }

    async fn positions(&self) -> anyhow::Result<Vec<VenuePosition>> {
        Ok(Vec::new())
    }

    async fn balances(&self) -> anyhow::Result<Vec<VenueBalance>> {
        Ok(Vec::new())
    }

    async fn get_mark_price(&self, _symbol: &str) -> anyhow::Result<Option<Decimal>> {
        Ok(None)
    }

    async fn get_symbol_specs(&self, _symbol: &str) -> anyhow::Result<SymbolSpecs> {
        Ok(SymbolSpecs { tick_size: None, step_size: None, min_notional: None, min_qty: None })
    }
}

fn scope() -> OrderScope {
    OrderScope {
        account: "acct-1".to_string(),
        venue: "paper".to_string(),
        symbol: "BTCUSDT".to_string(),
        side: OrderSide::Buy,
        order_type: OrderType::Market,
        tif: TimeInForce::Gtc,
        strategy: None,
    }
}

async fn build_router(broker: Arc<CountingBroker>) -> (OrderRouter, Arc<Metrics>) {
    let config = Arc::new(Config::from_env().expect("config loads with defaults"));
    let ledger = Arc::new(Ledger::new("sqlite::memory:").await.expect("in-memory ledger"));
    let outbox_path = std::env::temp_dir().join(format!("execution-core-test-outbox-{}.jsonl", std::process::id()));
    let outbox = Arc::new(Outbox::open(outbox_path).await.expect("outbox opens"));
    let supervisor = Arc::new(SafetySupervisor::new());
    let freeze = Arc::new(FreezeRegistry::new());
    let risk_governor = Arc::new(RiskGovernor::new(config.risk.governor.clone()));
    let watchdog = Arc::new(BrokerWatchdog::new(config.watchdog.clone()));
    let metrics = Arc::new(Metrics::new().expect("metrics construct"));

    let mut brokers: HashMap<String, Arc<dyn BrokerAdapter>> = HashMap::new();
    brokers.insert("paper".to_string(), broker);

    let router = OrderRouter::new(config, ledger, outbox, supervisor, freeze, risk_governor, watchdog, brokers, metrics.clone());
    (router, metrics)
}

#[tokio::test]
async fn test_duplicate_submit_reaches_broker_once() {
    let broker = Arc::new(CountingBroker { calls: AtomicU32::new(0) });
    let (router, metrics) = build_router(broker.clone()).await;

    let request_id = "req-duplicate-1".to_string();
    let first = router
        .submit(scope(), dec!(1), Some(dec!(50000)), false, Some(request_id.clone()))
        .await
        .expect("first submit succeeds");
    let second = router
        .submit(scope(), dec!(1), Some(dec!(50000)), false, Some(request_id))
        .await
        .expect("second submit returns the same intent");

    assert_eq!(first.intent_id, second.intent_id);
    assert_eq!(broker.calls.load(Ordering::SeqCst), 1);
    assert!(metrics.render().contains("idempotency_hit_total{operation=\"submit\"} 1"));
}

#[tokio::test]
async fn test_reduce_only_rejected_when_broker_does_not_support_it() {
    let broker = Arc::new(CountingBroker { calls: AtomicU32::new(0) });
    let (router, _metrics) = build_router(broker.clone()).await;

    let err = router
        .submit(scope(), dec!(1), Some(dec!(50000)), true, None)
        .await
        .expect_err("reduce-only must be rejected before reaching the broker");

    assert!(err.to_string().contains("REDUCE_ONLY_UNSUPPORTED"));
    assert_eq!(broker.calls.load(Ordering::SeqCst), 0);
}
