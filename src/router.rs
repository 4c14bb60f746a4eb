//! Order Router (§4.6): orchestrates the Ledger, Outbox, Pre-trade Gate
//! and Freeze Registry into an exact-once submit/cancel/replace/recover
//! API. Every operation on a given `intent_id` is serialised by a
//! per-id lock so concurrent callers never double-submit to a broker.

use crate::config::Config;
use crate::domain::errors::{OrderRouterError, PretradeValidationError};
use crate::domain::ids::IdGenerator;
use crate::domain::intent::{CancelIntent, CancelState, IntentState, OrderIntent, OrderScope};
use crate::domain::venue::BrokerAdapter;
use crate::freeze::FreezeRegistry;
use crate::ledger::outbox::Outbox;
use crate::ledger::Ledger;
use crate::observability::Metrics;
use crate::pretrade_gate::{self, PretradeRequest, TradeWindow};
use crate::risk_governor::RiskGovernor;
use crate::stuck_resolver::OrderActions;
use crate::supervisor::{RunMode, SafetySupervisor};
use crate::watchdog::BrokerWatchdog;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

pub struct OrderRouter {
    config: Arc<Config>,
    ledger: Arc<Ledger>,
    outbox: Arc<Outbox>,
    ids: IdGenerator,
    supervisor: Arc<SafetySupervisor>,
    freeze: Arc<FreezeRegistry>,
    risk_governor: Arc<RiskGovernor>,
    watchdog: Arc<BrokerWatchdog>,
    brokers: HashMap<String, Arc<dyn BrokerAdapter>>,
    metrics: Arc<Metrics>,
    intent_locks: SyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

#[allow(clippy::too_many_arguments)]
impl OrderRouter {
    pub fn new(
        config: Arc<Config>,
        ledger: Arc<Ledger>,
        outbox: Arc<Outbox>,
        supervisor: Arc<SafetySupervisor>,
        freeze: Arc<FreezeRegistry>,
        risk_governor: Arc<RiskGovernor>,
        watchdog: Arc<BrokerWatchdog>,
        brokers: HashMap<String, Arc<dyn BrokerAdapter>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let id_prefix = config.id_prefix.clone();
        Self {
            config,
            ledger,
            outbox,
            ids: IdGenerator::new(id_prefix),
            supervisor,
            freeze,
            risk_governor,
            watchdog,
            brokers,
            metrics,
            intent_locks: SyncMutex::new(HashMap::new()),
        }
    }

    fn lock_handle(&self, intent_id: &str) -> Arc<AsyncMutex<()>> {
        self.intent_locks
            .lock()
            .entry(intent_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn broker_for(&self, venue: &str) -> Result<Arc<dyn BrokerAdapter>, OrderRouterError> {
        self.brokers.get(venue).cloned().ok_or_else(|| OrderRouterError::BrokerCall {
            venue: venue.to_string(),
            symbol: String::new(),
            reason: "no broker adapter configured for venue".to_string(),
        })
    }

    /// Submits a new order intent. Idempotent on `request_id`: a second
    /// call with the same id returns the original intent without a
    /// second broker call, whether or not the first call has completed.
    pub async fn submit(
        &self,
        scope: OrderScope,
        qty: Decimal,
        price: Option<Decimal>,
        reduce_only: bool,
        request_id: Option<String>,
    ) -> Result<OrderIntent, OrderRouterError> {
        let start = std::time::Instant::now();
        let snapshot = self.supervisor.snapshot();
        if snapshot.mode == RunMode::Hold {
            return Err(OrderRouterError::HoldActive {
                reason: snapshot.hold_reason.unwrap_or_else(|| "HOLD".to_string()),
            });
        }

        let broker = self.broker_for(&scope.venue)?;
        if reduce_only && !broker.supports_reduce_only() {
            return Err(PretradeValidationError::new("REDUCE_ONLY_UNSUPPORTED").into());
        }

        let specs = broker.get_symbol_specs(&scope.symbol).await.map_err(|e| OrderRouterError::BrokerCall {
            venue: scope.venue.clone(),
            symbol: scope.symbol.clone(),
            reason: e.to_string(),
        })?;

        let broker_state = self.watchdog.state_for(&scope.venue);
        let venue_lower = scope.venue.to_lowercase();
        let broker_reason = self
            .watchdog
            .snapshot()
            .into_iter()
            .find(|v| v.venue.to_lowercase() == venue_lower)
            .map(|v| v.last_reason)
            .filter(|r| !r.is_empty());
        let risk_decision = self.risk_governor.compute(broker_state, broker_reason);

        let gate_request = PretradeRequest {
            venue: &scope.venue,
            symbol: &scope.symbol,
            strategy: scope.strategy.as_deref(),
            side: scope.side,
            order_type: scope.order_type,
            qty,
            price,
            is_opening: !reduce_only,
            daily_order_count: 0,
            projected_notional_symbol: qty * price.unwrap_or(Decimal::ONE),
            projected_notional_global: qty * price.unwrap_or(Decimal::ONE),
            projected_notional_venue: qty * price.unwrap_or(Decimal::ONE),
            projected_daily_loss: Decimal::ZERO,
            trade_windows: &[] as &[TradeWindow],
            maintenance_windows: &[] as &[TradeWindow],
        };
        let outcome = pretrade_gate::run_gate(&self.config, &self.supervisor, &self.freeze, &risk_decision, &specs, &gate_request)?;

        let request_id = request_id.unwrap_or_else(|| self.ids.generate());
        let intent_id = self.ids.generate();
        let intent = OrderIntent::new(intent_id.clone(), request_id, scope, outcome.qty, outcome.price);

        let lock = self.lock_handle(&intent.intent_id);
        let _guard = lock.lock().await;

        let persisted = self.ledger.upsert_intent(&intent).await.map_err(|e| OrderRouterError::Ledger { reason: e.to_string() })?;
        if persisted.broker_order_id.is_some() || persisted.state.is_terminal() {
            self.metrics.inc_idempotency_hit("submit");
            return Ok(persisted);
        }

        self.outbox
            .append(&persisted.intent_id, "intent_submitted", serde_json::json!({ "request_id": persisted.request_id }))
            .await
            .map_err(|e| OrderRouterError::Ledger { reason: e.to_string() })?;

        let sent = self
            .ledger
            .transition(&persisted.intent_id, IntentState::Sent, None, None, None)
            .await
            .map_err(|e| OrderRouterError::Ledger { reason: e.to_string() })?;

        let result = match broker
            .create_order(&sent.scope, sent.qty, sent.price, &sent.intent_id, reduce_only)
            .await
        {
            Ok(ack) => {
                self.risk_governor.record_order_success("submit");
                self.outbox
                    .append(&sent.intent_id, "intent_acked", serde_json::json!({ "broker_order_id": ack.broker_order_id.clone() }))
                    .await
                    .map_err(|e| OrderRouterError::Ledger { reason: e.to_string() })?;
                self.ledger
                    .transition(&sent.intent_id, IntentState::Acked, Some(ack.broker_order_id), None, None)
                    .await
                    .map_err(|e| OrderRouterError::Ledger { reason: e.to_string() })
            }
            Err(err) => {
                self.risk_governor.record_order_error("broker_call");
                warn!(intent_id = %sent.intent_id, error = %err, "order submit ambiguous, leaving SENT for recovery");
                Err(OrderRouterError::BrokerCall { venue: sent.scope.venue.clone(), symbol: sent.scope.symbol.clone(), reason: err.to_string() })
            }
        };

        self.metrics.observe_submit_latency(&sent.scope.venue, start.elapsed().as_secs_f64() * 1000.0);
        self.refresh_open_intents_gauge(&sent.scope.venue).await;
        result
    }

    async fn refresh_open_intents_gauge(&self, venue: &str) {
        if let Ok(inflight) = self.ledger.list_inflight(Some(venue)).await {
            self.metrics.set_open_intents(venue, inflight.len() as f64);
        }
    }

    /// Cancels an intent. Already-terminal intents are a cheap no-op;
    /// cancel calls are routed through the broker's idempotent `cancel`.
    pub async fn cancel(&self, intent_id: &str, reason: &str, request_id: Option<String>) -> Result<CancelIntent, OrderRouterError> {
        let lock = self.lock_handle(intent_id);
        let _guard = lock.lock().await;

        let intent = self
            .ledger
            .find_by_intent_id(intent_id)
            .await
            .map_err(|e| OrderRouterError::Ledger { reason: e.to_string() })?
            .ok_or_else(|| OrderRouterError::Ledger { reason: format!("unknown intent {intent_id}") })?;

        let request_id = request_id.unwrap_or_else(|| self.ids.generate());
        let now = chrono::Utc::now();
        let mut cancel = CancelIntent {
            intent_id: self.ids.generate(),
            request_id,
            broker_order_id: intent.broker_order_id.clone(),
            account: intent.scope.account.clone(),
            venue: intent.scope.venue.clone(),
            reason: reason.to_string(),
            state: CancelState::Pending,
            created_ts: now,
            updated_ts: now,
        };

        if intent.state.is_terminal() {
            // A Replaced intent is a ledger sink with no outgoing transition,
            // but its broker order may still be live: best-effort cancel it
            // at the broker without attempting an illegal state change.
            if intent.state == IntentState::Replaced {
                if let Some(broker_order_id) = intent.broker_order_id.clone() {
                    if let Ok(broker) = self.broker_for(&intent.scope.venue) {
                        if let Err(err) = broker.cancel(&broker_order_id).await {
                            warn!(intent_id, error = %err, "best-effort cancel of superseded order failed");
                        }
                    }
                }
            }
            cancel.state = CancelState::Acked;
            return self.ledger.insert_cancel_intent(&cancel).await.map_err(|e| OrderRouterError::Ledger { reason: e.to_string() });
        }

        let persisted_cancel = self.ledger.insert_cancel_intent(&cancel).await.map_err(|e| OrderRouterError::Ledger { reason: e.to_string() })?;
        if persisted_cancel.state != CancelState::Pending {
            return Ok(persisted_cancel);
        }

        let broker = self.broker_for(&intent.scope.venue)?;
        let Some(broker_order_id) = intent.broker_order_id.clone() else {
            // Never reached the broker: cancelling locally is sufficient.
            self.ledger
                .transition(intent_id, IntentState::Canceled, None, None, None)
                .await
                .map_err(|e| OrderRouterError::Ledger { reason: e.to_string() })?;
            self.ledger
                .update_cancel_state(&persisted_cancel.intent_id, CancelState::Acked)
                .await
                .map_err(|e| OrderRouterError::Ledger { reason: e.to_string() })?;
            cancel.state = CancelState::Acked;
            return Ok(cancel);
        };

        match broker.cancel(&broker_order_id).await {
            Ok(()) => {
                self.ledger
                    .transition(intent_id, IntentState::Canceled, None, None, None)
                    .await
                    .map_err(|e| OrderRouterError::Ledger { reason: e.to_string() })?;
                self.ledger
                    .update_cancel_state(&persisted_cancel.intent_id, CancelState::Acked)
                    .await
                    .map_err(|e| OrderRouterError::Ledger { reason: e.to_string() })?;
                cancel.state = CancelState::Acked;
                Ok(cancel)
            }
            Err(err) => {
                self.ledger
                    .update_cancel_state(&persisted_cancel.intent_id, CancelState::Rejected)
                    .await
                    .map_err(|e| OrderRouterError::Ledger { reason: e.to_string() })?;
                Err(OrderRouterError::BrokerCall { venue: intent.scope.venue.clone(), symbol: intent.scope.symbol.clone(), reason: err.to_string() })
            }
        }
    }

    /// Submits a replacement order first, then cancels the original with
    /// reason `replace`. If the cancel leg fails after the replacement is
    /// already live, the stale order is left live and a critical error is
    /// logged for operator escalation — there is no automatic rollback of
    /// a replacement whose cancel leg failed.
    pub async fn replace(&self, intent_id: &str, new_qty: Decimal, new_price: Option<Decimal>) -> Result<OrderIntent, OrderRouterError> {
        let current = self
            .ledger
            .find_by_intent_id(intent_id)
            .await
            .map_err(|e| OrderRouterError::Ledger { reason: e.to_string() })?
            .ok_or_else(|| OrderRouterError::Ledger { reason: format!("unknown intent {intent_id}") })?;

        let replacement = self
            .submit(current.scope.clone(), new_qty, new_price, false, None)
            .await?;

        self.ledger
            .mark_replaced(intent_id, &replacement.intent_id)
            .await
            .map_err(|e| OrderRouterError::Ledger { reason: e.to_string() })?;

        if let Err(err) = self.cancel(intent_id, "replace", None).await {
            error!(intent_id, error = %err, "replace: cancel leg failed after replacement submitted, leaving stale order live");
        }

        let depth = self.replace_chain_depth(intent_id).await;
        self.metrics.set_replace_chain_depth(&current.scope.venue, depth as f64);

        Ok(replacement)
    }

    /// Walks the forward `replaced_by` chain starting at `intent_id`,
    /// counting links. Guarded against cycles even though the forward-only
    /// model should never produce one.
    async fn replace_chain_depth(&self, intent_id: &str) -> usize {
        let mut seen = std::collections::HashSet::new();
        let mut current_id = intent_id.to_string();
        let mut depth = 0;

        while seen.insert(current_id.clone()) {
            match self.ledger.find_by_intent_id(&current_id).await {
                Ok(Some(intent)) => match intent.replaced_by {
                    Some(next) => {
                        depth += 1;
                        current_id = next;
                    }
                    None => break,
                },
                _ => break,
            }
        }

        depth
    }

    /// Reconciles every non-terminal intent against the broker on
    /// restart: SENT orders the broker never acknowledged are left for
    /// the stuck-order resolver; orders the broker confirms terminal are
    /// synced into the ledger.
    pub async fn recover(&self) -> Result<Vec<OrderIntent>, OrderRouterError> {
        let inflight = self.ledger.list_inflight(None).await.map_err(|e| OrderRouterError::Ledger { reason: e.to_string() })?;
        let mut recovered = Vec::new();

        for intent in inflight {
            let Ok(broker) = self.broker_for(&intent.scope.venue) else {
                recovered.push(intent);
                continue;
            };

            match broker.get_order_by_client_id(&intent.intent_id).await {
                Ok(Some(status)) => {
                    let target = if status.is_terminal {
                        if status.remaining_qty.is_zero() {
                            IntentState::Filled
                        } else {
                            IntentState::Canceled
                        }
                    } else if status.filled_qty > Decimal::ZERO {
                        IntentState::Partial
                    } else {
                        IntentState::Acked
                    };
                    let updated = self
                        .ledger
                        .transition(&intent.intent_id, target, Some(status.broker_order_id), Some(status.filled_qty), status.avg_fill_price)
                        .await
                        .map_err(|e| OrderRouterError::Ledger { reason: e.to_string() })?;
                    info!(intent_id = %updated.intent_id, state = ?updated.state, "recovered intent state from broker");
                    recovered.push(updated);
                }
                Ok(None) => {
                    info!(intent_id = %intent.intent_id, "broker has no record of intent; leaving for stuck-order resolver");
                    recovered.push(intent);
                }
                Err(err) => {
                    warn!(intent_id = %intent.intent_id, error = %err, "recovery lookup failed, leaving intent as-is");
                    recovered.push(intent);
                }
            }
        }

        Ok(recovered)
    }
}

#[async_trait]
impl OrderActions for OrderRouter {
    async fn cancel(&self, intent_id: &str, reason: &str) -> Result<()> {
        OrderRouter::cancel(self, intent_id, reason, None).await?;
        Ok(())
    }

    async fn resubmit(&self, intent_id: &str) -> Result<String> {
        let intent = self
            .ledger
            .find_by_intent_id(intent_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("unknown intent {intent_id}"))?;
        let replacement = OrderRouter::submit(self, intent.scope, intent.remaining_qty, intent.price, false, None).await?;
        Ok(replacement.intent_id)
    }
}
