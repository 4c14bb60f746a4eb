//! Execution core server - headless safety and execution runtime.
//!
//! Runs the order router, reconciler and stuck-order resolver loops
//! against whatever venue adapters are configured. Metrics are push-based
//! (structured JSON logs plus a readable Prometheus snapshot) - no HTTP
//! server, no incoming connections.
//!
//! # Environment Variables
//! See `src/config/mod.rs` for the full list; the only one read directly
//! here is `METRICS_LOG_INTERVAL_SEC` (default: 60).

use anyhow::Result;
use execution_core::config::{BrokerState, Config};
use execution_core::domain::venue::BrokerAdapter;
use execution_core::freeze::FreezeRegistry;
use execution_core::ledger::outbox::Outbox;
use execution_core::ledger::Ledger;
use execution_core::observability::Metrics;
use execution_core::reconciler::{BalanceEntry, OpenOrderEntry, PositionEntry, PriceHints, ReconConfigThresholds, Reconciler};
use execution_core::risk_governor::RiskGovernor;
use execution_core::router::OrderRouter;
use execution_core::stuck_resolver::{OpenIntentView, OrderActions, StuckOrderResolver};
use execution_core::supervisor::SafetySupervisor;
use execution_core::watchdog::BrokerWatchdog;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{Level, error, info, warn};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false).pretty();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    info!("execution-core {} starting", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(Config::from_env()?);
    info!(profile = ?config.profile, "configuration loaded");

    let ledger = Arc::new(Ledger::new(&config.ledger_db_url).await?);
    let outbox = Arc::new(Outbox::open(&config.outbox_path).await?);
    let supervisor = Arc::new(SafetySupervisor::new());
    let freeze = Arc::new(FreezeRegistry::new());
    let risk_governor = Arc::new(RiskGovernor::new(config.risk.governor.clone()));
    let watchdog = Arc::new(BrokerWatchdog::new(config.watchdog.clone()));
    let metrics = Arc::new(Metrics::new()?);

    // Concrete venue adapters (Binance/OKX/Bybit REST+WS clients) are an
    // external injection seam: the router only ever depends on
    // `BrokerAdapter`, never a concrete type, so they are constructed and
    // inserted here by whoever deploys this binary against a real venue.
    let brokers: HashMap<String, Arc<dyn BrokerAdapter>> = HashMap::new();
    if brokers.is_empty() {
        warn!("no broker adapters configured; router will reject every submit() until one is wired in");
    }

    let router = Arc::new(OrderRouter::new(
        config.clone(),
        ledger.clone(),
        outbox.clone(),
        supervisor.clone(),
        freeze.clone(),
        risk_governor.clone(),
        watchdog.clone(),
        brokers.clone(),
        metrics.clone(),
    ));

    info!("recovering in-flight intents against configured venues");
    match router.recover().await {
        Ok(recovered) => info!(count = recovered.len(), "recovery pass complete"),
        Err(err) => error!(error = %err, "recovery pass failed, continuing with ledger state as-is"),
    }

    if config.recon.enabled {
        tokio::spawn(run_reconciler_loop(
            config.clone(),
            ledger.clone(),
            supervisor.clone(),
            brokers.clone(),
            metrics.clone(),
        ));
    } else {
        info!("reconciler disabled by configuration");
    }

    if config.execution_stuck_resolver.enabled {
        tokio::spawn(run_stuck_resolver_loop(config.clone(), ledger.clone(), router.clone(), metrics.clone()));
    } else {
        info!("stuck-order resolver disabled by configuration");
    }

    tokio::spawn(run_watchdog_event_loop(watchdog.clone(), supervisor.clone(), metrics.clone()));

    tokio::spawn(log_metrics_periodically(metrics.clone()));

    info!("execution core running, press Ctrl+C to shut down");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, exiting");

    Ok(())
}

/// Polls every configured venue on `recon.interval_sec`, comparing remote
/// positions/balances against the ledger's notion of open exposure and
/// folding the result into the Reconciler's auto-hold/auto-clear policy.
async fn run_reconciler_loop(
    config: Arc<Config>,
    ledger: Arc<Ledger>,
    supervisor: Arc<SafetySupervisor>,
    brokers: HashMap<String, Arc<dyn BrokerAdapter>>,
    metrics: Arc<Metrics>,
) {
    let thresholds = ReconConfigThresholds {
        qty_tolerance: config.recon.qty_tolerance,
        warn_notional_usd: config.recon.warn_notional_usd,
        critical_notional_usd: config.recon.critical_notional_usd,
    };
    let reconciler = Reconciler::new(thresholds, config.recon.clear_after_ok_runs, supervisor);
    let mut ticker = tokio::time::interval(config.recon.interval());

    loop {
        ticker.tick().await;
        let mut divergences = Vec::new();

        for (venue, broker) in &brokers {
            let remote_positions = match broker.positions().await {
                Ok(p) => p,
                Err(err) => {
                    warn!(venue = venue.as_str(), error = %err, "reconciler: position fetch failed, skipping venue this cycle");
                    continue;
                }
            };
            let remote_balances = match broker.balances().await {
                Ok(b) => b,
                Err(err) => {
                    warn!(venue = venue.as_str(), error = %err, "reconciler: balance fetch failed, skipping venue this cycle");
                    continue;
                }
            };

            // Local open-order notional stands in for a ledger position
            // aggregate: fills-derived net position tracking is out of
            // scope for this pass, so any remote exposure with no matching
            // in-flight intent reads as a full-notional divergence.
            let local_open = ledger.list_inflight(Some(venue.as_str())).await.unwrap_or_default();
            let local_positions: Vec<PositionEntry> = Vec::new();
            let local_balances: Vec<BalanceEntry> = Vec::new();

            let remote_position_entries: Vec<PositionEntry> = remote_positions
                .iter()
                .map(|p| PositionEntry { symbol: p.symbol.clone(), qty: p.qty })
                .collect();
            let remote_balance_entries: Vec<BalanceEntry> = remote_balances
                .iter()
                .map(|b| BalanceEntry { asset: b.asset.clone(), total: b.total })
                .collect();

            let price_for = |symbol: &str| -> PriceHints {
                let ledger_qty = local_open
                    .iter()
                    .filter(|i| i.scope.symbol == symbol)
                    .map(|i| i.qty)
                    .sum();
                PriceHints {
                    risk_notional: None,
                    ledger_qty: Some(ledger_qty),
                    exchange_qty: None,
                    ledger_vwap: None,
                    mark_price: None,
                }
            };

            let remote_open_orders = match broker.open_orders().await {
                Ok(o) => o,
                Err(err) => {
                    warn!(venue = venue.as_str(), error = %err, "reconciler: open-order fetch failed, skipping divergence check this cycle");
                    Vec::new()
                }
            };
            let local_open_order_entries: Vec<OpenOrderEntry> = local_open
                .iter()
                .map(|i| OpenOrderEntry { id: i.intent_id.clone(), symbol: i.scope.symbol.clone(), qty: i.remaining_qty })
                .collect();
            let remote_open_order_entries: Vec<OpenOrderEntry> = remote_open_orders
                .iter()
                .map(|o| OpenOrderEntry { id: o.client_order_id.clone(), symbol: o.symbol.clone(), qty: o.qty })
                .collect();

            let mut venue_divergences = execution_core::reconciler::compare_positions(
                venue,
                &local_positions,
                &remote_position_entries,
                &thresholds,
                price_for,
            );
            venue_divergences.extend(execution_core::reconciler::compare_balances(
                venue,
                &local_balances,
                &remote_balance_entries,
                &thresholds,
            ));
            venue_divergences.extend(execution_core::reconciler::compare_open_orders(
                venue,
                &local_open_order_entries,
                &remote_open_order_entries,
                &thresholds,
                price_for,
            ));

            for d in &venue_divergences {
                let severity = match d.severity {
                    execution_core::reconciler::Severity::Ok => "ok",
                    execution_core::reconciler::Severity::Warn => "warn",
                    execution_core::reconciler::Severity::Critical => "critical",
                };
                metrics.inc_recon_divergence(venue, &d.key, severity);
            }
            divergences.extend(venue_divergences);
        }

        let snapshot = reconciler.publish_cycle(divergences);
        if snapshot.worst >= execution_core::reconciler::Severity::Warn {
            warn!(worst = ?snapshot.worst, count = snapshot.divergences.len(), "reconciliation cycle found divergence");
        }
    }
}

/// Bridges the ledger's non-terminal intents and the router's
/// `OrderActions` impl into the Stuck-order Resolver's poll loop.
async fn run_stuck_resolver_loop(config: Arc<Config>, ledger: Arc<Ledger>, router: Arc<OrderRouter>, metrics: Arc<Metrics>) {
    let resolver = StuckOrderResolver::new(config.execution_stuck_resolver.clone());
    let poll_interval = std::time::Duration::from_secs_f64(config.execution_stuck_resolver.poll_interval_sec);
    let mut ticker = tokio::time::interval(poll_interval);

    loop {
        ticker.tick().await;

        let inflight = match ledger.list_inflight(None).await {
            Ok(v) => v,
            Err(err) => {
                warn!(error = %err, "stuck resolver: failed to list in-flight intents");
                continue;
            }
        };

        let views: Vec<OpenIntentView> = inflight
            .iter()
            .map(|i| OpenIntentView {
                intent_id: i.intent_id.clone(),
                client_ts: i.created_ts,
                filled_qty: i.filled_qty,
                is_terminal: i.state.is_terminal(),
            })
            .collect();

        let actions: &dyn OrderActions = router.as_ref();
        let incidents = resolver.poll_once(&views, actions).await;
        for incident in incidents {
            match incident {
                execution_core::stuck_resolver::Incident::MaxRetriesReached { intent_id } => {
                    metrics.inc_stuck_failure("unknown", &intent_id, "max_retries");
                    error!(intent_id, "stuck-order resolver exhausted retries");
                }
                execution_core::stuck_resolver::Incident::CancelFailed { intent_id, error: err } => {
                    metrics.inc_stuck_failure("unknown", &intent_id, "cancel_failed");
                    warn!(intent_id, error = %err, "stuck-order resolver cancel attempt failed");
                }
            }
        }
    }
}

/// Bridges watchdog state transitions into the Safety Supervisor: a
/// first-time DOWN transition with `auto_hold` engages a hold, any other
/// up/down flip updates the risk governor's throttle.
async fn run_watchdog_event_loop(watchdog: Arc<BrokerWatchdog>, supervisor: Arc<SafetySupervisor>, metrics: Arc<Metrics>) {
    let mut events = watchdog.events();

    loop {
        match events.recv().await {
            Ok(event) => {
                let state_value = match event.state {
                    BrokerState::Up => 0.0,
                    BrokerState::Degraded => 1.0,
                    BrokerState::Down => 2.0,
                };
                metrics.set_watchdog_state(&event.venue, state_value);

                if event.auto_hold {
                    supervisor.engage_safety_hold(format!("{}:{}", event.venue, event.reason));
                } else {
                    let throttled = event.state != BrokerState::Up;
                    let reason = throttled.then(|| format!("{}:{}", event.venue, event.reason));
                    supervisor.update_risk_throttle(throttled, reason);
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "watchdog event loop lagged, some transitions were dropped");
            }
            Err(broadcast::error::RecvError::Closed) => {
                warn!("watchdog event channel closed, stopping event loop");
                break;
            }
        }
    }
}

async fn log_metrics_periodically(metrics: Arc<Metrics>) {
    let interval_sec = std::env::var("METRICS_LOG_INTERVAL_SEC")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(60);
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_sec));

    loop {
        ticker.tick().await;
        let snapshot = metrics.snapshot();
        println!("METRICS_JSON:{}", serde_json::to_string(&snapshot).unwrap_or_default());
    }
}
