//! Reconciler (§4.11): periodic exchange-vs-ledger divergence check over
//! positions, balances and open orders. Worst-severity-per-cycle drives
//! the Safety Supervisor's auto-hold/auto-clear policy.

use crate::supervisor::SafetySupervisor;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;

pub const RECON_HOLD_REASON: &str = "RECON_DIVERGENCE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Ok,
    Warn,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivergenceKind {
    Position,
    Balance,
    OpenOrder,
}

#[derive(Debug, Clone)]
pub struct Divergence {
    pub venue: String,
    pub key: String,
    pub kind: DivergenceKind,
    pub severity: Severity,
    pub qty_delta: Decimal,
    pub notional_delta: Decimal,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct ReconSnapshot {
    pub worst: Severity,
    pub divergences: Vec<Divergence>,
}

#[derive(Debug, Clone, Default)]
pub struct PositionEntry {
    pub symbol: String,
    pub qty: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct BalanceEntry {
    pub asset: String,
    pub total: Decimal,
}

#[derive(Debug, Clone)]
pub struct OpenOrderEntry {
    pub id: String,
    pub symbol: String,
    pub qty: Decimal,
}

/// Hints for converting a quantity delta into a notional delta, tried in
/// the order the distilled original uses: risk-snapshot-derived price,
/// ledger volume-weighted entry, fresh mark price, raw risk notional.
#[derive(Debug, Clone, Default)]
pub struct PriceHints {
    pub risk_notional: Option<Decimal>,
    pub ledger_qty: Option<Decimal>,
    pub exchange_qty: Option<Decimal>,
    pub ledger_vwap: Option<Decimal>,
    pub mark_price: Option<Decimal>,
}

pub fn estimate_price(hints: &PriceHints) -> Decimal {
    if let Some(risk_notional) = hints.risk_notional {
        if let Some(qty) = hints.ledger_qty.filter(|q| !q.is_zero()) {
            return risk_notional / qty;
        }
        if let Some(qty) = hints.exchange_qty.filter(|q| !q.is_zero()) {
            return risk_notional / qty;
        }
    }
    if let Some(vwap) = hints.ledger_vwap {
        return vwap;
    }
    if let Some(mark) = hints.mark_price {
        return mark;
    }
    hints.risk_notional.unwrap_or(Decimal::ZERO)
}

/// Uppercases, drops a trailing `-SWAP` suffix, then strips `-`/`_` so
/// perpetual-swap naming on one venue reconciles against spot-style
/// naming on another.
pub fn normalise_symbol(symbol: &str) -> String {
    let upper = symbol.trim().to_uppercase();
    let trimmed = upper.strip_suffix("-SWAP").unwrap_or(&upper);
    trimmed.chars().filter(|c| *c != '-' && *c != '_').collect()
}

pub fn normalise_venue(venue: &str) -> String {
    venue.trim().to_lowercase()
}

#[derive(Clone, Copy)]
pub struct ReconConfigThresholds {
    pub qty_tolerance: Decimal,
    pub warn_notional_usd: Decimal,
    pub critical_notional_usd: Decimal,
}

fn severity_from_notional(thresholds: &ReconConfigThresholds, notional_abs: Decimal) -> Severity {
    if notional_abs >= thresholds.critical_notional_usd {
        Severity::Critical
    } else if notional_abs >= thresholds.warn_notional_usd {
        Severity::Warn
    } else {
        Severity::Ok
    }
}

/// Compares local vs. remote positions keyed by normalised symbol.
pub fn compare_positions(
    venue: &str,
    local: &[PositionEntry],
    remote: &[PositionEntry],
    thresholds: &ReconConfigThresholds,
    price_for: impl Fn(&str) -> PriceHints,
) -> Vec<Divergence> {
    let mut local_map: HashMap<String, Decimal> = HashMap::new();
    for entry in local {
        *local_map.entry(normalise_symbol(&entry.symbol)).or_default() += entry.qty;
    }
    let mut remote_map: HashMap<String, Decimal> = HashMap::new();
    for entry in remote {
        *remote_map.entry(normalise_symbol(&entry.symbol)).or_default() += entry.qty;
    }

    let mut symbols: Vec<String> = local_map.keys().chain(remote_map.keys()).cloned().collect();
    symbols.sort();
    symbols.dedup();

    let mut out = Vec::new();
    for symbol in symbols {
        let local_qty = local_map.get(&symbol).copied();
        let remote_qty = remote_map.get(&symbol).copied();
        let delta = local_qty.unwrap_or(Decimal::ZERO) - remote_qty.unwrap_or(Decimal::ZERO);
        if delta.abs() <= thresholds.qty_tolerance {
            continue;
        }

        let hints = price_for(&symbol);
        let price = estimate_price(&hints);
        let notional_delta = delta.abs() * price;

        let one_sided_missing = local_qty.is_none() || remote_qty.is_none();
        let severity = if one_sided_missing && delta.abs() >= thresholds.qty_tolerance {
            Severity::Critical
        } else {
            severity_from_notional(thresholds, notional_delta)
        };

        out.push(Divergence {
            venue: venue.to_string(),
            key: symbol,
            kind: DivergenceKind::Position,
            severity,
            qty_delta: delta,
            notional_delta,
            detail: format!("local={:?} remote={:?}", local_qty, remote_qty),
        });
    }
    out
}

pub fn compare_balances(
    venue: &str,
    local: &[BalanceEntry],
    remote: &[BalanceEntry],
    thresholds: &ReconConfigThresholds,
) -> Vec<Divergence> {
    let mut local_map: HashMap<String, Decimal> = HashMap::new();
    for entry in local {
        *local_map.entry(entry.asset.to_uppercase()).or_default() += entry.total;
    }
    let mut remote_map: HashMap<String, Decimal> = HashMap::new();
    for entry in remote {
        *remote_map.entry(entry.asset.to_uppercase()).or_default() += entry.total;
    }

    let mut assets: Vec<String> = local_map.keys().chain(remote_map.keys()).cloned().collect();
    assets.sort();
    assets.dedup();

    let mut out = Vec::new();
    for asset in assets {
        let local_total = local_map.get(&asset).copied();
        let remote_total = remote_map.get(&asset).copied();
        let delta = local_total.unwrap_or(Decimal::ZERO) - remote_total.unwrap_or(Decimal::ZERO);
        if delta.abs() <= thresholds.qty_tolerance {
            continue;
        }
        let one_sided_missing = local_total.is_none() || remote_total.is_none();
        let severity = if one_sided_missing {
            Severity::Critical
        } else {
            severity_from_notional(thresholds, delta.abs())
        };
        out.push(Divergence {
            venue: venue.to_string(),
            key: asset,
            kind: DivergenceKind::Balance,
            severity,
            qty_delta: delta,
            notional_delta: delta.abs(),
            detail: format!("local={:?} remote={:?}", local_total, remote_total),
        });
    }
    out
}

pub fn compare_open_orders(
    venue: &str,
    local: &[OpenOrderEntry],
    remote: &[OpenOrderEntry],
    thresholds: &ReconConfigThresholds,
    price_for: impl Fn(&str) -> PriceHints,
) -> Vec<Divergence> {
    let local_map: HashMap<&str, &OpenOrderEntry> = local.iter().map(|o| (o.id.as_str(), o)).collect();
    let remote_map: HashMap<&str, &OpenOrderEntry> = remote.iter().map(|o| (o.id.as_str(), o)).collect();

    let mut ids: Vec<&str> = local_map.keys().chain(remote_map.keys()).copied().collect();
    ids.sort_unstable();
    ids.dedup();

    let mut out = Vec::new();
    for id in ids {
        let local_order = local_map.get(id);
        let remote_order = remote_map.get(id);
        match (local_order, remote_order) {
            (Some(l), None) => {
                let price = estimate_price(&price_for(&l.symbol));
                let notional = l.qty.abs() * price;
                out.push(Divergence {
                    venue: venue.to_string(),
                    key: id.to_string(),
                    kind: DivergenceKind::OpenOrder,
                    severity: severity_from_notional(thresholds, notional),
                    qty_delta: l.qty,
                    notional_delta: notional,
                    detail: "local-only order".to_string(),
                });
            }
            (None, Some(r)) => {
                let price = estimate_price(&price_for(&r.symbol));
                let notional = r.qty.abs() * price;
                out.push(Divergence {
                    venue: venue.to_string(),
                    key: id.to_string(),
                    kind: DivergenceKind::OpenOrder,
                    severity: severity_from_notional(thresholds, notional),
                    qty_delta: r.qty,
                    notional_delta: notional,
                    detail: "remote-only order".to_string(),
                });
            }
            (Some(l), Some(r)) => {
                let delta = l.qty - r.qty;
                if delta.abs() <= thresholds.qty_tolerance {
                    continue;
                }
                let price = estimate_price(&price_for(&l.symbol));
                let notional = delta.abs() * price;
                out.push(Divergence {
                    venue: venue.to_string(),
                    key: id.to_string(),
                    kind: DivergenceKind::OpenOrder,
                    severity: severity_from_notional(thresholds, notional),
                    qty_delta: delta,
                    notional_delta: notional,
                    detail: "qty mismatch on common id".to_string(),
                });
            }
            (None, None) => unreachable!("id collected from one of the two maps"),
        }
    }
    out
}

fn worst_of(divergences: &[Divergence]) -> Severity {
    divergences.iter().map(|d| d.severity).max().unwrap_or(Severity::Ok)
}

/// Tracks consecutive OK cycles since the last CRITICAL cycle so the
/// auto-hold engaged on divergence can auto-clear after N clean runs,
/// without clobbering a HOLD engaged for an unrelated reason.
pub struct Reconciler {
    pub thresholds: ReconConfigThresholds,
    clear_after_ok_runs: u32,
    consecutive_ok: Mutex<u32>,
    supervisor: Arc<SafetySupervisor>,
}

impl Reconciler {
    pub fn new(thresholds: ReconConfigThresholds, clear_after_ok_runs: u32, supervisor: Arc<SafetySupervisor>) -> Self {
        Self {
            thresholds,
            clear_after_ok_runs,
            consecutive_ok: Mutex::new(0),
            supervisor,
        }
    }

    /// Folds a cycle's divergences into a snapshot and applies the
    /// auto-hold/auto-clear policy against the shared supervisor.
    pub fn publish_cycle(&self, divergences: Vec<Divergence>) -> ReconSnapshot {
        let worst = worst_of(&divergences);

        match worst {
            Severity::Critical => {
                *self.consecutive_ok.lock() = 0;
                self.supervisor.engage_safety_hold(RECON_HOLD_REASON);
            }
            _ => {
                let snapshot = self.supervisor.snapshot();
                if snapshot.hold_active && snapshot.hold_reason.as_deref() == Some(RECON_HOLD_REASON) {
                    let mut count = self.consecutive_ok.lock();
                    *count += 1;
                    if *count >= self.clear_after_ok_runs {
                        let restore = self.supervisor.previous_safe_mode();
                        self.supervisor.autopilot_apply_resume(restore);
                        *count = 0;
                    }
                } else {
                    *self.consecutive_ok.lock() = 0;
                }
            }
        }

        ReconSnapshot { worst, divergences }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn thresholds() -> ReconConfigThresholds {
        ReconConfigThresholds {
            qty_tolerance: dec!(0.001),
            warn_notional_usd: dec!(100),
            critical_notional_usd: dec!(1000),
        }
    }

    #[test]
    fn test_normalise_symbol_strips_swap_suffix() {
        assert_eq!(normalise_symbol("BTC-USDT-SWAP"), "BTCUSDT");
        assert_eq!(normalise_symbol("btc_usdt"), "BTCUSDT");
    }

    #[test]
    fn test_clean_positions_produce_no_divergence() {
        let local = vec![PositionEntry { symbol: "BTCUSDT".into(), qty: dec!(1.0) }];
        let remote = vec![PositionEntry { symbol: "BTC-USDT-SWAP".into(), qty: dec!(1.0) }];
        let divergences = compare_positions("okx", &local, &remote, &thresholds(), |_| PriceHints::default());
        assert!(divergences.is_empty());
    }

    #[test]
    fn test_missing_side_is_critical_above_tolerance() {
        let local = vec![PositionEntry { symbol: "ETHUSDT".into(), qty: dec!(2.0) }];
        let remote = vec![];
        let divergences = compare_positions("binance", &local, &remote, &thresholds(), |_| PriceHints::default());
        assert_eq!(divergences.len(), 1);
        assert_eq!(divergences[0].severity, Severity::Critical);
    }

    #[test]
    fn test_price_estimation_fallback_chain() {
        let hints = PriceHints { ledger_vwap: Some(dec!(50)), mark_price: Some(dec!(60)), ..Default::default() };
        assert_eq!(estimate_price(&hints), dec!(50));
        let hints = PriceHints { mark_price: Some(dec!(60)), ..Default::default() };
        assert_eq!(estimate_price(&hints), dec!(60));
    }

    #[test]
    fn test_auto_hold_then_clear_after_ok_runs() {
        let supervisor = Arc::new(SafetySupervisor::new());
        let reconciler = Reconciler::new(thresholds(), 2, supervisor.clone());

        let critical = Divergence {
            venue: "okx".into(),
            key: "BTCUSDT".into(),
            kind: DivergenceKind::Position,
            severity: Severity::Critical,
            qty_delta: dec!(5),
            notional_delta: dec!(5000),
            detail: "test".into(),
        };
        reconciler.publish_cycle(vec![critical]);
        assert!(supervisor.is_holding());

        reconciler.publish_cycle(vec![]);
        assert!(supervisor.is_holding());
        reconciler.publish_cycle(vec![]);
        assert!(!supervisor.is_holding());
    }
}
