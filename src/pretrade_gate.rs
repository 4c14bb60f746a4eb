//! Pre-trade Gate (§4.7): the fixed ten-step validation chain invoked by
//! the Order Router before any order reaches a broker. Quantisation
//! arithmetic is grounded on the distilled original's floor-to-step
//! helper; the ordered-check structure follows this codebase's
//! `RiskValidator` chain-of-responsibility pattern.

use crate::config::{Config, Profile, TradingMode};
use crate::domain::errors::{PretradeValidationError, QuantizationError};
use crate::domain::intent::{OrderSide, OrderType};
use crate::domain::venue::SymbolSpecs;
use crate::freeze::FreezeRegistry;
use crate::risk_governor::RiskDecision;
use crate::supervisor::{RunMode, SafetySupervisor};
use chrono::{NaiveTime, Utc};
use rust_decimal::Decimal;

const EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 12);

#[derive(Debug, Clone, Copy)]
pub struct TradeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TradeWindow {
    pub fn contains_now(&self) -> bool {
        let now = Utc::now().time();
        if self.end <= self.start {
            now >= self.start || now < self.end
        } else {
            now >= self.start && now < self.end
        }
    }
}

#[derive(Debug, Clone)]
pub struct PretradeRequest<'a> {
    pub venue: &'a str,
    pub symbol: &'a str,
    pub strategy: Option<&'a str>,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub qty: Decimal,
    pub price: Option<Decimal>,
    pub is_opening: bool,
    pub daily_order_count: u32,
    pub projected_notional_symbol: Decimal,
    pub projected_notional_global: Decimal,
    pub projected_notional_venue: Decimal,
    pub projected_daily_loss: Decimal,
    pub trade_windows: &'a [TradeWindow],
    pub maintenance_windows: &'a [TradeWindow],
}

#[derive(Debug, Clone)]
pub struct PretradeOutcome {
    pub qty: Decimal,
    pub price: Option<Decimal>,
    pub fixed: bool,
}

fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    (value / step).trunc() * step
}

fn differs(a: Decimal, b: Decimal) -> bool {
    (a - b).abs() > EPSILON
}

/// Quantises `qty`/`price` against venue specs. When `allow_autofix` is
/// true, step/tick mismatches are silently floored instead of rejected;
/// below-step, below-tick, min-qty and min-notional violations always reject.
pub fn quantize(
    qty: Decimal,
    price: Option<Decimal>,
    specs: &SymbolSpecs,
    allow_autofix: bool,
) -> Result<(Decimal, Option<Decimal>, bool), QuantizationError> {
    let mut fixed = false;
    let mut qty = qty;

    if let Some(step) = specs.step_size.filter(|s| *s > Decimal::ZERO) {
        let floored = floor_to_step(qty, step);
        if floored <= Decimal::ZERO {
            return Err(QuantizationError::QtyBelowStep { value: qty, limit: step });
        }
        if differs(floored, qty) {
            if allow_autofix {
                qty = floored;
                fixed = true;
            } else {
                return Err(QuantizationError::QtyStep { value: qty, limit: step });
            }
        }
    }

    if let Some(min_qty) = specs.min_qty.filter(|m| *m > Decimal::ZERO) {
        if qty + EPSILON < min_qty {
            return Err(QuantizationError::MinQty { value: qty, limit: min_qty });
        }
    }

    let mut price = price;
    if let Some(tick) = specs.tick_size.filter(|t| *t > Decimal::ZERO) {
        if let Some(p) = price {
            let floored = floor_to_step(p, tick);
            if floored <= Decimal::ZERO {
                return Err(QuantizationError::PriceBelowTick { value: p, limit: tick });
            }
            if differs(floored, p) {
                if allow_autofix {
                    price = Some(floored);
                    fixed = true;
                } else {
                    return Err(QuantizationError::PriceTick { value: p, limit: tick });
                }
            }
        }
    }

    if let Some(min_notional) = specs.min_notional.filter(|m| *m > Decimal::ZERO) {
        if let Some(p) = price {
            let notional = qty * p;
            if notional + EPSILON < min_notional {
                return Err(QuantizationError::MinNotional { value: notional, limit: min_notional });
            }
        }
    }

    Ok((qty, price, fixed))
}

/// Runs the fixed ten-step chain; the first failing step short-circuits
/// with the reason vocabulary documented on each check.
#[allow(clippy::too_many_arguments)]
pub fn run_gate(
    config: &Config,
    supervisor: &SafetySupervisor,
    freeze: &FreezeRegistry,
    risk_decision: &RiskDecision,
    specs: &SymbolSpecs,
    request: &PretradeRequest,
) -> Result<PretradeOutcome, PretradeValidationError> {
    // 1. Profile check — `TradingMode::CloseOnly` forbids new exposure;
    // reduce-only/closing orders still pass through.
    if config.trading_mode == TradingMode::CloseOnly && request.is_opening {
        return Err(PretradeValidationError::new("profile_blocks_open"));
    }

    // 2. Safe-mode check
    let snapshot = supervisor.snapshot();
    if snapshot.mode == RunMode::Hold {
        return Err(PretradeValidationError::new("SAFE_MODE_HOLD"));
    }

    // 3. Freeze registry
    if freeze.is_frozen(request.strategy, Some(request.venue), Some(request.symbol)) {
        return Err(PretradeValidationError::new("FROZEN_BY_RISK"));
    }

    // 4. Risk governor throttle
    if risk_decision.throttled && request.is_opening {
        return Err(PretradeValidationError::with_field(
            risk_decision.reason.clone().unwrap_or_else(|| "RISK_THROTTLED".to_string()),
            "risk_governor",
        ));
    }

    // 5. Quantisation
    let (qty, price, fixed) = quantize(request.qty, request.price, specs, config.allow_autofix)
        .map_err(|err| PretradeValidationError::with_field(err.reason(), "quantization"))?;

    // 6. Trade-window check
    if !request.trade_windows.is_empty() && !request.trade_windows.iter().any(|w| w.contains_now()) {
        return Err(PretradeValidationError::new("outside_trade_hours"));
    }

    // 7. Maintenance windows
    if request.maintenance_windows.iter().any(|w| w.contains_now()) {
        return Err(PretradeValidationError::new("maintenance_window"));
    }

    // 8. Exposure caps — increasing exposure past a cap blocks; reducing is always allowed.
    let caps = &config.exposure_caps;
    if request.is_opening {
        if request.projected_notional_global.abs() > caps.default.max_abs_usdt {
            return Err(PretradeValidationError::new("EXPOSURE_CAPS::GLOBAL"));
        }

        let side_cap = match request.side {
            OrderSide::Buy => caps.default.per_side_max_abs_usdt.long,
            OrderSide::Sell => caps.default.per_side_max_abs_usdt.short,
        };
        let symbol_cap = caps.per_symbol.get(request.symbol).copied();
        let tightest_side_cap = [side_cap, symbol_cap].into_iter().flatten().min();
        if let Some(cap) = tightest_side_cap {
            if request.projected_notional_symbol.abs() > cap {
                return Err(PretradeValidationError::new("EXPOSURE_CAPS::SIDE"));
            }
        }

        let venue_cap = caps.per_venue.get(request.venue).copied().unwrap_or(caps.default.max_abs_usdt);
        if request.projected_notional_venue.abs() > venue_cap {
            return Err(PretradeValidationError::new("EXPOSURE_CAPS::VENUE"));
        }
    }

    // 9. Risk limits
    let notional = qty * price.unwrap_or(Decimal::ONE);
    if notional > config.risk.max_notional_per_order {
        return Err(PretradeValidationError::new("max_notional_per_order"));
    }
    if request.projected_notional_symbol.abs() > config.risk.max_notional_per_symbol {
        return Err(PretradeValidationError::new("max_notional_per_symbol"));
    }
    if request.projected_notional_global.abs() > config.risk.max_notional_global {
        return Err(PretradeValidationError::new("max_notional_global"));
    }
    if request.projected_daily_loss.abs() > config.risk.daily_loss_cap {
        return Err(PretradeValidationError::new("daily_loss_cap"));
    }

    // 10. Canary mode
    if config.profile == Profile::Canary {
        if notional > config.canary_max_order_notional {
            return Err(PretradeValidationError::new("canary_max_order_notional"));
        }
        if request.daily_order_count >= config.canary_max_daily_orders {
            return Err(PretradeValidationError::new("canary_max_daily_orders"));
        }
    }

    Ok(PretradeOutcome { qty, price, fixed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn specs() -> SymbolSpecs {
        SymbolSpecs {
            tick_size: Some(dec!(0.5)),
            step_size: Some(dec!(0.1)),
            min_notional: Some(dec!(10)),
            min_qty: Some(dec!(0.1)),
        }
    }

    #[test]
    fn test_quantize_autofix_floors_qty() {
        let (qty, _, fixed) = quantize(dec!(1.23), Some(dec!(100)), &specs(), true).unwrap();
        assert_eq!(qty, dec!(1.2));
        assert!(fixed);
    }

    #[test]
    fn test_quantize_rejects_without_autofix() {
        let err = quantize(dec!(1.23), Some(dec!(100)), &specs(), false).unwrap_err();
        assert_eq!(err.reason(), "qty_step");
    }

    #[test]
    fn test_min_notional_always_rejects_even_with_autofix() {
        let err = quantize(dec!(0.1), Some(dec!(50)), &specs(), true).unwrap_err();
        assert_eq!(err.reason(), "min_notional");
    }
}
