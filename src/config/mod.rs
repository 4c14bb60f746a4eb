//! Structured configuration loading from environment variables, organized
//! by the subsystem each group of settings belongs to (§6 configuration
//! contract). Every numeric threshold named by the specification lives on
//! one of these structs — nothing is a magic constant buried in logic.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BrokerState {
    Down = 0,
    Degraded = 1,
    Up = 2,
}

impl FromStr for BrokerState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "UP" => Ok(BrokerState::Up),
            "DEGRADED" => Ok(BrokerState::Degraded),
            "DOWN" => Ok(BrokerState::Down),
            other => anyhow::bail!("invalid broker state: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Paper,
    Testnet,
    Live,
    Canary,
}

impl FromStr for Profile {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "paper" => Ok(Profile::Paper),
            "testnet" => Ok(Profile::Testnet),
            "live" => Ok(Profile::Live),
            "canary" => Ok(Profile::Canary),
            other => anyhow::bail!("invalid PROFILE: {other}"),
        }
    }
}

/// Whether the profile permits opening new exposure. `CloseOnly` blocks any
/// order the gate classifies as opening (`profile_blocks_open`) but still
/// allows reduce-only/closing orders through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradingMode {
    Normal,
    CloseOnly,
}

impl FromStr for TradingMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "normal" => Ok(TradingMode::Normal),
            "close_only" | "closeonly" | "close-only" => Ok(TradingMode::CloseOnly),
            other => anyhow::bail!("invalid TRADING_MODE: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SideCaps {
    pub long: Option<Decimal>,
    pub short: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct ExposureLimits {
    pub max_abs_usdt: Decimal,
    pub per_side_max_abs_usdt: SideCaps,
}

#[derive(Debug, Clone)]
pub struct ExposureCapsConfig {
    pub default: ExposureLimits,
    pub per_symbol: HashMap<String, Decimal>,
    pub per_venue: HashMap<String, Decimal>,
}

/// Parses a `KEY:VALUE,KEY:VALUE` env var into a cap table. Unparseable
/// pairs are dropped rather than failing startup.
fn parse_cap_table(key: &str) -> HashMap<String, Decimal> {
    env::var(key)
        .ok()
        .map(|raw| {
            raw.split(',')
                .filter_map(|pair| {
                    let (k, v) = pair.split_once(':')?;
                    Decimal::from_str(v.trim()).ok().map(|d| (k.trim().to_string(), d))
                })
                .collect()
        })
        .unwrap_or_default()
}

impl ExposureCapsConfig {
    fn from_env() -> Self {
        Self {
            default: ExposureLimits {
                max_abs_usdt: env_or("EXPOSURE_DEFAULT_MAX_ABS_USDT", Decimal::new(500_000, 0)),
                per_side_max_abs_usdt: SideCaps {
                    long: env::var("EXPOSURE_DEFAULT_PER_SIDE_MAX_ABS_USDT_LONG")
                        .ok()
                        .and_then(|v| Decimal::from_str(&v).ok()),
                    short: env::var("EXPOSURE_DEFAULT_PER_SIDE_MAX_ABS_USDT_SHORT")
                        .ok()
                        .and_then(|v| Decimal::from_str(&v).ok()),
                },
            },
            per_symbol: parse_cap_table("EXPOSURE_PER_SYMBOL_MAX_ABS_USDT"),
            per_venue: parse_cap_table("EXPOSURE_PER_VENUE_MAX_ABS_USDT"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RiskNotionalCaps {
    pub per_symbol_usd: Decimal,
    pub per_venue_usd: Option<Decimal>,
    pub total_usd: Decimal,
}

#[derive(Debug, Clone)]
pub struct RiskGovernorConfig {
    pub window_sec: u64,
    pub min_success_rate: f64,
    pub max_order_error_rate: f64,
    pub min_broker_state: BrokerState,
    pub hold_after_windows: u32,
}

impl RiskGovernorConfig {
    fn from_env() -> Self {
        let window_sec = env_or::<u64>("RISK_GOVERNOR_WINDOW_SEC", 3600).max(60);
        let min_success_rate = env_or::<f64>("RISK_GOVERNOR_MIN_SUCCESS_RATE", 0.985).clamp(f64::EPSILON, 1.0);
        let max_order_error_rate = env_or::<f64>("RISK_GOVERNOR_MAX_ORDER_ERROR_RATE", 0.01).clamp(0.0, 1.0);
        let min_broker_state = env::var("RISK_GOVERNOR_MIN_BROKER_STATE")
            .ok()
            .and_then(|v| BrokerState::from_str(&v).ok())
            .unwrap_or(BrokerState::Up);
        let hold_after_windows = env_or::<u32>("RISK_GOVERNOR_HOLD_AFTER_WINDOWS", 2).max(1);
        Self {
            window_sec,
            min_success_rate,
            max_order_error_rate,
            min_broker_state,
            hold_after_windows,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub notional_caps: RiskNotionalCaps,
    pub governor: RiskGovernorConfig,
    pub max_notional_per_order: Decimal,
    pub max_notional_per_symbol: Decimal,
    pub max_notional_global: Decimal,
    pub daily_loss_cap: Decimal,
}

impl RiskConfig {
    fn from_env() -> Self {
        Self {
            notional_caps: RiskNotionalCaps {
                per_symbol_usd: env_or("RISK_NOTIONAL_CAPS_PER_SYMBOL_USD", Decimal::new(250_000, 0)),
                per_venue_usd: env::var("RISK_NOTIONAL_CAPS_PER_VENUE_USD")
                    .ok()
                    .and_then(|v| Decimal::from_str(&v).ok()),
                total_usd: env_or("RISK_NOTIONAL_CAPS_TOTAL_USD", Decimal::new(1_000_000, 0)),
            },
            governor: RiskGovernorConfig::from_env(),
            max_notional_per_order: env_or("RISK_MAX_NOTIONAL_PER_ORDER", Decimal::new(100_000, 0)),
            max_notional_per_symbol: env_or("RISK_MAX_NOTIONAL_PER_SYMBOL", Decimal::new(250_000, 0)),
            max_notional_global: env_or("RISK_MAX_NOTIONAL_GLOBAL", Decimal::new(1_000_000, 0)),
            daily_loss_cap: env_or("RISK_DAILY_LOSS_CAP", Decimal::new(50_000, 0)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GuardRateLimitConfig {
    pub place_per_min: u32,
    pub cancel_per_min: u32,
}

#[derive(Debug, Clone)]
pub struct GuardKillCapsConfig {
    pub enabled: bool,
    pub flatten_on_breach: bool,
}

#[derive(Debug, Clone)]
pub struct GuardsConfig {
    pub rate_limit: GuardRateLimitConfig,
    pub kill_caps: GuardKillCapsConfig,
}

impl GuardsConfig {
    fn from_env() -> Self {
        Self {
            rate_limit: GuardRateLimitConfig {
                place_per_min: env_or("GUARDS_RATE_LIMIT_PLACE_PER_MIN", 120),
                cancel_per_min: env_or("GUARDS_RATE_LIMIT_CANCEL_PER_MIN", 120),
            },
            kill_caps: GuardKillCapsConfig {
                enabled: env_bool("GUARDS_KILL_CAPS_ENABLED", true),
                flatten_on_breach: env_bool("GUARDS_KILL_CAPS_FLATTEN_ON_BREACH", false),
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ThresholdPair {
    pub degraded: f64,
    pub down: f64,
}

#[derive(Debug, Clone)]
pub struct WatchdogThresholds {
    pub ws_lag_ms_p95: ThresholdPair,
    pub ws_disconnects_per_min: ThresholdPair,
    pub rest_5xx_rate: ThresholdPair,
    pub rest_timeouts_rate: ThresholdPair,
    pub order_reject_rate: ThresholdPair,
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub thresholds: WatchdogThresholds,
    pub error_budget_window_s: u64,
    pub auto_hold_on_down: bool,
    pub block_on_down: bool,
}

impl WatchdogConfig {
    fn from_env() -> Self {
        Self {
            thresholds: WatchdogThresholds {
                ws_lag_ms_p95: ThresholdPair {
                    degraded: env_or("WATCHDOG_WS_LAG_MS_P95_DEGRADED", 400.0),
                    down: env_or("WATCHDOG_WS_LAG_MS_P95_DOWN", 1200.0),
                },
                ws_disconnects_per_min: ThresholdPair {
                    degraded: env_or("WATCHDOG_WS_DISCONNECTS_PER_MIN_DEGRADED", 2.0),
                    down: env_or("WATCHDOG_WS_DISCONNECTS_PER_MIN_DOWN", 6.0),
                },
                rest_5xx_rate: ThresholdPair {
                    degraded: env_or("WATCHDOG_REST_5XX_RATE_DEGRADED", 0.02),
                    down: env_or("WATCHDOG_REST_5XX_RATE_DOWN", 0.10),
                },
                rest_timeouts_rate: ThresholdPair {
                    degraded: env_or("WATCHDOG_REST_TIMEOUTS_RATE_DEGRADED", 0.02),
                    down: env_or("WATCHDOG_REST_TIMEOUTS_RATE_DOWN", 0.10),
                },
                order_reject_rate: ThresholdPair {
                    degraded: env_or("WATCHDOG_ORDER_REJECT_RATE_DEGRADED", 0.01),
                    down: env_or("WATCHDOG_ORDER_REJECT_RATE_DOWN", 0.05),
                },
            },
            error_budget_window_s: env_or::<u64>("WATCHDOG_ERROR_BUDGET_WINDOW_S", 600).max(60),
            auto_hold_on_down: env_bool("WATCHDOG_AUTO_HOLD_ON_DOWN", true),
            block_on_down: env_bool("WATCHDOG_BLOCK_ON_DOWN", true),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconConfig {
    pub enabled: bool,
    pub interval_sec: u64,
    pub warn_notional_usd: Decimal,
    pub critical_notional_usd: Decimal,
    pub clear_after_ok_runs: u32,
    pub qty_tolerance: Decimal,
}

impl ReconConfig {
    fn from_env() -> Self {
        Self {
            enabled: env_bool("RECON_ENABLED", true),
            interval_sec: env_or("RECON_INTERVAL_SEC", 15),
            warn_notional_usd: env_or("RECON_WARN_NOTIONAL_USD", Decimal::new(5000, 0)),
            critical_notional_usd: env_or("RECON_CRITICAL_NOTIONAL_USD", Decimal::new(25_000, 0)),
            clear_after_ok_runs: env_or("RECON_CLEAR_AFTER_OK_RUNS", 3),
            qty_tolerance: env_or("RECON_QTY_TOLERANCE", Decimal::new(1, 6)),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_sec)
    }
}

#[derive(Debug, Clone)]
pub struct StuckResolverConfig {
    pub enabled: bool,
    pub pending_timeout_sec: f64,
    pub cancel_grace_sec: f64,
    pub max_retries: u32,
    pub backoff_sec: Vec<f64>,
    pub poll_interval_sec: f64,
}

impl StuckResolverConfig {
    fn from_env() -> Self {
        let backoff_sec = env::var("EXECUTION_STUCK_RESOLVER_BACKOFF_SEC")
            .ok()
            .map(|v| {
                v.split(',')
                    .filter_map(|s| s.trim().parse::<f64>().ok())
                    .collect::<Vec<_>>()
            })
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| vec![1.0, 2.0, 5.0]);
        Self {
            enabled: env_bool("EXECUTION_STUCK_RESOLVER_ENABLED", true),
            pending_timeout_sec: env_or("EXECUTION_STUCK_RESOLVER_PENDING_TIMEOUT_SEC", 8.0),
            cancel_grace_sec: env_or("EXECUTION_STUCK_RESOLVER_CANCEL_GRACE_SEC", 1.0),
            max_retries: env_or("EXECUTION_STUCK_RESOLVER_MAX_RETRIES", 3),
            backoff_sec,
            poll_interval_sec: env_or("EXECUTION_STUCK_RESOLVER_POLL_INTERVAL_SEC", 0.5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub guard_enabled: bool,
    pub margin_ratio_warn: f64,
    pub margin_ratio_critical: f64,
    pub free_collateral_warn_usd: Decimal,
    pub free_collateral_critical_usd: Decimal,
    pub hysteresis_ok_windows: u32,
}

impl HealthConfig {
    fn from_env() -> Self {
        Self {
            guard_enabled: env_bool("HEALTH_GUARD_ENABLED", true),
            margin_ratio_warn: env_or("HEALTH_MARGIN_RATIO_WARN", 0.5),
            margin_ratio_critical: env_or("HEALTH_MARGIN_RATIO_CRITICAL", 0.8),
            free_collateral_warn_usd: env_or("HEALTH_FREE_COLLATERAL_WARN_USD", Decimal::new(10_000, 0)),
            free_collateral_critical_usd: env_or("HEALTH_FREE_COLLATERAL_CRITICAL_USD", Decimal::new(2_500, 0)),
            hysteresis_ok_windows: env_or("HEALTH_HYSTERESIS_OK_WINDOWS", 3),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub profile: Profile,
    pub trading_mode: TradingMode,
    pub id_prefix: String,
    pub ledger_db_url: String,
    pub outbox_path: String,
    pub exposure_caps: ExposureCapsConfig,
    pub risk: RiskConfig,
    pub guards: GuardsConfig,
    pub watchdog: WatchdogConfig,
    pub recon: ReconConfig,
    pub execution_stuck_resolver: StuckResolverConfig,
    pub health: HealthConfig,
    pub allow_autofix: bool,
    pub canary_max_order_notional: Decimal,
    pub canary_max_daily_orders: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let profile_str = env::var("PROFILE").unwrap_or_else(|_| "paper".to_string());
        let profile = Profile::from_str(&profile_str).context("invalid PROFILE")?;
        let trading_mode_str = env::var("TRADING_MODE").unwrap_or_else(|_| "normal".to_string());
        let trading_mode = TradingMode::from_str(&trading_mode_str).context("invalid TRADING_MODE")?;

        Ok(Self {
            profile,
            trading_mode,
            id_prefix: env::var("ID_PREFIX").unwrap_or_else(|_| "rid".to_string()),
            ledger_db_url: env::var("LEDGER_DB_URL").unwrap_or_else(|_| "sqlite://data/orders.db".to_string()),
            outbox_path: env::var("OUTBOX_PATH").unwrap_or_else(|_| "data/outbox.jsonl".to_string()),
            exposure_caps: ExposureCapsConfig::from_env(),
            risk: RiskConfig::from_env(),
            guards: GuardsConfig::from_env(),
            watchdog: WatchdogConfig::from_env(),
            recon: ReconConfig::from_env(),
            execution_stuck_resolver: StuckResolverConfig::from_env(),
            health: HealthConfig::from_env(),
            allow_autofix: env_bool("PRETRADE_ALLOW_AUTOFIX", true),
            canary_max_order_notional: env_or("CANARY_MAX_ORDER_NOTIONAL", Decimal::new(1000, 0)),
            canary_max_daily_orders: env_or("CANARY_MAX_DAILY_ORDERS", 50),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_load() {
        let config = Config::from_env().expect("should parse with defaults");
        assert_eq!(config.risk.governor.hold_after_windows, 2);
        assert!(config.risk.governor.window_sec >= 60);
    }

    #[test]
    fn test_profile_parsing() {
        assert!(matches!(Profile::from_str("paper").unwrap(), Profile::Paper));
        assert!(matches!(Profile::from_str("LIVE").unwrap(), Profile::Live));
        assert!(Profile::from_str("bogus").is_err());
    }

    #[test]
    fn test_trading_mode_parsing() {
        assert!(matches!(TradingMode::from_str("normal").unwrap(), TradingMode::Normal));
        assert!(matches!(TradingMode::from_str("close_only").unwrap(), TradingMode::CloseOnly));
        assert!(TradingMode::from_str("bogus").is_err());
    }

    #[test]
    fn test_exposure_cap_table_parses_pairs() {
        let table = parse_cap_table("__NONEXISTENT_EXPOSURE_CAP_TABLE_ENV__");
        assert!(table.is_empty());
    }

    #[test]
    fn test_broker_state_ordering() {
        assert!(BrokerState::Down < BrokerState::Degraded);
        assert!(BrokerState::Degraded < BrokerState::Up);
    }
}
