pub mod config;
pub mod domain;
pub mod freeze;
pub mod ledger;
pub mod observability;
pub mod orderbook;
pub mod pretrade_gate;
pub mod reconciler;
pub mod risk_governor;
pub mod router;
pub mod stuck_resolver;
pub mod supervisor;
pub mod watchdog;
