//! Push-based observability: Prometheus metrics plus a typed event/alert
//! pipeline. No HTTP server and no incoming requests — this module only
//! produces data for something else to scrape or forward.

pub mod events;
pub mod metrics;

pub use events::{Event, EventBus, EventSeverity, EventSink};
pub use metrics::Metrics;
