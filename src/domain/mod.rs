// Sortable request/intent identifiers
pub mod ids;

// OrderIntent / ledger data model
pub mod intent;

// Order-book record data model
pub mod book;

// Broker adapter + market-data feed traits
pub mod venue;

// Domain-specific error types
pub mod errors;
