//! Order-book maintenance: the in-memory store (D), the per-venue
//! websocket connector (E), and the snapshot/diff pipeline (F).

pub mod connector;
pub mod store;
pub mod stream;
