//! Realtime session modules.
//!
//! - `transport`: contract for the underlying realtime connection and the
//!   typed events it reports.
//! - `session`: session manager owning lifecycle state, subscription
//!   reference counts, and event dispatch.

/// Session manager with subscription bookkeeping and reconnect replay.
pub mod session;
/// Transport contract and event types.
pub mod transport;
