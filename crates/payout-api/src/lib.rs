//! Payout tracker HTTP service
//!
//! Serves period aggregates and totals from snapshots and the warm cache, and
//! keeps the warm cache reconciled on a background interval.

pub mod ingestion;
pub mod routes;
pub mod scheduler;
pub mod state;

pub use routes::router;
pub use state::{AppState, SharedState};
