//! Agent registry and capability index.
//!
//! The registry owns the set of known agents and a reverse index from
//! capability to agent ids. Both live behind a single reader-writer lock, so
//! every external observation sees a consistent pair. Mutations come from
//! four places: register-or-update, heartbeats, dispatch feedback, and the
//! health monitor's periodic tick.

#![warn(missing_docs, clippy::pedantic)]

mod filter;
mod store;

pub use filter::ListFilter;
pub use store::{Registry, TickPolicy, TickSummary};
