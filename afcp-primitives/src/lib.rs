//! Core primitives shared across the agent federation control plane.
//!
//! This crate defines the data model the other federation crates build on:
//! agent and capability identifiers, the registered agent record, health
//! states, the typed error kinds surfaced by the public API, the normative
//! sticky-routing hash, and the injectable monotonic clock.

#![warn(missing_docs, clippy::pedantic)]

mod agent;
mod capability;
mod clock;
mod error;
mod hash;
mod ids;

pub use agent::{AgentRecord, AgentRegistration, AgentRegistrationBuilder, Health, HeartbeatUpdate};
pub use capability::Capability;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use hash::stable_hash;
pub use ids::AgentId;
