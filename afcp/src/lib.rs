//! Agent federation control plane facade.
//!
//! Depend on this crate via `cargo add afcp`. It bundles the internal
//! federation crates behind feature flags so embedders can drop components
//! they do not need; the default feature set is the full control plane.

#![warn(missing_docs, clippy::pedantic)]

/// Re-export shared primitives for convenience.
pub use afcp_primitives as primitives;

/// Transport abstraction (enabled by `transport` feature).
#[cfg(feature = "transport")]
pub use afcp_transport as transport;

/// Agent registry and capability index (enabled by `registry` feature).
#[cfg(feature = "registry")]
pub use afcp_registry as registry;

/// Per-client admission control (enabled by `admission` feature).
#[cfg(feature = "admission")]
pub use afcp_admission as admission;

/// Selection, dispatch, and quorum fan-out (enabled by `routing` feature).
#[cfg(feature = "routing")]
pub use afcp_routing as routing;

/// OpenMetrics exporter (enabled by `metrics` feature).
#[cfg(feature = "metrics")]
pub use afcp_metrics as metrics;

/// Control-plane kernel and public API (enabled by `kernel` feature).
#[cfg(feature = "kernel")]
pub use afcp_kernel as kernel;
