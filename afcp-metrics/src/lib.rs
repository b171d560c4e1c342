//! OpenMetrics exporter for the federation control plane.
//!
//! Counters and histograms accumulate in-process; gauges describing the
//! fleet (agent counts per health state, distinct capabilities, per-agent
//! load) are projected from a snapshot supplied at render time, so the
//! exporter stays a read-only view over the registry.

#![warn(missing_docs, clippy::pedantic)]

mod encode;
mod family;

use std::fmt::Write;

use thiserror::Error;

pub use encode::escape_label_value;
pub use family::{CounterFamily, HistogramFamily};

/// Result alias for exporter construction.
pub type MetricsResult<T> = Result<T, MetricsError>;

/// Errors surfaced while building the exporter.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetricsError {
    /// Histogram bucket bounds failed validation.
    #[error("invalid histogram buckets: {0}")]
    InvalidBuckets(&'static str),
}

/// Default latency bucket upper bounds, in seconds.
#[must_use]
pub fn default_latency_buckets() -> Vec<f64> {
    vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
}

fn load_avg_buckets() -> Vec<f64> {
    (1..=10).map(|i| f64::from(i) / 10.0).collect()
}

fn validate_buckets(buckets: &[f64]) -> MetricsResult<()> {
    if buckets.is_empty() {
        return Err(MetricsError::InvalidBuckets("bucket list cannot be empty"));
    }
    if buckets.iter().any(|b| !b.is_finite()) {
        return Err(MetricsError::InvalidBuckets("bounds must be finite"));
    }
    if buckets.windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err(MetricsError::InvalidBuckets(
            "bounds must be strictly increasing",
        ));
    }
    Ok(())
}

/// Terminal outcome of a routed request, as labeled in metrics.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RouteOutcome {
    /// Transport returned bytes before the deadline.
    Ok,
    /// Admission control rejected the request.
    RateLimited,
    /// No eligible agent advertised the capability.
    NoAgent,
    /// The deadline elapsed.
    Timeout,
    /// The transport reported an agent failure.
    AgentError,
    /// The caller cancelled the request.
    Cancelled,
}

impl RouteOutcome {
    /// Returns the metrics label for this outcome.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::RateLimited => "rate_limited",
            Self::NoAgent => "no_agent",
            Self::Timeout => "timeout",
            Self::AgentError => "agent_error",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Point-in-time description of the fleet, supplied at render time.
#[derive(Clone, Debug, Default)]
pub struct FleetStats {
    /// Number of active agents.
    pub active: usize,
    /// Number of degraded agents.
    pub degraded: usize,
    /// Number of offline agents.
    pub offline: usize,
    /// Number of distinct advertised capabilities.
    pub capabilities: usize,
    /// Per-agent load averages, sorted by agent id.
    pub agent_loads: Vec<(String, f64)>,
}

/// The full metric surface of the control plane.
#[derive(Debug)]
pub struct FederationMetrics {
    route_requests: CounterFamily,
    route_latency: HistogramFamily,
    consensus: CounterFamily,
    admission_rejections: CounterFamily,
    tick_load: HistogramFamily,
}

impl FederationMetrics {
    /// Creates the exporter with the supplied latency bucket bounds.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::InvalidBuckets`] when the bounds are empty,
    /// non-finite, or not strictly increasing.
    pub fn new(latency_buckets: Vec<f64>) -> MetricsResult<Self> {
        validate_buckets(&latency_buckets)?;
        Ok(Self {
            route_requests: CounterFamily::new(
                "afcp_route_requests_total",
                "Routed requests by capability and terminal outcome.",
                &["capability", "outcome"],
            ),
            route_latency: HistogramFamily::new(
                "afcp_route_latency_seconds",
                "Route latency from admission to transport completion.",
                &["capability"],
                latency_buckets,
            ),
            consensus: CounterFamily::new(
                "afcp_consensus_total",
                "Consensus rounds by capability and decision.",
                &["capability", "decided"],
            ),
            admission_rejections: CounterFamily::new(
                "afcp_admission_rejections_total",
                "Admission rejections by reason.",
                &["reason"],
            ),
            tick_load: HistogramFamily::new(
                "afcp_health_tick_load_avg",
                "Per-agent load averages observed at each health tick.",
                &[],
                load_avg_buckets(),
            ),
        })
    }

    /// Counts one routed request terminal outcome.
    pub fn record_route(&self, capability: &str, outcome: RouteOutcome) {
        self.route_requests.inc(&[capability, outcome.as_label()]);
    }

    /// Records the latency of a route that reached the transport.
    pub fn record_route_latency(&self, capability: &str, seconds: f64) {
        self.route_latency.observe(&[capability], seconds);
    }

    /// Counts one consensus round; `decided` is `"true"`, `"false"`, or
    /// `"cancelled"`.
    pub fn record_consensus(&self, capability: &str, decided: &str) {
        self.consensus.inc(&[capability, decided]);
    }

    /// Counts one admission rejection by reason label.
    pub fn record_admission_rejection(&self, reason: &str) {
        self.admission_rejections.inc(&[reason]);
    }

    /// Records the load averages observed by one health tick.
    pub fn record_tick_loads(&self, loads: &[f64]) {
        for load in loads {
            self.tick_load.observe(&[], *load);
        }
    }

    /// Returns the current count for a route outcome (used by tests).
    #[must_use]
    pub fn route_count(&self, capability: &str, outcome: RouteOutcome) -> u64 {
        self.route_requests.value(&[capability, outcome.as_label()])
    }

    /// Renders the full OpenMetrics payload, terminated by `# EOF`.
    #[must_use]
    pub fn render(&self, fleet: &FleetStats) -> String {
        let mut out = String::new();

        encode::write_header(
            &mut out,
            "afcp_agents_total",
            "gauge",
            "Registered agents by health state.",
        );
        for (health, count) in [
            ("active", fleet.active),
            ("degraded", fleet.degraded),
            ("offline", fleet.offline),
        ] {
            let _ = writeln!(out, "afcp_agents_total{{health=\"{health}\"}} {count}");
        }

        encode::write_header(
            &mut out,
            "afcp_capabilities_total",
            "gauge",
            "Distinct capabilities currently advertised.",
        );
        let _ = writeln!(out, "afcp_capabilities_total {}", fleet.capabilities);

        encode::write_header(
            &mut out,
            "afcp_load_avg",
            "gauge",
            "Load average per agent.",
        );
        for (agent, load) in &fleet.agent_loads {
            let _ = writeln!(
                out,
                "afcp_load_avg{{agent=\"{}\"}} {load}",
                escape_label_value(agent)
            );
        }

        self.route_requests.render(&mut out);
        self.route_latency.render(&mut out);
        self.consensus.render(&mut out);
        self.admission_rejections.render(&mut out);
        self.tick_load.render(&mut out);

        out.push_str("# EOF\n");
        out
    }
}
