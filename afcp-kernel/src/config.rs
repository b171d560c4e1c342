//! Typed control-plane configuration.
//!
//! The kernel consumes an already-loaded [`FederationConfig`]; file parsing
//! and schema validation belong to the embedding application. Every field
//! carries the documented default, so `FederationConfig::default()` is a
//! working production configuration.

use std::time::Duration;

use afcp_admission::AdmissionConfig;
use afcp_metrics::default_latency_buckets;
use serde::Deserialize;
use thiserror::Error;

/// Result alias for configuration validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors surfaced by configuration validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A field failed validation.
    #[error("invalid federation configuration: {0}")]
    Invalid(&'static str),
}

/// Health-monitor settings.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    /// Interval between monitor ticks.
    pub tick_interval: Duration,
    /// Heartbeat age beyond which an agent is marked offline.
    pub offline_threshold: Duration,
    /// Multiplicative load decay applied per tick.
    pub load_decay_factor: f64,
    /// Additive load decay applied per tick (non-positive).
    pub load_decay_bias: f64,
}

impl HealthConfig {
    /// Validates the monitor settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for zero intervals or decay values
    /// outside their ranges.
    pub fn validate(self) -> ConfigResult<()> {
        if self.tick_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "health tick interval must be greater than zero",
            ));
        }
        if self.offline_threshold.is_zero() {
            return Err(ConfigError::Invalid(
                "offline threshold must be greater than zero",
            ));
        }
        if !self.load_decay_factor.is_finite() || !(0.0..=1.0).contains(&self.load_decay_factor) {
            return Err(ConfigError::Invalid(
                "load decay factor must be a fraction in [0, 1]",
            ));
        }
        if !self.load_decay_bias.is_finite() || !(-1.0..=0.0).contains(&self.load_decay_bias) {
            return Err(ConfigError::Invalid(
                "load decay bias must be in [-1, 0]",
            ));
        }
        Ok(())
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            offline_threshold: Duration::from_secs(60),
            load_decay_factor: 0.98,
            load_decay_bias: -0.01,
        }
    }
}

/// Exporter settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    /// Upper bounds for the route latency histogram, in seconds.
    pub histogram_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            histogram_buckets: default_latency_buckets(),
        }
    }
}

/// Top-level control-plane configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FederationConfig {
    /// Default deadline for routed requests.
    pub route_timeout: Duration,
    /// Default deadline for consensus rounds.
    pub consensus_timeout: Duration,
    /// Per-client admission limits.
    pub admission: AdmissionConfig,
    /// Health-monitor settings.
    pub health: HealthConfig,
    /// Exporter settings.
    pub metrics: MetricsConfig,
}

impl FederationConfig {
    /// Validates every section.
    ///
    /// Bucket bounds are validated when the exporter is constructed.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first offending field.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.route_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "route timeout must be greater than zero",
            ));
        }
        if self.consensus_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "consensus timeout must be greater than zero",
            ));
        }
        self.admission.validate().map_err(|err| match err {
            afcp_admission::AdmissionError::InvalidConfig(reason) => ConfigError::Invalid(reason),
        })?;
        self.health.validate()
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            route_timeout: Duration::from_secs(30),
            consensus_timeout: Duration::from_secs(20),
            admission: AdmissionConfig::default(),
            health: HealthConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}
