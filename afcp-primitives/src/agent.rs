//! Registered agent records, health states, and heartbeat updates.

use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capability::Capability;
use crate::error::{Error, Result};
use crate::ids::AgentId;

/// Tri-state liveness label attached to every registered agent.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    /// Agent is live and eligible for routing.
    Active,
    /// Agent recently failed a dispatch; still routable when health is not required.
    Degraded,
    /// Agent missed its heartbeat window; never selected for healthy-only work.
    Offline,
}

impl Health {
    /// Returns `true` when the agent is eligible for healthy-only selection.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }

    /// Returns the lowercase label used in metrics and logs.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Degraded => "degraded",
            Self::Offline => "offline",
        }
    }
}

impl Display for Health {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

fn ensure_finite_load(load_avg: f64) -> Result<f64> {
    if !load_avg.is_finite() {
        return Err(Error::invalid_input("load average must be finite"));
    }
    Ok(load_avg.clamp(0.0, 1.0))
}

/// A live entry in the federation registry.
///
/// Records are only ever observed through snapshots; all arithmetic on
/// `load_avg` clamps back into `[0, 1]` so the clamping invariant holds at
/// every observation point.
#[derive(Clone, Debug, Serialize)]
pub struct AgentRecord {
    id: AgentId,
    endpoint: String,
    capabilities: BTreeSet<Capability>,
    health: Health,
    last_heartbeat: Duration,
    load_avg: f64,
}

impl AgentRecord {
    /// Returns the agent identifier.
    #[must_use]
    pub fn id(&self) -> &AgentId {
        &self.id
    }

    /// Returns the opaque endpoint handed to the transport.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Returns the deduplicated, ordered capability set.
    #[must_use]
    pub fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    /// Returns `true` when the agent advertises the supplied capability.
    #[must_use]
    pub fn has_capability(&self, capability: &Capability) -> bool {
        self.capabilities.contains(capability)
    }

    /// Returns the current health state.
    #[must_use]
    pub const fn health(&self) -> Health {
        self.health
    }

    /// Returns the monotonic timestamp of the last register or heartbeat.
    #[must_use]
    pub const fn last_heartbeat(&self) -> Duration {
        self.last_heartbeat
    }

    /// Returns the load average in `[0, 1]`.
    #[must_use]
    pub const fn load_avg(&self) -> f64 {
        self.load_avg
    }

    /// Overwrites the health state.
    pub fn set_health(&mut self, health: Health) {
        self.health = health;
    }

    /// Stamps the last-heartbeat timestamp.
    pub fn set_last_heartbeat(&mut self, at: Duration) {
        self.last_heartbeat = at;
    }

    /// Overwrites the load average, clamping into `[0, 1]`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when the value is NaN or infinite.
    pub fn set_load_avg(&mut self, load_avg: f64) -> Result<()> {
        self.load_avg = ensure_finite_load(load_avg)?;
        Ok(())
    }

    /// Multiplies the load average by `factor`, clamping the result.
    pub fn scale_load(&mut self, factor: f64) {
        self.load_avg = (self.load_avg * factor).clamp(0.0, 1.0);
    }

    /// Adds `delta` to the load average, clamping the result.
    pub fn bump_load(&mut self, delta: f64) {
        self.load_avg = (self.load_avg + delta).clamp(0.0, 1.0);
    }

    /// Applies the periodic decay step `load * factor + bias`, floored at zero.
    pub fn decay_load(&mut self, factor: f64, bias: f64) {
        self.load_avg = (self.load_avg * factor + bias).clamp(0.0, 1.0);
    }
}

/// Validated input to the registry's register-or-update operation.
#[derive(Clone, Debug)]
pub struct AgentRegistration {
    id: AgentId,
    endpoint: String,
    capabilities: BTreeSet<Capability>,
    health: Health,
    load_avg: f64,
    last_heartbeat: Option<Duration>,
}

impl AgentRegistration {
    /// Starts building a registration for the supplied agent id.
    #[must_use]
    pub fn builder(id: AgentId) -> AgentRegistrationBuilder {
        AgentRegistrationBuilder {
            id,
            endpoint: None,
            capabilities: BTreeSet::new(),
            health: Health::Active,
            load_avg: 0.0,
            last_heartbeat: None,
        }
    }

    /// Returns the agent identifier.
    #[must_use]
    pub fn id(&self) -> &AgentId {
        &self.id
    }

    /// Returns the caller-supplied heartbeat timestamp, when present.
    #[must_use]
    pub const fn last_heartbeat(&self) -> Option<Duration> {
        self.last_heartbeat
    }

    /// Returns the advertised capability set.
    #[must_use]
    pub fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    /// Converts the registration into a live record stamped at `last_heartbeat`.
    #[must_use]
    pub fn into_record(self, last_heartbeat: Duration) -> AgentRecord {
        AgentRecord {
            id: self.id,
            endpoint: self.endpoint,
            capabilities: self.capabilities,
            health: self.health,
            last_heartbeat,
            load_avg: self.load_avg,
        }
    }
}

/// Builder for [`AgentRegistration`].
#[derive(Debug)]
pub struct AgentRegistrationBuilder {
    id: AgentId,
    endpoint: Option<String>,
    capabilities: BTreeSet<Capability>,
    health: Health,
    load_avg: f64,
    last_heartbeat: Option<Duration>,
}

impl AgentRegistrationBuilder {
    /// Sets the opaque endpoint the transport will dial.
    #[must_use]
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Adds a single capability; duplicates collapse.
    #[must_use]
    pub fn capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    /// Replaces the capability set; duplicates collapse.
    #[must_use]
    pub fn capabilities<I>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = Capability>,
    {
        self.capabilities = capabilities.into_iter().collect();
        self
    }

    /// Sets the initial health state (defaults to [`Health::Active`]).
    #[must_use]
    pub fn health(mut self, health: Health) -> Self {
        self.health = health;
        self
    }

    /// Sets the initial load average, clamped into `[0, 1]`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when the value is NaN or infinite.
    pub fn load_avg(mut self, load_avg: f64) -> Result<Self> {
        self.load_avg = ensure_finite_load(load_avg)?;
        Ok(self)
    }

    /// Supplies an explicit heartbeat timestamp instead of the clock reading.
    #[must_use]
    pub fn last_heartbeat(mut self, at: Duration) -> Self {
        self.last_heartbeat = Some(at);
        self
    }

    /// Finalizes the registration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when no endpoint was supplied.
    pub fn build(self) -> Result<AgentRegistration> {
        let endpoint = self
            .endpoint
            .ok_or_else(|| Error::invalid_input("registration endpoint must be provided"))?;

        Ok(AgentRegistration {
            id: self.id,
            endpoint,
            capabilities: self.capabilities,
            health: self.health,
            load_avg: self.load_avg,
            last_heartbeat: self.last_heartbeat,
        })
    }
}

/// Partial update carried by a heartbeat.
///
/// Both fields are optional; unknown fields are rejected during
/// deserialization so malformed updates fail loudly at the boundary.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatUpdate {
    /// Replacement health state, when supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<Health>,
    /// Replacement load average, when supplied; clamped on write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_avg: Option<f64>,
}

impl HeartbeatUpdate {
    /// Update that only refreshes the heartbeat timestamp.
    #[must_use]
    pub const fn touch() -> Self {
        Self {
            health: None,
            load_avg: None,
        }
    }

    /// Sets the replacement health state.
    #[must_use]
    pub const fn with_health(mut self, health: Health) -> Self {
        self.health = Some(health);
        self
    }

    /// Sets the replacement load average.
    #[must_use]
    pub const fn with_load_avg(mut self, load_avg: f64) -> Self {
        self.load_avg = Some(load_avg);
        self
    }
}
