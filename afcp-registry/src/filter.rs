//! Conjunctive filter applied by registry listings.

use std::collections::BTreeSet;

use afcp_primitives::{AgentRecord, Capability, Health};

/// Filter for [`Registry::list`](crate::Registry::list).
///
/// An agent matches when it advertises every required capability and, when a
/// health value is set, carries exactly that health state. The empty filter
/// matches every agent.
#[derive(Clone, Debug, Default)]
pub struct ListFilter {
    capabilities: BTreeSet<Capability>,
    health: Option<Health>,
}

impl ListFilter {
    /// Requires the supplied capability in addition to any already required.
    #[must_use]
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    /// Requires every capability in the iterator.
    #[must_use]
    pub fn with_capabilities<I>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = Capability>,
    {
        self.capabilities.extend(capabilities);
        self
    }

    /// Requires the supplied health state.
    #[must_use]
    pub fn with_health(mut self, health: Health) -> Self {
        self.health = Some(health);
        self
    }

    /// Returns the required capabilities.
    #[must_use]
    pub fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    /// Returns the required health state, when set.
    #[must_use]
    pub const fn health(&self) -> Option<Health> {
        self.health
    }

    pub(crate) fn matches(&self, record: &AgentRecord) -> bool {
        if let Some(health) = self.health {
            if record.health() != health {
                return false;
            }
        }
        self.capabilities
            .iter()
            .all(|capability| record.has_capability(capability))
    }
}
