//! Agent selection policy.

use std::cmp::Ordering;
use std::sync::Arc;

use afcp_primitives::{AgentId, AgentRecord, Capability, stable_hash};
use afcp_registry::Registry;

/// Options steering a single selection.
#[derive(Clone, Debug)]
pub struct SelectOptions {
    require_healthy: bool,
    prefer_agents: Vec<AgentId>,
    sticky_session_key: Option<String>,
}

impl SelectOptions {
    /// Controls whether only active agents are eligible (default `true`).
    #[must_use]
    pub fn with_require_healthy(mut self, require_healthy: bool) -> Self {
        self.require_healthy = require_healthy;
        self
    }

    /// Adds an agent id to the preference list.
    #[must_use]
    pub fn prefer_agent(mut self, id: AgentId) -> Self {
        self.prefer_agents.push(id);
        self
    }

    /// Pins selection to a stable agent for the supplied session key.
    #[must_use]
    pub fn with_sticky_session_key(mut self, key: impl Into<String>) -> Self {
        self.sticky_session_key = Some(key.into());
        self
    }

    /// Returns whether only active agents are eligible.
    #[must_use]
    pub const fn require_healthy(&self) -> bool {
        self.require_healthy
    }

    /// Returns the preference list.
    #[must_use]
    pub fn prefer_agents(&self) -> &[AgentId] {
        &self.prefer_agents
    }

    /// Returns the sticky session key, when set.
    #[must_use]
    pub fn sticky_session_key(&self) -> Option<&str> {
        self.sticky_session_key.as_deref()
    }
}

impl Default for SelectOptions {
    fn default() -> Self {
        Self {
            require_healthy: true,
            prefer_agents: Vec::new(),
            sticky_session_key: None,
        }
    }
}

/// Picks one agent for a capability from a registry snapshot.
///
/// Selection has no side effects and does not consult admission control.
pub struct Selector {
    registry: Arc<Registry>,
}

impl Selector {
    /// Creates a selector reading candidates from `registry`.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Selects an agent advertising `capability`, or `None` when no
    /// candidate survives the filters.
    #[must_use]
    pub fn select(&self, capability: &Capability, opts: &SelectOptions) -> Option<AgentRecord> {
        let candidates = self.registry.candidates(capability, opts.require_healthy());
        select_from(&candidates, opts).cloned()
    }
}

/// Applies the selection policy to an already-filtered candidate snapshot.
///
/// `candidates` must be sorted by agent id, as registry snapshots are. The
/// paths apply in order: sticky session, preference list, least load; ties
/// always break toward the lexicographically smallest id.
#[must_use]
pub fn select_from<'a>(
    candidates: &'a [AgentRecord],
    opts: &SelectOptions,
) -> Option<&'a AgentRecord> {
    if candidates.is_empty() {
        return None;
    }

    if let Some(key) = opts.sticky_session_key() {
        #[allow(clippy::cast_possible_truncation)]
        let idx = (u64::from(stable_hash(key)) % candidates.len() as u64) as usize;
        return candidates.get(idx);
    }

    if !opts.prefer_agents().is_empty() {
        let preferred = candidates
            .iter()
            .filter(|candidate| opts.prefer_agents().contains(candidate.id()));
        if let Some(best) = least_loaded(preferred) {
            return Some(best);
        }
    }

    least_loaded(candidates.iter())
}

fn least_loaded<'a, I>(candidates: I) -> Option<&'a AgentRecord>
where
    I: Iterator<Item = &'a AgentRecord>,
{
    candidates.min_by(|a, b| {
        a.load_avg()
            .partial_cmp(&b.load_avg())
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id().cmp(b.id()))
    })
}
