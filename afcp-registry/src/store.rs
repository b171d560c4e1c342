//! Locked agent store and capability index.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use afcp_primitives::{
    AgentId, AgentRecord, AgentRegistration, Capability, Clock, Health, HeartbeatUpdate, Result,
};
use tracing::debug;

/// Load penalty added when a dispatched request fails or times out.
const FAILURE_PENALTY: f64 = 0.2;

#[derive(Default)]
struct RegistryState {
    agents: BTreeMap<AgentId, AgentRecord>,
    index: HashMap<Capability, BTreeSet<AgentId>>,
}

impl RegistryState {
    fn index_insert(&mut self, capability: &Capability, id: &AgentId) {
        self.index
            .entry(capability.clone())
            .or_default()
            .insert(id.clone());
    }

    fn index_remove(&mut self, capability: &Capability, id: &AgentId) {
        if let Some(ids) = self.index.get_mut(capability) {
            ids.remove(id);
            if ids.is_empty() {
                self.index.remove(capability);
            }
        }
    }
}

/// Parameters applied by one health-monitor tick.
#[derive(Clone, Copy, Debug)]
pub struct TickPolicy {
    /// Heartbeat age beyond which an agent transitions to offline.
    pub offline_threshold: Duration,
    /// Multiplicative load decay applied each tick.
    pub decay_factor: f64,
    /// Additive load decay applied each tick (typically negative).
    pub decay_bias: f64,
}

/// Observations produced by one health-monitor tick.
#[derive(Clone, Debug, Default)]
pub struct TickSummary {
    /// Agents in the active state after the tick.
    pub active: usize,
    /// Agents in the degraded state after the tick.
    pub degraded: usize,
    /// Agents in the offline state after the tick.
    pub offline: usize,
    /// Agents that transitioned to offline during this tick.
    pub went_offline: usize,
    /// Load average of every agent after decay, in registry order.
    pub load_values: Vec<f64>,
}

/// Thread-safe owner of the agent set and its capability index.
///
/// All operations take the internal lock for their full duration, so the
/// index is a pure function of the agent set at every observation point and
/// no caller ever sees a partially updated record.
pub struct Registry {
    clock: Arc<dyn Clock>,
    inner: RwLock<RegistryState>,
}

impl Registry {
    /// Creates an empty registry reading time from `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: RwLock::new(RegistryState::default()),
        }
    }

    /// Registers a new agent or updates an existing one.
    ///
    /// An update overwrites endpoint, capabilities, health, and load; the
    /// stored heartbeat timestamp is preserved unless the registration
    /// carries its own. Returns `true` when the agent was newly inserted.
    ///
    /// # Panics
    ///
    /// Panics if the registry lock has been poisoned.
    pub fn upsert(&self, registration: AgentRegistration) -> bool {
        let now = self.clock.now();
        let mut state = self.inner.write().expect("registry poisoned");
        let id = registration.id().clone();

        let existing = state
            .agents
            .get(&id)
            .map(|record| (record.last_heartbeat(), record.capabilities().clone()));

        if let Some((stored_heartbeat, old_caps)) = existing {
            let stamp = registration.last_heartbeat().unwrap_or(stored_heartbeat);
            let record = registration.into_record(stamp);

            for removed in old_caps.difference(record.capabilities()) {
                state.index_remove(removed, &id);
            }
            for added in record.capabilities().difference(&old_caps) {
                state.index_insert(added, &id);
            }
            state.agents.insert(id, record);
            false
        } else {
            let stamp = registration.last_heartbeat().unwrap_or(now);
            let record = registration.into_record(stamp);
            for capability in record.capabilities() {
                state.index_insert(capability, &id);
            }
            state.agents.insert(id, record);
            true
        }
    }

    /// Removes an agent and its index entries. Returns whether it existed.
    ///
    /// # Panics
    ///
    /// Panics if the registry lock has been poisoned.
    pub fn remove(&self, id: &AgentId) -> bool {
        let mut state = self.inner.write().expect("registry poisoned");
        let Some(record) = state.agents.remove(id) else {
            return false;
        };
        for capability in record.capabilities() {
            state.index_remove(capability, id);
        }
        true
    }

    /// Refreshes an agent's heartbeat and applies the optional update.
    ///
    /// Returns `Ok(false)` without side effects when the id is unknown.
    ///
    /// # Errors
    ///
    /// Returns [`afcp_primitives::Error::InvalidInput`] when the update
    /// carries a NaN or infinite load average.
    ///
    /// # Panics
    ///
    /// Panics if the registry lock has been poisoned.
    pub fn heartbeat(&self, id: &AgentId, update: &HeartbeatUpdate) -> Result<bool> {
        let now = self.clock.now();
        let mut state = self.inner.write().expect("registry poisoned");
        let Some(record) = state.agents.get_mut(id) else {
            return Ok(false);
        };

        if let Some(load_avg) = update.load_avg {
            record.set_load_avg(load_avg)?;
        }
        if let Some(health) = update.health {
            record.set_health(health);
        }
        record.set_last_heartbeat(now);
        Ok(true)
    }

    /// Returns a copy of the agent record, when present.
    ///
    /// # Panics
    ///
    /// Panics if the registry lock has been poisoned.
    #[must_use]
    pub fn get(&self, id: &AgentId) -> Option<AgentRecord> {
        let state = self.inner.read().expect("registry poisoned");
        state.agents.get(id).cloned()
    }

    /// Returns a snapshot of matching agents, sorted by id.
    ///
    /// The snapshot is independent of later mutations.
    ///
    /// # Panics
    ///
    /// Panics if the registry lock has been poisoned.
    #[must_use]
    pub fn list(&self, filter: &crate::ListFilter) -> Vec<AgentRecord> {
        let state = self.inner.read().expect("registry poisoned");
        state
            .agents
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect()
    }

    /// Returns agents advertising `capability`, sorted by id.
    ///
    /// With `require_healthy` set, only active agents are returned.
    ///
    /// # Panics
    ///
    /// Panics if the registry lock has been poisoned.
    #[must_use]
    pub fn candidates(&self, capability: &Capability, require_healthy: bool) -> Vec<AgentRecord> {
        let state = self.inner.read().expect("registry poisoned");
        let Some(ids) = state.index.get(capability) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| state.agents.get(id))
            .filter(|record| !require_healthy || record.health().is_active())
            .cloned()
            .collect()
    }

    /// Rewards an agent after a successful dispatch by scaling its load.
    ///
    /// Silently ignores agents removed since selection.
    ///
    /// # Panics
    ///
    /// Panics if the registry lock has been poisoned.
    pub fn record_success(&self, id: &AgentId, factor: f64) {
        let mut state = self.inner.write().expect("registry poisoned");
        if let Some(record) = state.agents.get_mut(id) {
            record.scale_load(factor);
            debug!(agent_id = %id, load_avg = record.load_avg(), "dispatch success feedback");
        }
    }

    /// Penalizes an agent after a failed or timed-out dispatch.
    ///
    /// The load average is bumped and an active agent is degraded; offline
    /// agents are never upgraded to degraded.
    ///
    /// # Panics
    ///
    /// Panics if the registry lock has been poisoned.
    pub fn record_failure(&self, id: &AgentId) {
        let mut state = self.inner.write().expect("registry poisoned");
        if let Some(record) = state.agents.get_mut(id) {
            record.bump_load(FAILURE_PENALTY);
            if record.health().is_active() {
                record.set_health(Health::Degraded);
            }
            debug!(
                agent_id = %id,
                load_avg = record.load_avg(),
                health = %record.health(),
                "dispatch failure feedback"
            );
        }
    }

    /// Applies one health-monitor pass: offline aging and load decay.
    ///
    /// The whole pass runs under a single write lock, so concurrent readers
    /// observe either the pre-tick or post-tick state, never a mix.
    ///
    /// # Panics
    ///
    /// Panics if the registry lock has been poisoned.
    pub fn tick(&self, policy: &TickPolicy) -> TickSummary {
        let now = self.clock.now();
        let mut state = self.inner.write().expect("registry poisoned");
        let mut summary = TickSummary::default();

        for record in state.agents.values_mut() {
            let age = now.saturating_sub(record.last_heartbeat());
            if age > policy.offline_threshold && record.health() != Health::Offline {
                record.set_health(Health::Offline);
                summary.went_offline += 1;
                debug!(agent_id = %record.id(), ?age, "agent aged out to offline");
            }

            record.decay_load(policy.decay_factor, policy.decay_bias);
            summary.load_values.push(record.load_avg());

            match record.health() {
                Health::Active => summary.active += 1,
                Health::Degraded => summary.degraded += 1,
                Health::Offline => summary.offline += 1,
            }
        }

        summary
    }

    /// Returns the number of registered agents.
    ///
    /// # Panics
    ///
    /// Panics if the registry lock has been poisoned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().expect("registry poisoned").agents.len()
    }

    /// Returns `true` when no agents are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of distinct capabilities currently advertised.
    ///
    /// # Panics
    ///
    /// Panics if the registry lock has been poisoned.
    #[must_use]
    pub fn capability_count(&self) -> usize {
        self.inner.read().expect("registry poisoned").index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ListFilter;

    use afcp_primitives::ManualClock;

    fn capability(name: &str) -> Capability {
        Capability::new(name).expect("capability")
    }

    fn agent_id(name: &str) -> AgentId {
        AgentId::new(name).expect("id")
    }

    fn registration(id: &str, caps: &[&str]) -> AgentRegistration {
        AgentRegistration::builder(agent_id(id))
            .endpoint(format!("{id}.lab:9000"))
            .capabilities(caps.iter().map(|c| capability(c)))
            .build()
            .expect("registration")
    }

    fn registry_at(secs: u64) -> (Arc<ManualClock>, Registry) {
        let clock = Arc::new(ManualClock::new(Duration::from_secs(secs)));
        let registry = Registry::new(Arc::clone(&clock) as Arc<dyn Clock>);
        (clock, registry)
    }

    #[test]
    fn upsert_then_list_round_trips() {
        let (_, registry) = registry_at(5);
        assert!(registry.upsert(registration("a", &["dns"])));
        assert!(!registry.upsert(registration("a", &["dns"])));

        let listed = registry.list(&ListFilter::default());
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id().as_str(), "a");
        assert_eq!(listed[0].last_heartbeat(), Duration::from_secs(5));
    }

    #[test]
    fn reregistration_preserves_heartbeat_unless_supplied() {
        let (clock, registry) = registry_at(10);
        registry.upsert(registration("a", &["dns"]));

        clock.advance(Duration::from_secs(50));
        registry.upsert(registration("a", &["dns"]));
        assert_eq!(
            registry.get(&agent_id("a")).expect("agent").last_heartbeat(),
            Duration::from_secs(10)
        );

        let explicit = AgentRegistration::builder(agent_id("a"))
            .endpoint("a.lab:9000")
            .capability(capability("dns"))
            .last_heartbeat(Duration::from_secs(55))
            .build()
            .expect("registration");
        registry.upsert(explicit);
        assert_eq!(
            registry.get(&agent_id("a")).expect("agent").last_heartbeat(),
            Duration::from_secs(55)
        );
    }

    #[test]
    fn index_tracks_capability_changes() {
        let (_, registry) = registry_at(0);
        registry.upsert(registration("a", &["dns", "dhcp"]));
        assert_eq!(registry.candidates(&capability("dhcp"), false).len(), 1);

        registry.upsert(registration("a", &["dns", "backup"]));
        assert!(registry.candidates(&capability("dhcp"), false).is_empty());
        assert_eq!(registry.candidates(&capability("backup"), false).len(), 1);
        assert_eq!(registry.capability_count(), 2);
    }

    #[test]
    fn remove_is_idempotent_and_clears_index() {
        let (_, registry) = registry_at(0);
        registry.upsert(registration("a", &["dns"]));

        assert!(registry.remove(&agent_id("a")));
        assert!(!registry.remove(&agent_id("a")));
        assert!(registry.candidates(&capability("dns"), false).is_empty());
        assert_eq!(registry.capability_count(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn heartbeat_updates_state_and_ignores_unknown_ids() {
        let (clock, registry) = registry_at(0);
        registry.upsert(registration("a", &["dns"]));

        clock.advance(Duration::from_secs(30));
        let update = HeartbeatUpdate::touch()
            .with_health(Health::Degraded)
            .with_load_avg(0.7);
        assert!(registry.heartbeat(&agent_id("a"), &update).expect("heartbeat"));

        let record = registry.get(&agent_id("a")).expect("agent");
        assert_eq!(record.health(), Health::Degraded);
        assert!((record.load_avg() - 0.7).abs() < f64::EPSILON);
        assert_eq!(record.last_heartbeat(), Duration::from_secs(30));

        assert!(
            !registry
                .heartbeat(&agent_id("ghost"), &HeartbeatUpdate::touch())
                .expect("no-op heartbeat")
        );
    }

    #[test]
    fn heartbeat_rejects_non_finite_load() {
        let (_, registry) = registry_at(0);
        registry.upsert(registration("a", &["dns"]));

        let update = HeartbeatUpdate::touch().with_load_avg(f64::INFINITY);
        let err = registry
            .heartbeat(&agent_id("a"), &update)
            .expect_err("infinite load");
        assert!(matches!(
            err,
            afcp_primitives::Error::InvalidInput { .. }
        ));
    }

    #[test]
    fn list_filters_by_capability_and_health() {
        let (_, registry) = registry_at(0);
        registry.upsert(registration("a", &["dns"]));
        registry.upsert(registration("b", &["dns", "dhcp"]));
        registry
            .heartbeat(
                &agent_id("a"),
                &HeartbeatUpdate::touch().with_health(Health::Offline),
            )
            .expect("heartbeat");

        let dns = registry.list(&ListFilter::default().with_capability(capability("dns")));
        assert_eq!(dns.len(), 2);

        let healthy_dns = registry.list(
            &ListFilter::default()
                .with_capability(capability("dns"))
                .with_health(Health::Active),
        );
        assert_eq!(healthy_dns.len(), 1);
        assert_eq!(healthy_dns[0].id().as_str(), "b");
    }

    #[test]
    fn candidates_respect_health_requirement() {
        let (_, registry) = registry_at(0);
        registry.upsert(registration("a", &["x"]));
        registry.upsert(registration("b", &["x"]));
        registry
            .heartbeat(
                &agent_id("a"),
                &HeartbeatUpdate::touch().with_health(Health::Degraded),
            )
            .expect("heartbeat");

        assert_eq!(registry.candidates(&capability("x"), false).len(), 2);
        let healthy = registry.candidates(&capability("x"), true);
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].id().as_str(), "b");
    }

    #[test]
    fn failure_feedback_never_upgrades_offline() {
        let (_, registry) = registry_at(0);
        registry.upsert(registration("a", &["x"]));
        registry
            .heartbeat(
                &agent_id("a"),
                &HeartbeatUpdate::touch().with_health(Health::Offline),
            )
            .expect("heartbeat");

        registry.record_failure(&agent_id("a"));
        let record = registry.get(&agent_id("a")).expect("agent");
        assert_eq!(record.health(), Health::Offline);
        assert!((record.load_avg() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn success_and_failure_feedback_stay_clamped() {
        let (_, registry) = registry_at(0);
        let reg = AgentRegistration::builder(agent_id("a"))
            .endpoint("e")
            .capability(capability("x"))
            .load_avg(0.95)
            .expect("load")
            .build()
            .expect("registration");
        registry.upsert(reg);

        registry.record_failure(&agent_id("a"));
        assert!(
            (registry.get(&agent_id("a")).expect("agent").load_avg() - 1.0).abs() < f64::EPSILON
        );

        registry.record_success(&agent_id("a"), 0.9);
        assert!(
            (registry.get(&agent_id("a")).expect("agent").load_avg() - 0.9).abs() < 1e-9
        );
    }

    #[test]
    fn tick_ages_out_stale_agents_and_decays_load() {
        let (clock, registry) = registry_at(0);
        let reg = AgentRegistration::builder(agent_id("a"))
            .endpoint("e")
            .capability(capability("x"))
            .load_avg(0.5)
            .expect("load")
            .build()
            .expect("registration");
        registry.upsert(reg);
        registry.upsert(registration("b", &["x"]));

        clock.set(Duration::from_secs(90));
        registry
            .heartbeat(&agent_id("b"), &HeartbeatUpdate::touch())
            .expect("heartbeat");

        let policy = TickPolicy {
            offline_threshold: Duration::from_secs(60),
            decay_factor: 0.98,
            decay_bias: -0.01,
        };
        let summary = registry.tick(&policy);

        assert_eq!(summary.went_offline, 1);
        assert_eq!(summary.offline, 1);
        assert_eq!(summary.active, 1);

        let record = registry.get(&agent_id("a")).expect("agent");
        assert_eq!(record.health(), Health::Offline);
        assert!((record.load_avg() - 0.48).abs() < 1e-9);

        // A later heartbeat restores the agent.
        registry
            .heartbeat(
                &agent_id("a"),
                &HeartbeatUpdate::touch().with_health(Health::Active),
            )
            .expect("heartbeat");
        assert_eq!(
            registry.get(&agent_id("a")).expect("agent").health(),
            Health::Active
        );
    }

    #[test]
    fn tick_decay_floors_at_zero() {
        let (_, registry) = registry_at(0);
        registry.upsert(registration("a", &["x"]));

        let policy = TickPolicy {
            offline_threshold: Duration::from_secs(60),
            decay_factor: 0.98,
            decay_bias: -0.01,
        };
        let summary = registry.tick(&policy);
        assert_eq!(summary.load_values, vec![0.0]);
    }
}
