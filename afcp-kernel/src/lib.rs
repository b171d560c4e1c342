//! Control-plane kernel for the agent federation.
//!
//! [`ControlPlane`] wires the registry, admission controller, selector,
//! dispatcher, quorum engine, metrics exporter, and health monitor behind
//! the seven public operations: register, deregister, heartbeat, list,
//! route, consensus, and metrics. Construction is explicit: the kernel takes
//! a validated configuration, a transport, and a clock, and holds no
//! process-global state.

#![warn(missing_docs, clippy::pedantic)]

mod config;
mod monitor;

use std::sync::{Arc, Mutex};

use afcp_admission::AdmissionController;
use afcp_metrics::{FederationMetrics, FleetStats};
use afcp_primitives::{
    AgentId, AgentRecord, AgentRegistration, Capability, Clock, Error, Health, HeartbeatUpdate,
    Result, SystemClock,
};
use afcp_registry::{ListFilter, Registry};
use afcp_routing::{ConsensusOptions, ConsensusOutcome, Dispatcher, QuorumEngine, RouteOptions};
use afcp_transport::Transport;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use config::{ConfigError, ConfigResult, FederationConfig, HealthConfig, MetricsConfig};

use monitor::HealthMonitor;

/// The federation control plane.
///
/// One instance owns the full in-memory state for a federation: the agent
/// registry with its capability index, per-client admission records, and the
/// metric families. All operations are safe under concurrent callers.
pub struct ControlPlane {
    config: FederationConfig,
    clock: Arc<dyn Clock>,
    registry: Arc<Registry>,
    admission: Arc<AdmissionController>,
    dispatcher: Dispatcher,
    quorum: QuorumEngine,
    metrics: Arc<FederationMetrics>,
    monitor: Mutex<Option<HealthMonitor>>,
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane").finish_non_exhaustive()
    }
}

impl ControlPlane {
    /// Builds a control plane from its three explicit inputs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when the configuration fails
    /// validation.
    pub fn new(
        config: FederationConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|err| Error::invalid_input(err.to_string()))?;

        let metrics = Arc::new(
            FederationMetrics::new(config.metrics.histogram_buckets.clone())
                .map_err(|err| Error::invalid_input(err.to_string()))?,
        );
        let registry = Arc::new(Registry::new(Arc::clone(&clock)));
        let admission = Arc::new(
            AdmissionController::new(config.admission, Arc::clone(&clock))
                .map_err(|err| Error::invalid_input(err.to_string()))?,
        );

        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&admission),
            Arc::clone(&transport),
            Arc::clone(&metrics),
            Arc::clone(&clock),
            config.route_timeout,
        );
        let quorum = QuorumEngine::new(
            Arc::clone(&registry),
            transport,
            Arc::clone(&metrics),
            config.consensus_timeout,
        );

        Ok(Self {
            config,
            clock,
            registry,
            admission,
            dispatcher,
            quorum,
            metrics,
            monitor: Mutex::new(None),
        })
    }

    /// Builds a control plane on the production clock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when the configuration fails
    /// validation.
    pub fn with_system_clock(
        config: FederationConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        Self::new(config, transport, Arc::new(SystemClock::new()))
    }

    /// Registers an agent or updates its existing record.
    ///
    /// Returns `true` when the agent was newly inserted. The operation is
    /// idempotent: repeating an identical registration changes nothing
    /// observable.
    pub fn register(&self, registration: AgentRegistration) -> bool {
        let inserted = self.registry.upsert(registration);
        if inserted {
            info!(agents = self.registry.len(), "agent registered");
        }
        inserted
    }

    /// Removes an agent. Returns whether it was present.
    pub fn deregister(&self, id: &AgentId) -> bool {
        let removed = self.registry.remove(id);
        if removed {
            info!(agent_id = %id, "agent deregistered");
        }
        removed
    }

    /// Refreshes an agent's heartbeat, optionally updating health and load.
    ///
    /// Returns `Ok(false)` when the id is unknown; stale workers may
    /// heartbeat after removal without that being an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when the update carries a NaN or
    /// infinite load average.
    pub fn heartbeat(&self, id: &AgentId, update: &HeartbeatUpdate) -> Result<bool> {
        self.registry.heartbeat(id, update)
    }

    /// Returns a snapshot of agents matching `filter`, sorted by id.
    #[must_use]
    pub fn list(&self, filter: &ListFilter) -> Vec<AgentRecord> {
        self.registry.list(filter)
    }

    /// Returns the record for a single agent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownAgent`] when the id is not registered.
    pub fn agent(&self, id: &AgentId) -> Result<AgentRecord> {
        self.registry.get(id).ok_or_else(|| Error::UnknownAgent {
            id: id.to_string(),
        })
    }

    /// Routes one payload to the best agent for `capability`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RateLimited`], [`Error::NoAgentAvailable`],
    /// [`Error::Timeout`], [`Error::AgentError`], or [`Error::Cancelled`].
    pub async fn route(
        &self,
        capability: &Capability,
        payload: Bytes,
        opts: &RouteOptions,
        client_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        self.dispatcher
            .dispatch(capability, payload, opts, client_id, cancel)
            .await
    }

    /// Runs a consensus round across every active agent for `capability`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an out-of-range quorum or
    /// [`Error::Cancelled`] when the token was cancelled before fan-out.
    pub async fn consensus(
        &self,
        capability: &Capability,
        proposal: Bytes,
        opts: &ConsensusOptions,
        cancel: &CancellationToken,
    ) -> Result<ConsensusOutcome> {
        self.quorum
            .consensus(capability, proposal, opts, cancel)
            .await
    }

    /// Renders the OpenMetrics payload for the current state.
    #[must_use]
    pub fn render_metrics(&self) -> String {
        let agents = self.registry.list(&ListFilter::default());
        let mut fleet = FleetStats {
            capabilities: self.registry.capability_count(),
            ..FleetStats::default()
        };
        for agent in &agents {
            match agent.health() {
                Health::Active => fleet.active += 1,
                Health::Degraded => fleet.degraded += 1,
                Health::Offline => fleet.offline += 1,
            }
            fleet
                .agent_loads
                .push((agent.id().to_string(), agent.load_avg()));
        }
        self.metrics.render(&fleet)
    }

    /// Starts the background health monitor; a no-op when already running.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime, or if the monitor slot
    /// lock has been poisoned.
    pub fn start_monitor(&self) {
        let mut slot = self.monitor.lock().expect("monitor slot poisoned");
        if slot.is_some() {
            return;
        }
        *slot = Some(HealthMonitor::spawn(
            Arc::clone(&self.registry),
            Arc::clone(&self.admission),
            Arc::clone(&self.metrics),
            Arc::clone(&self.clock),
            self.config.health,
            self.config.admission.window_length,
        ));
        info!(
            tick_interval = ?self.config.health.tick_interval,
            "health monitor started"
        );
    }

    /// Stops the background health monitor; a no-op when not running.
    ///
    /// # Panics
    ///
    /// Panics if the monitor slot lock has been poisoned.
    pub fn shutdown(&self) {
        let mut slot = self.monitor.lock().expect("monitor slot poisoned");
        if let Some(mut monitor) = slot.take() {
            monitor.stop();
            info!("health monitor stopped");
        }
    }

    /// Returns the validated configuration.
    #[must_use]
    pub const fn config(&self) -> &FederationConfig {
        &self.config
    }

    /// Returns the shared registry, for maintenance and tests.
    #[must_use]
    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Returns the shared admission controller, for maintenance and tests.
    #[must_use]
    pub const fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use afcp_primitives::ManualClock;
    use afcp_transport::{TransportError, TransportResult};
    use async_trait::async_trait;

    struct EchoTransport;

    #[async_trait]
    impl Transport for EchoTransport {
        async fn send(
            &self,
            _endpoint: &str,
            _capability: &Capability,
            payload: Bytes,
            _deadline: Duration,
            _cancel: &CancellationToken,
        ) -> TransportResult<Bytes> {
            if payload.is_empty() {
                return Err(TransportError::protocol("empty payload"));
            }
            Ok(payload)
        }
    }

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

    fn plane() -> (Arc<ManualClock>, ControlPlane) {
        let clock = Arc::new(ManualClock::new(Duration::ZERO));
        let plane = ControlPlane::new(
            FederationConfig::default(),
            Arc::new(EchoTransport),
            Arc::clone(&clock) as Arc<dyn Clock>,
        )
        .expect("plane");
        (clock, plane)
    }

    #[test]
    fn rejects_invalid_configuration() {
        let config = FederationConfig {
            route_timeout: Duration::ZERO,
            ..FederationConfig::default()
        };
        let err = ControlPlane::new(
            config,
            Arc::new(EchoTransport),
            Arc::new(ManualClock::default()),
        )
        .expect_err("invalid config");
        assert!(matches!(err, Error::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn register_route_and_observe() {
        let (_, plane) = plane();
        assert!(plane.register(registration("a", &["echo"])));
        assert!(!plane.register(registration("a", &["echo"])));

        let reply = plane
            .route(
                &capability("echo"),
                Bytes::from_static(b"hello"),
                &RouteOptions::default(),
                Some("client-1"),
                &CancellationToken::new(),
            )
            .await
            .expect("route");
        assert_eq!(reply, Bytes::from_static(b"hello"));

        let payload = plane.render_metrics();
        assert!(payload.contains("afcp_agents_total{health=\"active\"} 1"));
        assert!(payload.contains("afcp_route_requests_total{capability=\"echo\",outcome=\"ok\"} 1"));
        assert!(payload.ends_with("# EOF\n"));
    }

    #[tokio::test]
    async fn deregister_twice_reports_presence() {
        let (_, plane) = plane();
        plane.register(registration("a", &["echo"]));
        assert!(plane.deregister(&agent_id("a")));
        assert!(!plane.deregister(&agent_id("a")));

        let err = plane.agent(&agent_id("a")).expect_err("gone");
        assert!(matches!(err, Error::UnknownAgent { .. }));
    }

    #[tokio::test]
    async fn heartbeat_restores_offline_agent() {
        let (clock, plane) = plane();
        plane.register(registration("a", &["echo"]));

        clock.advance(Duration::from_secs(90));
        let summary = plane.registry().tick(&afcp_registry::TickPolicy {
            offline_threshold: Duration::from_secs(60),
            decay_factor: 0.98,
            decay_bias: -0.01,
        });
        assert_eq!(summary.went_offline, 1);

        let restored = plane
            .heartbeat(
                &agent_id("a"),
                &HeartbeatUpdate::touch().with_health(Health::Active),
            )
            .expect("heartbeat");
        assert!(restored);
        assert_eq!(
            plane.registry().get(&agent_id("a")).expect("agent").health(),
            Health::Active
        );
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_lifecycle_ticks_in_background() {
        let config = FederationConfig {
            health: HealthConfig {
                tick_interval: Duration::from_millis(10),
                ..HealthConfig::default()
            },
            ..FederationConfig::default()
        };
        let clock = Arc::new(ManualClock::new(Duration::from_secs(90)));
        let plane = ControlPlane::new(
            config,
            Arc::new(EchoTransport),
            Arc::clone(&clock) as Arc<dyn Clock>,
        )
        .expect("plane");

        // The heartbeat is 90 seconds older than the manual clock reading.
        let stale = AgentRegistration::builder(agent_id("a"))
            .endpoint("a.lab:9000")
            .capability(capability("echo"))
            .last_heartbeat(Duration::ZERO)
            .build()
            .expect("registration");
        plane.register(stale);

        plane.start_monitor();
        plane.start_monitor(); // second call is a no-op
        tokio::time::sleep(Duration::from_millis(50)).await;
        plane.shutdown();

        assert_eq!(
            plane.registry().get(&agent_id("a")).expect("agent").health(),
            Health::Offline
        );
        let payload = plane.render_metrics();
        assert!(payload.contains("afcp_agents_total{health=\"offline\"} 1"));
        assert!(payload.contains("afcp_health_tick_load_avg_count"));
    }
}
