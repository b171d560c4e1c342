//! Single-request dispatch pipeline.

use std::sync::Arc;
use std::time::Duration;

use afcp_admission::{AdmissionController, RejectReason};
use afcp_metrics::{FederationMetrics, RouteOutcome};
use afcp_primitives::{Capability, Clock, Error, Result};
use afcp_registry::Registry;
use afcp_transport::{Transport, TransportError};
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::selector::{SelectOptions, Selector};

/// Client key used when the caller does not identify itself.
pub const ANONYMOUS_CLIENT: &str = "anonymous";

/// Multiplicative load reward applied after a successful dispatch.
const SUCCESS_REWARD: f64 = 0.9;

/// Options for a single routed request.
#[derive(Clone, Debug, Default)]
pub struct RouteOptions {
    selection: SelectOptions,
    timeout: Option<Duration>,
}

impl RouteOptions {
    /// Replaces the selection options.
    #[must_use]
    pub fn with_selection(mut self, selection: SelectOptions) -> Self {
        self.selection = selection;
        self
    }

    /// Overrides the default route deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Returns the selection options.
    #[must_use]
    pub const fn selection(&self) -> &SelectOptions {
        &self.selection
    }

    /// Returns the deadline override, when set.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Routes one request to one agent and feeds the outcome back into load.
///
/// The dispatcher never retries on another agent; retry policy belongs to
/// the caller.
pub struct Dispatcher {
    registry: Arc<Registry>,
    selector: Selector,
    admission: Arc<AdmissionController>,
    transport: Arc<dyn Transport>,
    metrics: Arc<FederationMetrics>,
    clock: Arc<dyn Clock>,
    default_timeout: Duration,
}

impl Dispatcher {
    /// Wires a dispatcher over the shared control-plane collaborators.
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        admission: Arc<AdmissionController>,
        transport: Arc<dyn Transport>,
        metrics: Arc<FederationMetrics>,
        clock: Arc<dyn Clock>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            selector: Selector::new(Arc::clone(&registry)),
            registry,
            admission,
            transport,
            metrics,
            clock,
            default_timeout,
        }
    }

    /// Dispatches `payload` to the best agent for `capability`.
    ///
    /// Admission is checked first under `client_id` (or the anonymous key),
    /// then an agent is selected and the transport invoked under the route
    /// deadline. Success decays the agent's load; timeouts and transport
    /// failures penalize it and degrade active agents. Cancellation aborts
    /// before any feedback mutation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RateLimited`], [`Error::NoAgentAvailable`],
    /// [`Error::Timeout`], [`Error::AgentError`], or [`Error::Cancelled`].
    pub async fn dispatch(
        &self,
        capability: &Capability,
        payload: Bytes,
        opts: &RouteOptions,
        client_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let label = capability.as_str();

        if cancel.is_cancelled() {
            self.metrics.record_route(label, RouteOutcome::Cancelled);
            return Err(Error::Cancelled);
        }

        let client = client_id.unwrap_or(ANONYMOUS_CLIENT);
        let admission = self.admission.check(client);
        if !admission.allowed {
            let reason = admission
                .reason
                .map_or("window", RejectReason::as_label);
            self.metrics.record_admission_rejection(reason);
            self.metrics.record_route(label, RouteOutcome::RateLimited);
            return Err(Error::RateLimited {
                retry_after: admission.retry_after.unwrap_or(Duration::from_secs(1)),
            });
        }

        let Some(agent) = self.selector.select(capability, opts.selection()) else {
            self.metrics.record_route(label, RouteOutcome::NoAgent);
            return Err(Error::NoAgentAvailable {
                capability: label.to_owned(),
            });
        };
        debug!(agent_id = %agent.id(), capability = label, "agent selected");

        let deadline = opts.timeout().unwrap_or(self.default_timeout);
        let started = self.clock.now();
        let send = self
            .transport
            .send(agent.endpoint(), capability, payload, deadline, cancel);

        let completed = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            result = tokio::time::timeout(deadline, send) => Some(result),
        };

        // A cancelled call must not reach the feedback step.
        let Some(result) = completed.filter(|_| !cancel.is_cancelled()) else {
            self.metrics.record_route(label, RouteOutcome::Cancelled);
            return Err(Error::Cancelled);
        };

        let elapsed = self.clock.now().saturating_sub(started);
        self.metrics
            .record_route_latency(label, elapsed.as_secs_f64());

        match result {
            Ok(Ok(bytes)) => {
                self.registry.record_success(agent.id(), SUCCESS_REWARD);
                self.metrics.record_route(label, RouteOutcome::Ok);
                Ok(bytes)
            }
            Err(_) | Ok(Err(TransportError::Timeout)) => {
                self.registry.record_failure(agent.id());
                self.metrics.record_route(label, RouteOutcome::Timeout);
                Err(Error::Timeout { deadline })
            }
            Ok(Err(err)) => {
                self.registry.record_failure(agent.id());
                self.metrics.record_route(label, RouteOutcome::AgentError);
                Err(Error::agent_error(agent.id().as_str(), err.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use afcp_admission::AdmissionConfig;
    use afcp_metrics::default_latency_buckets;
    use afcp_primitives::{
        AgentId, AgentRegistration, Health, HeartbeatUpdate, ManualClock,
    };
    use afcp_transport::TransportResult;
    use async_trait::async_trait;

    enum Reply {
        Ok(&'static [u8]),
        Refuse(&'static str),
        Hang,
    }

    struct ScriptedTransport {
        replies: HashMap<String, Reply>,
    }

    impl ScriptedTransport {
        fn new(replies: impl IntoIterator<Item = (&'static str, Reply)>) -> Arc<Self> {
            Arc::new(Self {
                replies: replies
                    .into_iter()
                    .map(|(endpoint, reply)| (endpoint.to_owned(), reply))
                    .collect(),
            })
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(
            &self,
            endpoint: &str,
            _capability: &Capability,
            _payload: Bytes,
            _deadline: Duration,
            cancel: &CancellationToken,
        ) -> TransportResult<Bytes> {
            match self.replies.get(endpoint) {
                Some(Reply::Ok(bytes)) => Ok(Bytes::from_static(bytes)),
                Some(Reply::Refuse(reason)) => Err(TransportError::refused(*reason)),
                Some(Reply::Hang) | None => {
                    cancel.cancelled().await;
                    Err(TransportError::unknown("cancelled"))
                }
            }
        }
    }

    struct Fixture {
        registry: Arc<Registry>,
        dispatcher: Dispatcher,
        metrics: Arc<FederationMetrics>,
    }

    fn fixture(transport: Arc<dyn Transport>, admission: AdmissionConfig) -> Fixture {
        let clock = Arc::new(ManualClock::new(Duration::ZERO)) as Arc<dyn Clock>;
        let registry = Arc::new(Registry::new(Arc::clone(&clock)));
        let metrics =
            Arc::new(FederationMetrics::new(default_latency_buckets()).expect("metrics"));
        let admission = Arc::new(
            AdmissionController::new(admission, Arc::clone(&clock)).expect("admission"),
        );
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            admission,
            transport,
            Arc::clone(&metrics),
            clock,
            Duration::from_secs(30),
        );
        Fixture {
            registry,
            dispatcher,
            metrics,
        }
    }

    fn capability(name: &str) -> Capability {
        Capability::new(name).expect("capability")
    }

    fn agent_id(name: &str) -> AgentId {
        AgentId::new(name).expect("id")
    }

    fn register(registry: &Registry, id: &str, caps: &[&str], load: f64) {
        let registration = AgentRegistration::builder(agent_id(id))
            .endpoint(format!("{id}.lab:9000"))
            .capabilities(caps.iter().map(|c| capability(c)))
            .load_avg(load)
            .expect("load")
            .build()
            .expect("registration");
        registry.upsert(registration);
    }

    #[tokio::test]
    async fn success_returns_bytes_and_decays_load() {
        let transport = ScriptedTransport::new([("a.lab:9000", Reply::Ok(b"pong"))]);
        let fx = fixture(transport, AdmissionConfig::default());
        register(&fx.registry, "a", &["ping"], 0.5);

        let reply = fx
            .dispatcher
            .dispatch(
                &capability("ping"),
                Bytes::from_static(b"ping"),
                &RouteOptions::default(),
                None,
                &CancellationToken::new(),
            )
            .await
            .expect("dispatch");

        assert_eq!(reply, Bytes::from_static(b"pong"));
        let record = fx.registry.get(&agent_id("a")).expect("agent");
        assert!((record.load_avg() - 0.45).abs() < 1e-9);
        assert_eq!(record.health(), Health::Active);
        assert_eq!(fx.metrics.route_count("ping", RouteOutcome::Ok), 1);
    }

    #[tokio::test]
    async fn transport_failure_penalizes_and_degrades() {
        let transport = ScriptedTransport::new([("a.lab:9000", Reply::Refuse("maintenance"))]);
        let fx = fixture(transport, AdmissionConfig::default());
        register(&fx.registry, "a", &["ping"], 0.5);

        let err = fx
            .dispatcher
            .dispatch(
                &capability("ping"),
                Bytes::new(),
                &RouteOptions::default(),
                Some("u1"),
                &CancellationToken::new(),
            )
            .await
            .expect_err("failure");

        match err {
            Error::AgentError { agent_id, reason } => {
                assert_eq!(agent_id, "a");
                assert!(reason.contains("maintenance"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let record = fx.registry.get(&agent_id("a")).expect("agent");
        assert!((record.load_avg() - 0.7).abs() < 1e-9);
        assert_eq!(record.health(), Health::Degraded);
        assert_eq!(fx.metrics.route_count("ping", RouteOutcome::AgentError), 1);
    }

    #[tokio::test]
    async fn failure_does_not_upgrade_offline_agents() {
        let transport = ScriptedTransport::new([("a.lab:9000", Reply::Refuse("down"))]);
        let fx = fixture(transport, AdmissionConfig::default());
        register(&fx.registry, "a", &["ping"], 0.0);
        fx.registry
            .heartbeat(
                &agent_id("a"),
                &HeartbeatUpdate::touch().with_health(Health::Offline),
            )
            .expect("heartbeat");

        let opts = RouteOptions::default()
            .with_selection(SelectOptions::default().with_require_healthy(false));
        fx.dispatcher
            .dispatch(
                &capability("ping"),
                Bytes::new(),
                &opts,
                None,
                &CancellationToken::new(),
            )
            .await
            .expect_err("failure");

        assert_eq!(
            fx.registry.get(&agent_id("a")).expect("agent").health(),
            Health::Offline
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_elapses_into_timeout_with_penalty() {
        let transport = ScriptedTransport::new([("a.lab:9000", Reply::Hang)]);
        let fx = fixture(transport, AdmissionConfig::default());
        register(&fx.registry, "a", &["ping"], 0.1);

        let opts = RouteOptions::default().with_timeout(Duration::from_millis(50));
        let err = fx
            .dispatcher
            .dispatch(
                &capability("ping"),
                Bytes::new(),
                &opts,
                None,
                &CancellationToken::new(),
            )
            .await
            .expect_err("timeout");

        assert!(matches!(err, Error::Timeout { .. }));
        let record = fx.registry.get(&agent_id("a")).expect("agent");
        assert!((record.load_avg() - 0.3).abs() < 1e-9);
        assert_eq!(record.health(), Health::Degraded);
        assert_eq!(fx.metrics.route_count("ping", RouteOutcome::Timeout), 1);
    }

    #[tokio::test]
    async fn missing_capability_is_no_agent() {
        let transport = ScriptedTransport::new(std::iter::empty());
        let fx = fixture(transport, AdmissionConfig::default());

        let err = fx
            .dispatcher
            .dispatch(
                &capability("ghost"),
                Bytes::new(),
                &RouteOptions::default(),
                None,
                &CancellationToken::new(),
            )
            .await
            .expect_err("no agent");

        assert!(matches!(err, Error::NoAgentAvailable { .. }));
        assert_eq!(fx.metrics.route_count("ghost", RouteOutcome::NoAgent), 1);
    }

    #[tokio::test]
    async fn admission_rejection_maps_to_rate_limited() {
        let transport = ScriptedTransport::new([("a.lab:9000", Reply::Ok(b"ok"))]);
        let config = AdmissionConfig {
            window_length: Duration::from_secs(1),
            max_requests: 1,
            burst: 1,
        };
        let fx = fixture(transport, config);
        register(&fx.registry, "a", &["ping"], 0.0);

        fx.dispatcher
            .dispatch(
                &capability("ping"),
                Bytes::new(),
                &RouteOptions::default(),
                Some("u1"),
                &CancellationToken::new(),
            )
            .await
            .expect("first call admitted");

        let err = fx
            .dispatcher
            .dispatch(
                &capability("ping"),
                Bytes::new(),
                &RouteOptions::default(),
                Some("u1"),
                &CancellationToken::new(),
            )
            .await
            .expect_err("second call limited");

        match err {
            Error::RateLimited { retry_after } => {
                assert!(retry_after >= Duration::from_secs(1));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(fx.metrics.route_count("ping", RouteOutcome::RateLimited), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_skips_feedback() {
        let transport = ScriptedTransport::new([("a.lab:9000", Reply::Hang)]);
        let fx = fixture(transport, AdmissionConfig::default());
        register(&fx.registry, "a", &["ping"], 0.4);

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            canceller.cancel();
        });

        let err = fx
            .dispatcher
            .dispatch(
                &capability("ping"),
                Bytes::new(),
                &RouteOptions::default(),
                None,
                &cancel,
            )
            .await
            .expect_err("cancelled");

        assert!(matches!(err, Error::Cancelled));
        let record = fx.registry.get(&agent_id("a")).expect("agent");
        assert!((record.load_avg() - 0.4).abs() < 1e-9);
        assert_eq!(record.health(), Health::Active);
        assert_eq!(fx.metrics.route_count("ping", RouteOutcome::Cancelled), 1);
    }

    #[tokio::test]
    async fn pre_cancelled_token_short_circuits() {
        let transport = ScriptedTransport::new([("a.lab:9000", Reply::Ok(b"ok"))]);
        let fx = fixture(transport, AdmissionConfig::default());
        register(&fx.registry, "a", &["ping"], 0.4);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = fx
            .dispatcher
            .dispatch(
                &capability("ping"),
                Bytes::new(),
                &RouteOptions::default(),
                None,
                &cancel,
            )
            .await
            .expect_err("cancelled");
        assert!(matches!(err, Error::Cancelled));
    }
}
