//! Quorum fan-out over all agents advertising a capability.

use std::sync::Arc;
use std::time::Duration;

use afcp_metrics::FederationMetrics;
use afcp_primitives::{AgentId, Capability, Error, Result};
use afcp_registry::Registry;
use afcp_transport::{Transport, TransportError};
use bytes::Bytes;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Multiplicative load reward applied per successful consensus sub-call.
const SUCCESS_REWARD: f64 = 0.95;

/// Options for a consensus round.
#[derive(Clone, Copy, Debug)]
pub struct ConsensusOptions {
    quorum: f64,
    timeout: Option<Duration>,
}

impl ConsensusOptions {
    /// Sets the fraction of successful sub-calls that must be exceeded.
    #[must_use]
    pub const fn with_quorum(mut self, quorum: f64) -> Self {
        self.quorum = quorum;
        self
    }

    /// Overrides the default consensus deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Returns the required quorum fraction.
    #[must_use]
    pub const fn quorum(&self) -> f64 {
        self.quorum
    }

    /// Returns the deadline override, when set.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl Default for ConsensusOptions {
    fn default() -> Self {
        Self {
            quorum: 0.5,
            timeout: None,
        }
    }
}

/// Terminal state of one consensus sub-call.
#[derive(Clone, Debug)]
pub struct AgentDecision {
    /// Agent the proposal was sent to.
    pub agent_id: AgentId,
    /// Whether the agent answered before the deadline.
    pub ok: bool,
    /// Response bytes on success.
    pub value: Option<Bytes>,
    /// Failure description otherwise.
    pub error: Option<String>,
}

/// Result of a consensus round.
#[derive(Clone, Debug)]
pub struct ConsensusOutcome {
    /// Whether the success fraction strictly exceeded the quorum.
    pub decided: bool,
    /// Per-agent outcomes, ordered by agent id ascending.
    pub decisions: Vec<AgentDecision>,
}

enum SubOutcome {
    Ok(Bytes),
    TimedOut,
    Failed(String),
    Cancelled,
}

/// Fans a proposal out to every eligible agent and decides by fraction.
pub struct QuorumEngine {
    registry: Arc<Registry>,
    transport: Arc<dyn Transport>,
    metrics: Arc<FederationMetrics>,
    default_timeout: Duration,
}

impl QuorumEngine {
    /// Wires a quorum engine over the shared control-plane collaborators.
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        transport: Arc<dyn Transport>,
        metrics: Arc<FederationMetrics>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            transport,
            metrics,
            default_timeout,
        }
    }

    /// Runs one consensus round for `capability`.
    ///
    /// The candidate set is snapshotted up front (active agents, sorted by
    /// id) and every candidate is called in parallel under one deadline. The
    /// round never returns early: the decision requires every candidate's
    /// terminal state. Cancellation mid-flight resolves the round with
    /// `decided = false` and skips all load feedback; the partial per-agent
    /// outcomes remain inspectable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a quorum outside `[0, 1]` and
    /// [`Error::Cancelled`] when the token was cancelled before fan-out.
    #[allow(clippy::cast_precision_loss)]
    pub async fn consensus(
        &self,
        capability: &Capability,
        proposal: Bytes,
        opts: &ConsensusOptions,
        cancel: &CancellationToken,
    ) -> Result<ConsensusOutcome> {
        let label = capability.as_str();
        let quorum = opts.quorum();
        if !quorum.is_finite() || !(0.0..=1.0).contains(&quorum) {
            return Err(Error::invalid_input("quorum must be a fraction in [0, 1]"));
        }

        if cancel.is_cancelled() {
            self.metrics.record_consensus(label, "cancelled");
            return Err(Error::Cancelled);
        }

        let candidates = self.registry.candidates(capability, true);
        if candidates.is_empty() {
            self.metrics.record_consensus(label, "false");
            return Ok(ConsensusOutcome {
                decided: false,
                decisions: Vec::new(),
            });
        }

        let deadline = opts.timeout().unwrap_or(self.default_timeout);
        let child = cancel.child_token();

        let calls = candidates.iter().map(|agent| {
            let child = child.clone();
            let proposal = proposal.clone();
            async move {
                let send = self
                    .transport
                    .send(agent.endpoint(), capability, proposal, deadline, &child);
                tokio::select! {
                    biased;
                    () = child.cancelled() => SubOutcome::Cancelled,
                    result = tokio::time::timeout(deadline, send) => match result {
                        Err(_) | Ok(Err(TransportError::Timeout)) => SubOutcome::TimedOut,
                        Ok(Ok(bytes)) => SubOutcome::Ok(bytes),
                        Ok(Err(err)) => SubOutcome::Failed(err.to_string()),
                    },
                }
            }
        });
        let results = join_all(calls).await;

        let cancelled = cancel.is_cancelled();
        let mut ok_count = 0usize;
        let mut decisions = Vec::with_capacity(candidates.len());

        for (agent, outcome) in candidates.iter().zip(results) {
            let decision = match outcome {
                SubOutcome::Ok(bytes) => {
                    ok_count += 1;
                    if !cancelled {
                        self.registry.record_success(agent.id(), SUCCESS_REWARD);
                    }
                    AgentDecision {
                        agent_id: agent.id().clone(),
                        ok: true,
                        value: Some(bytes),
                        error: None,
                    }
                }
                SubOutcome::TimedOut => {
                    if !cancelled {
                        self.registry.record_failure(agent.id());
                    }
                    AgentDecision {
                        agent_id: agent.id().clone(),
                        ok: false,
                        value: None,
                        error: Some("deadline elapsed".to_owned()),
                    }
                }
                SubOutcome::Failed(reason) => {
                    if !cancelled {
                        self.registry.record_failure(agent.id());
                    }
                    AgentDecision {
                        agent_id: agent.id().clone(),
                        ok: false,
                        value: None,
                        error: Some(reason),
                    }
                }
                SubOutcome::Cancelled => AgentDecision {
                    agent_id: agent.id().clone(),
                    ok: false,
                    value: None,
                    error: Some("cancelled".to_owned()),
                },
            };
            decisions.push(decision);
        }

        if cancelled {
            self.metrics.record_consensus(label, "cancelled");
            return Ok(ConsensusOutcome {
                decided: false,
                decisions,
            });
        }

        let decided = (ok_count as f64 / candidates.len() as f64) > quorum;
        debug!(
            capability = label,
            ok_count,
            candidates = candidates.len(),
            quorum,
            decided,
            "consensus round resolved"
        );
        self.metrics
            .record_consensus(label, if decided { "true" } else { "false" });

        Ok(ConsensusOutcome { decided, decisions })
    }
}
