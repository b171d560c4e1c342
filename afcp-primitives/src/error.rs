//! Typed error kinds surfaced by the federation control plane.

use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the federation crates.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the control plane public API.
///
/// Component-level failures bubble to callers unchanged; the dispatcher and
/// quorum engine convert raw transport errors into these kinds after load
/// feedback has been applied.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed agent record, heartbeat update, or configuration value.
    #[error("invalid input: {reason}")]
    InvalidInput {
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// The referenced agent id is not present in the registry.
    #[error("unknown agent `{id}`")]
    UnknownAgent {
        /// The id that failed to resolve.
        id: String,
    },

    /// The candidate set was empty after capability and health filters.
    #[error("no agent available for capability `{capability}`")]
    NoAgentAvailable {
        /// The capability that had no eligible agents.
        capability: String,
    },

    /// Admission control denied the request.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited {
        /// Suggested delay before the client retries.
        retry_after: Duration,
    },

    /// The deadline elapsed before the agent responded.
    #[error("deadline of {deadline:?} elapsed")]
    Timeout {
        /// The deadline that was exceeded.
        deadline: Duration,
    },

    /// The transport reported a failure from the selected agent.
    #[error("agent `{agent_id}` failed: {reason}")]
    AgentError {
        /// Id of the failing agent.
        agent_id: String,
        /// Transport-level failure description.
        reason: String,
    },

    /// The caller cancelled the operation before completion.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Convenience constructor for input validation failures.
    #[must_use]
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for agent-side failures.
    #[must_use]
    pub fn agent_error(agent_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::AgentError {
            agent_id: agent_id.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` when the error indicates the caller should retry later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Timeout { .. } | Self::NoAgentAvailable { .. }
        )
    }
}
