//! Transport abstraction between the control plane and remote agents.
//!
//! The control plane never dials agents itself; it hands
//! `(endpoint, capability, payload, deadline)` to a [`Transport`]
//! implementation and receives bytes or a typed error back. Concrete
//! transports (HTTP, mTLS, gRPC) live outside this workspace.

#![warn(missing_docs, clippy::pedantic)]

use std::time::Duration;

use afcp_primitives::Capability;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors a transport may surface for a single send.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The deadline elapsed before the agent answered.
    #[error("transport deadline elapsed")]
    Timeout,

    /// The agent actively refused the request.
    #[error("agent refused request: {reason}")]
    Refused {
        /// Context supplied by the transport.
        reason: String,
    },

    /// The exchange violated the wire protocol.
    #[error("protocol error: {reason}")]
    Protocol {
        /// Context supplied by the transport.
        reason: String,
    },

    /// Any other transport-level failure.
    #[error("transport error: {reason}")]
    Unknown {
        /// Context supplied by the transport.
        reason: String,
    },
}

impl TransportError {
    /// Convenience constructor for refusals.
    #[must_use]
    pub fn refused(reason: impl Into<String>) -> Self {
        Self::Refused {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for protocol violations.
    #[must_use]
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for unclassified failures.
    #[must_use]
    pub fn unknown(reason: impl Into<String>) -> Self {
        Self::Unknown {
            reason: reason.into(),
        }
    }

    /// Returns `true` for deadline failures.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// A concurrency-safe channel to remote agents.
///
/// Implementations must honor both the deadline and the cancellation token:
/// once `cancel` fires, in-flight work should be abandoned promptly and an
/// error returned. The control plane treats the endpoint as opaque.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `payload` for `capability` to the agent at `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] when the exchange fails or the deadline
    /// elapses before a response arrives.
    async fn send(
        &self,
        endpoint: &str,
        capability: &Capability,
        payload: Bytes,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> TransportResult<Bytes>;
}
