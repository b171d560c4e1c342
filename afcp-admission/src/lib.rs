//! Per-client admission control.
//!
//! Each client is tracked by a record combining a sliding fixed-size window
//! with a token bucket. Records are sharded by hashed client id to keep lock
//! contention low; only the hash is ever stored, so raw client identifiers
//! never live in memory longer than the call that carries them.

#![warn(missing_docs, clippy::pedantic)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use afcp_primitives::{Clock, stable_hash};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

const SHARD_COUNT: usize = 16;

/// Result alias for admission operations.
pub type AdmissionResult<T> = Result<T, AdmissionError>;

/// Errors surfaced by admission configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    /// Configuration failed validation.
    #[error("invalid admission configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Limits applied per client.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdmissionConfig {
    /// Length of the sliding window.
    pub window_length: Duration,
    /// Maximum admitted requests per window.
    pub max_requests: u32,
    /// Token-bucket capacity; bounds instantaneous bursts.
    pub burst: u32,
}

impl AdmissionConfig {
    /// Validates the configured limits.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::InvalidConfig`] when the window is zero or
    /// either limit is zero.
    pub fn validate(self) -> AdmissionResult<()> {
        if self.window_length.is_zero() {
            return Err(AdmissionError::InvalidConfig(
                "window length must be greater than zero",
            ));
        }
        if self.max_requests == 0 {
            return Err(AdmissionError::InvalidConfig(
                "max requests must be greater than zero",
            ));
        }
        if self.burst == 0 {
            return Err(AdmissionError::InvalidConfig(
                "burst must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            window_length: Duration::from_secs(60),
            max_requests: 100,
            burst: 20,
        }
    }
}

/// Why a request was rejected; drives the rejection metrics.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RejectReason {
    /// The sliding window is exhausted.
    Window,
    /// The token bucket is empty.
    Tokens,
}

impl RejectReason {
    /// Returns the metrics label for this reason.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Window => "window",
            Self::Tokens => "tokens",
        }
    }
}

/// Outcome of an admission check.
#[derive(Clone, Copy, Debug)]
pub struct Decision {
    /// Whether the request was admitted.
    pub allowed: bool,
    /// Admissions left in the current window.
    pub remaining: u32,
    /// Monotonic timestamp at which the current window ends.
    pub reset_at: Duration,
    /// Suggested wait before retrying; set only on rejection.
    pub retry_after: Option<Duration>,
    /// Rejection reason; set only on rejection.
    pub reason: Option<RejectReason>,
}

#[derive(Clone, Copy, Debug)]
struct ClientRecord {
    window_start: Duration,
    requests: u32,
    tokens: f64,
    last_refill: Duration,
}

impl ClientRecord {
    fn fresh(now: Duration, burst: u32) -> Self {
        Self {
            window_start: now,
            requests: 0,
            tokens: f64::from(burst),
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Duration, config: &AdmissionConfig) {
        let elapsed = now.saturating_sub(self.last_refill);
        let to_add = (elapsed.as_secs_f64() * f64::from(config.burst)
            / config.window_length.as_secs_f64())
        .floor();
        if to_add > 0.0 {
            self.tokens = (self.tokens + to_add).min(f64::from(config.burst));
            self.last_refill = now;
        }
    }

    fn roll_window(&mut self, now: Duration, config: &AdmissionConfig) {
        if self.window_start + config.window_length <= now {
            self.requests = 0;
            self.window_start = now;
        }
    }
}

/// Sharded sliding-window + token-bucket rate limiter.
pub struct AdmissionController {
    config: AdmissionConfig,
    clock: Arc<dyn Clock>,
    shards: Vec<Mutex<HashMap<u64, ClientRecord>>>,
}

impl AdmissionController {
    /// Creates a controller enforcing `config`.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::InvalidConfig`] when the configuration is
    /// invalid.
    pub fn new(config: AdmissionConfig, clock: Arc<dyn Clock>) -> AdmissionResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            clock,
            shards: (0..SHARD_COUNT)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
        })
    }

    /// Returns the enforced limits.
    #[must_use]
    pub const fn config(&self) -> AdmissionConfig {
        self.config
    }

    fn shard(&self, key: u64) -> &Mutex<HashMap<u64, ClientRecord>> {
        #[allow(clippy::cast_possible_truncation)]
        let idx = (key as usize) % self.shards.len();
        &self.shards[idx]
    }

    fn decide(&self, record: &mut ClientRecord, now: Duration, consume: bool) -> Decision {
        let config = &self.config;
        record.refill(now, config);
        record.roll_window(now, config);

        let window_open = record.requests < config.max_requests;
        let tokens_available = record.tokens >= 1.0;
        let allowed = window_open && tokens_available;

        if allowed && consume {
            record.requests += 1;
            record.tokens -= 1.0;
        }

        let reset_at = record.window_start + config.window_length;
        let (retry_after, reason) = if allowed {
            (None, None)
        } else if window_open {
            // Token exhaustion: wait until one token accrues, at least a second.
            let seconds = ((1.0 - record.tokens) * config.window_length.as_secs_f64()
                / f64::from(config.burst))
            .max(1.0);
            (Some(Duration::from_secs_f64(seconds)), Some(RejectReason::Tokens))
        } else {
            (Some(reset_at.saturating_sub(now)), Some(RejectReason::Window))
        };

        Decision {
            allowed,
            remaining: config.max_requests.saturating_sub(record.requests),
            reset_at,
            retry_after,
            reason,
        }
    }

    /// Checks and, on admission, consumes budget for `client_id`.
    ///
    /// Lazily creates the client record on first observation.
    ///
    /// # Panics
    ///
    /// Panics if the shard lock has been poisoned.
    pub fn check(&self, client_id: &str) -> Decision {
        let now = self.clock.now();
        let key = u64::from(stable_hash(client_id));
        let mut shard = self.shard(key).lock().expect("admission shard poisoned");
        let record = shard
            .entry(key)
            .or_insert_with(|| ClientRecord::fresh(now, self.config.burst));
        self.decide(record, now, true)
    }

    /// Reports the decision `check` would make without consuming budget.
    ///
    /// Never creates a client record.
    ///
    /// # Panics
    ///
    /// Panics if the shard lock has been poisoned.
    #[must_use]
    pub fn peek(&self, client_id: &str) -> Decision {
        let now = self.clock.now();
        let key = u64::from(stable_hash(client_id));
        let shard = self.shard(key).lock().expect("admission shard poisoned");
        let mut record = shard
            .get(&key)
            .copied()
            .unwrap_or_else(|| ClientRecord::fresh(now, self.config.burst));
        self.decide(&mut record, now, false)
    }

    /// Forgets everything known about `client_id`.
    ///
    /// # Panics
    ///
    /// Panics if the shard lock has been poisoned.
    pub fn reset(&self, client_id: &str) {
        let key = u64::from(stable_hash(client_id));
        self.shard(key)
            .lock()
            .expect("admission shard poisoned")
            .remove(&key);
    }

    /// Purges records idle for more than two window lengths.
    ///
    /// Returns the number of purged records.
    ///
    /// # Panics
    ///
    /// Panics if a shard lock has been poisoned.
    pub fn gc(&self) -> usize {
        let now = self.clock.now();
        let horizon = now.saturating_sub(self.config.window_length * 2);
        let mut purged = 0;
        for shard in &self.shards {
            let mut shard = shard.lock().expect("admission shard poisoned");
            let before = shard.len();
            shard.retain(|_, record| record.window_start >= horizon);
            purged += before - shard.len();
        }
        if purged > 0 {
            debug!(purged, "admission records garbage collected");
        }
        purged
    }
}
