//! Runtime configuration for the view manager.
//!
//! Every field has a default, so an empty JSON object is a valid config.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ValidationError, ViewError, ViewResult};

/// Retry policy for transport calls made while establishing subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first one.
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubled after each failure.
    pub initial_backoff_ms: u64,
    /// Upper bound for a single backoff.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 25,
            max_backoff_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Backoff to wait after `attempt` failed attempts (1-based).
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Configuration for [`crate::manager::ViewManager`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewManagerConfig {
    /// Workers draining each namespace metadata stream.
    pub namespace_workers: usize,
    /// Workers draining each per-path forwarder subscription.
    pub forwarder_workers: usize,
    /// Per-view delivery buffer. Messages are dropped when it is full.
    pub view_stream_capacity: usize,
    /// Suffix appended to `<namespace>/*/` to subscribe to metadata topics.
    pub metadata_suffix: String,
    /// Upper bound on reconciliation rounds while the index keeps changing.
    pub max_reconcile_rounds: usize,
    /// Retry policy for subscribe/query/resolve calls.
    pub retry: RetryPolicy,
}

impl Default for ViewManagerConfig {
    fn default() -> Self {
        Self {
            namespace_workers: 16,
            forwarder_workers: 2,
            view_stream_capacity: 1024,
            metadata_suffix: "!meta/+".to_string(),
            max_reconcile_rounds: 8,
            retry: RetryPolicy::default(),
        }
    }
}

impl ViewManagerConfig {
    /// Parse a config from JSON. Missing fields take their defaults.
    pub fn from_json_str(s: &str) -> ViewResult<Self> {
        let cfg: Self = serde_json::from_str(s).map_err(|e| {
            ViewError::Validation(ValidationError::InvalidConfig {
                reason: format!("parse config: {e}"),
            })
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read and parse a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> ViewResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ViewError::Validation(ValidationError::InvalidConfig {
                reason: format!("read {}: {e}", path.display()),
            })
        })?;
        Self::from_json_str(&raw)
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let positive = [
            ("namespace_workers", self.namespace_workers),
            ("forwarder_workers", self.forwarder_workers),
            ("view_stream_capacity", self.view_stream_capacity),
            ("max_reconcile_rounds", self.max_reconcile_rounds),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ValidationError::InvalidConfig {
                    reason: format!("{field} must be at least 1"),
                });
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "retry.max_attempts must be at least 1".to_string(),
            });
        }
        if self.metadata_suffix.trim_matches('/').is_empty() {
            return Err(ValidationError::InvalidConfig {
                reason: "metadata_suffix cannot be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Topic pattern covering every metadata key below a namespace.
    #[must_use]
    pub fn namespace_topic(&self, namespace: &str) -> String {
        format!(
            "{}/*/{}",
            namespace.trim_end_matches('/'),
            self.metadata_suffix.trim_matches('/')
        )
    }
}
