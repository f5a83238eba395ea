//! Error types for metaview.
//!
//! All errors are strongly typed using thiserror. Each category has its own
//! enum, wrapped by the top-level [`ViewError`].

use thiserror::Error;

/// Validation errors raised at the index boundary or on configuration input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Record key cannot be empty")]
    EmptyKey,

    #[error("Record key '{key}' must be a single path segment")]
    KeyNotSingleSegment {
        key: String,
    },

    #[error("Record key '{key}' does not match the final segment of '{uri}'")]
    KeyPathMismatch {
        key: String,
        uri: String,
    },

    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Record timestamp must be positive, got {timestamp}")]
    NonPositiveTimestamp {
        timestamp: i64,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Failures reported by the pub/sub transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Could not resolve namespace '{alias}': {message}")]
    ResolveFailed {
        alias: String,
        message: String,
        transient: bool,
    },

    #[error("Could not subscribe to '{topic}': {message}")]
    SubscribeFailed {
        topic: String,
        message: String,
        transient: bool,
    },

    #[error("Could not query '{topic}': {message}")]
    QueryFailed {
        topic: String,
        message: String,
        transient: bool,
    },

    #[error("Could not publish to '{topic}': {message}")]
    PublishFailed {
        topic: String,
        message: String,
    },

    #[error("Transport disconnected: {path}")]
    Disconnected {
        path: String,
    },
}

impl TransportError {
    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::ResolveFailed { transient, .. }
            | Self::SubscribeFailed { transient, .. }
            | Self::QueryFailed { transient, .. } => *transient,
            Self::PublishFailed { .. } | Self::Disconnected { .. } => false,
        }
    }
}

/// A predicate could not be evaluated against a record.
///
/// These never abort an index scan; the record is treated as non-matching.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionEvalError {
    #[error("Invalid regex '{pattern}': {reason}")]
    InvalidRegex {
        pattern: String,
        reason: String,
    },

    #[error("Value at '{uri}' is not valid UTF-8")]
    NonUtf8Value {
        uri: String,
    },
}

/// Top-level error type for metaview.
#[derive(Debug, Error)]
pub enum ViewError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Expression error: {0}")]
    Expression(#[from] ExpressionEvalError),

    #[error("View not found: {id}")]
    ViewNotFound {
        id: String,
    },

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl ViewError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a transport error.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_retryable(),
            Self::Validation(_) | Self::Expression(_) | Self::ViewNotFound { .. } | Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for metaview operations.
pub type ViewResult<T> = Result<T, ViewError>;

pub(crate) fn lock_err(context: &'static str) -> ViewError {
    ViewError::internal(format!("poisoned lock: {context}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_key_mismatch() {
        let err = ValidationError::KeyPathMismatch {
            key: "rm2".to_string(),
            uri: "/bldg1/rm1".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("rm2"));
        assert!(msg.contains("/bldg1/rm1"));
    }

    #[test]
    fn test_validation_error_timestamp() {
        let err = ValidationError::NonPositiveTimestamp { timestamp: -4 };
        assert!(format!("{err}").contains("-4"));
    }

    #[test]
    fn test_transport_error_retryable() {
        let transient = TransportError::SubscribeFailed {
            topic: "ns/*".to_string(),
            message: "busy".to_string(),
            transient: true,
        };
        assert!(transient.is_retryable());

        let permanent = TransportError::QueryFailed {
            topic: "ns/*".to_string(),
            message: "denied".to_string(),
            transient: false,
        };
        assert!(!permanent.is_retryable());

        let publish = TransportError::PublishFailed {
            topic: "ns/a".to_string(),
            message: "closed".to_string(),
        };
        assert!(!publish.is_retryable());
    }

    #[test]
    fn test_view_error_from_validation() {
        let err: ViewError = ValidationError::EmptyKey.into();
        assert!(err.is_validation());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_view_error_from_transport() {
        let err: ViewError = TransportError::ResolveFailed {
            alias: "ns".to_string(),
            message: "timeout".to_string(),
            transient: true,
        }
        .into();
        assert!(err.is_transport());
        assert!(err.is_retryable());
        assert!(format!("{err}").contains("Could not resolve namespace 'ns'"));
    }

    #[test]
    fn test_view_error_internal() {
        let err = lock_err("forwarders");
        assert!(err.is_internal());
        assert!(format!("{err}").contains("poisoned lock: forwarders"));
    }
}
