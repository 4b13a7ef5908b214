//! Error types for the alert delivery engine.
//!
//! Only errors that stop a stage from starting surface as [`EngineError`].
//! Failures of individual deliveries are recorded on the delivery itself and
//! never abort a batch.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::core::Phase;

/// Convenience alias used by the engine entry points.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// The main error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The durable store rejected or could not serve a request.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// Another runner holds the advisory lock for this stage.
    #[error("Stage '{phase}' is already running elsewhere")]
    StageBusy {
        /// The stage that could not be locked.
        phase: Phase,
    },

    /// The configuration snapshot is invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// The invocation was cancelled before it could start.
    #[error("Stage cancelled: {0}")]
    Cancelled(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Errors raised by the durable store and the subscriber directory.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store cannot be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A referenced record does not exist.
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// Record kind (e.g. "delivery").
        kind: &'static str,
        /// Record identifier.
        id: Uuid,
    },

    /// A status change would violate the delivery state machine.
    #[error("Invalid transition for '{id}': {from} -> {to}")]
    InvalidTransition {
        /// Record identifier.
        id: Uuid,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// The caller tried to complete a unit it does not hold a claim on.
    #[error("No claim held on '{id}'")]
    ClaimNotHeld {
        /// Record identifier.
        id: Uuid,
    },
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field holds a value outside its allowed range.
    #[error("Invalid config field '{field}': {reason}")]
    Invalid {
        /// Field path.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// The configuration document could not be parsed.
    #[error("Config parse error: {0}")]
    Parse(String),

    /// The configuration file could not be read.
    #[error("Config IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    /// Creates an invalid-field error.
    #[must_use]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Whether a failed send may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Retry with backoff.
    Transient,
    /// Never retry.
    Permanent,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

/// Provider-level reason a transport call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    /// The provider did not answer in time.
    Timeout,
    /// The provider asked us to slow down.
    RateLimited,
    /// The provider is down or unreachable.
    Unavailable,
    /// 5xx-equivalent provider error.
    ServerError,
    /// The recipient address is unknown or invalid.
    InvalidRecipient,
    /// The provider rejected the message content.
    MalformedPayload,
    /// Credentials were rejected.
    AuthenticationFailed,
    /// Any other 4xx-equivalent rejection.
    ClientError,
    /// No adapter is registered for the channel.
    NotConfigured,
}

impl TransportErrorKind {
    /// Classifies the error for retry purposes.
    #[must_use]
    pub const fn class(self) -> FailureClass {
        match self {
            Self::Timeout | Self::RateLimited | Self::Unavailable | Self::ServerError => {
                FailureClass::Transient
            }
            Self::InvalidRecipient
            | Self::MalformedPayload
            | Self::AuthenticationFailed
            | Self::ClientError
            | Self::NotConfigured => FailureClass::Permanent,
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Unavailable => "unavailable",
            Self::ServerError => "server_error",
            Self::InvalidRecipient => "invalid_recipient",
            Self::MalformedPayload => "malformed_payload",
            Self::AuthenticationFailed => "authentication_failed",
            Self::ClientError => "client_error",
            Self::NotConfigured => "not_configured",
        };
        write!(f, "{s}")
    }
}

/// Error returned by a channel transport adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct TransportError {
    /// Classification of the failure.
    pub kind: TransportErrorKind,
    /// Provider message.
    pub message: String,
    /// Provider-supplied hint for when to try again.
    pub retry_after: Option<Duration>,
}

impl TransportError {
    /// Creates a new transport error.
    #[must_use]
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Shorthand for a timeout.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    /// Shorthand for an invalid recipient.
    #[must_use]
    pub fn invalid_recipient(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::InvalidRecipient, message)
    }

    /// Attaches a retry-after hint.
    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Returns the retry classification.
    #[must_use]
    pub const fn class(&self) -> FailureClass {
        self.kind.class()
    }

    /// Returns true if the failure may be retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.kind.class(), FailureClass::Transient)
    }
}
