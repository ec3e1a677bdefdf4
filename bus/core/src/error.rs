//! Bus Errors
//!
//! The public failure taxonomy of a [`Connection`](crate::Connection).
//!
//! Every failure carries a kind ([`ErrorKind`]) and a human-readable message
//! (its `Display`). Low-level framing and I/O failures are reported by the
//! transport as [`TransportError`] and folded into [`BusError`] here.

use std::fmt;

use thiserror::Error;

use crate::processing_loop::LoopState;
use crate::protocol::error_names;
use crate::transport::TransportError;

/// Kind of a [`BusError`], without its payload
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// I/O or connection failure; fatal to an active loop
    Transport,
    /// Malformed well-known name
    InvalidName,
    /// Name is owned by another peer and queueing was not requested
    NameUnavailable,
    /// Name is not held by this connection
    NotOwned,
    /// A processing loop is already active
    AlreadyRunning,
    /// A received frame could not be decoded
    MalformedFrame,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transport => "transport",
            Self::InvalidName => "invalid-name",
            Self::NameUnavailable => "name-unavailable",
            Self::NotOwned => "not-owned",
            Self::AlreadyRunning => "already-running",
            Self::MalformedFrame => "malformed-frame",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by bus connection operations
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BusError {
    /// The transport to the bus daemon failed or is unusable
    #[error("Transport error: {0}")]
    Transport(String),

    /// The requested name does not follow bus naming rules
    #[error("Invalid bus name {name:?}: {reason}")]
    InvalidName {
        /// The rejected name
        name: String,
        /// Which rule it violates
        reason: String,
    },

    /// Another connection owns the name and queueing was not requested
    #[error("Name {0:?} is already owned by another connection")]
    NameUnavailable(String),

    /// This connection does not hold the name
    #[error("Name {0:?} is not owned by this connection")]
    NotOwned(String),

    /// A processing loop is already active on this connection
    #[error("Processing loop already running ({0})")]
    AlreadyRunning(LoopState),

    /// A received frame failed integrity or envelope checks
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
}

impl BusError {
    /// Get the kind of this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) => ErrorKind::Transport,
            Self::InvalidName { .. } => ErrorKind::InvalidName,
            Self::NameUnavailable(_) => ErrorKind::NameUnavailable,
            Self::NotOwned(_) => ErrorKind::NotOwned,
            Self::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            Self::MalformedFrame(_) => ErrorKind::MalformedFrame,
        }
    }

    /// D-Bus style error name for this failure
    #[must_use]
    pub fn error_name(&self) -> &'static str {
        match self {
            Self::Transport(_) => error_names::IO_ERROR,
            Self::InvalidName { .. } | Self::MalformedFrame(_) => error_names::INVALID_ARGS,
            Self::NameUnavailable(_) => error_names::NAME_EXISTS,
            Self::NotOwned(_) => error_names::NAME_HAS_NO_OWNER,
            Self::AlreadyRunning(_) => error_names::FAILED,
        }
    }

    /// Whether this error ends an active processing loop
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub(crate) fn invalid_name(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidName {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<TransportError> for BusError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ChecksumMismatch { .. } | TransportError::SerializationError(_) => {
                Self::MalformedFrame(err.to_string())
            }
            other => Self::Transport(other.to_string()),
        }
    }
}
