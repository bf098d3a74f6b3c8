//! # Errors
//!
//! This module defines the error type shared by the socket wrapper, the proxy,
//! the coordinator and the handle.
//!
//! `RestartError` is `Clone` because a single restart attempt can have many
//! callers waiting on it (see the coalescing rules in [`crate::coordinator`]),
//! and every one of them receives the same outcome.

use std::sync::Arc;

/// Boxed error returned by application factories, readiness callbacks and hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while building, swapping or serving a restartable service.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RestartError {
    /// The application factory (or the new instance's readiness step) failed.
    /// The previously active instance keeps serving.
    #[error("Failed to build application: {0}")]
    BuildFailure(#[source] Arc<dyn std::error::Error + Send + Sync>),

    /// A caller supplied a malformed value (bind host, port, configuration field).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not allowed on this object.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Address or port were read before the socket was bound.
    #[error("Server is not listening")]
    NotListening,

    /// The configured transport protocol is not supported.
    #[error("Unknown Protocol {0}")]
    UnknownProtocol(String),

    /// Binding or serving the socket failed.
    #[error("Socket error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    /// The coordinator is no longer accepting requests (the service was closed).
    #[error("Coordinator closed")]
    CoordinatorClosed,

    /// The coordinator went away before answering.
    #[error("Coordinator dropped response channel")]
    CoordinatorDropped,
}

impl RestartError {
    /// Wraps a factory or readiness error as a [`RestartError::BuildFailure`].
    pub fn build(err: impl Into<BoxError>) -> Self {
        RestartError::BuildFailure(Arc::from(err.into()))
    }

    /// True when the service has already been stopped.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            RestartError::CoordinatorClosed | RestartError::CoordinatorDropped
        )
    }
}

impl From<std::io::Error> for RestartError {
    fn from(err: std::io::Error) -> Self {
        RestartError::Io(Arc::new(err))
    }
}
