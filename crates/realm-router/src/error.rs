//! Error types for event routing.

use crate::ServerEvent;

/// Failure reported by a router subscriber.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Errors surfaced while routing transport events.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// At least one subscriber failed. Every subscriber still received
    /// the event; `failures` lists the errors in subscription order.
    #[error("{} subscriber(s) failed handling {event}", .failures.len())]
    HandlerFailed {
        event: ServerEvent,
        failures: Vec<HandlerError>,
    },
}
