//! Error taxonomy for the call session core.
//!
//! Setup errors (`DeviceUnavailable`, `SignalingUnavailable`, ...) are
//! returned synchronously from the controller operations. Errors that occur
//! once a call is running only ever surface through the end-of-call
//! notification.

use thiserror::Error;

/// Call session errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// Local capture could not start (no device, permission denied)
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),
    /// The signaling channel or call-record service could not be reached
    #[error("Signaling unavailable: {0}")]
    SignalingUnavailable(String),
    /// Malformed or incompatible description/candidate, or out-of-order offer/answer
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),
    /// Transient loss of connectivity, recovered inside the grace window
    #[error("Connectivity lost")]
    ConnectivityLost,
    /// Connectivity did not recover inside the grace window
    #[error("Connectivity terminated")]
    ConnectivityTerminated,
    /// No active call with this id
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    /// A call with this peer is already active
    #[error("Already in a call with {0}")]
    AlreadyInCall(String),
    /// Session limit reached
    #[error("Maximum sessions reached ({0})")]
    TooManySessions(usize),
    /// Setup was abandoned before the call started
    #[error("Call setup cancelled")]
    Cancelled,
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl CallError {
    /// Re-classify a collaborator failure as a signaling failure, keeping cancellation intact.
    pub(crate) fn into_signaling(self) -> Self {
        match self {
            CallError::Cancelled | CallError::SignalingUnavailable(_) => self,
            other => CallError::SignalingUnavailable(other.to_string()),
        }
    }
}
