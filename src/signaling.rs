//! Signaling collaborator
//!
//! The core only needs three outbound primitives and a stream of inbound
//! events. `SignalingMessage` is the JSON envelope used when the transport
//! carries text frames, and `SignalingRelay` wires two controllers together
//! in-process.

use crate::controller::IncomingCall;
use crate::error::CallError;
use crate::media::MediaKind;
use crate::negotiator::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Outbound session-control messages
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send_session_description(
        &self,
        session_id: &str,
        description: &SessionDescription,
    ) -> Result<(), CallError>;

    async fn send_ice_candidate(&self, session_id: &str, candidate: &IceCandidate) -> Result<(), CallError>;

    async fn send_hangup(&self, session_id: &str, reason: &str) -> Result<(), CallError>;
}

/// Inbound session-control event, addressed by session id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    Description {
        session_id: String,
        description: SessionDescription,
    },
    Candidate {
        session_id: String,
        candidate: IceCandidate,
    },
    Hangup {
        session_id: String,
        reason: String,
    },
}

impl SignalingEvent {
    pub fn session_id(&self) -> &str {
        match self {
            SignalingEvent::Description { session_id, .. }
            | SignalingEvent::Candidate { session_id, .. }
            | SignalingEvent::Hangup { session_id, .. } => session_id,
        }
    }
}

/// Signaling wire envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// Call invitation carrying the caller's offer
    Offer {
        session_id: String,
        sdp: String,
        from: String,
        media: MediaKind,
    },

    Answer {
        session_id: String,
        sdp: String,
    },

    IceCandidate {
        session_id: String,
        candidate: String,
        #[serde(rename = "sdpMid")]
        sdp_mid: Option<String>,
        #[serde(rename = "sdpMLineIndex")]
        sdp_mline_index: Option<u16>,
    },

    Hangup {
        session_id: String,
        #[serde(default)]
        reason: String,
    },

    /// Relay-level error
    Error {
        message: String,
        #[serde(default)]
        session_id: Option<String>,
    },
}

impl SignalingMessage {
    /// Parse a signaling message from JSON
    pub fn from_json(json: &str) -> Result<Self, CallError> {
        serde_json::from_str(json)
            .map_err(|e| CallError::SignalingUnavailable(format!("Invalid signaling message: {}", e)))
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, CallError> {
        serde_json::to_string(self)
            .map_err(|e| CallError::SignalingUnavailable(format!("Failed to serialize message: {}", e)))
    }

    pub fn description(session_id: &str, from: &str, description: &SessionDescription) -> Self {
        match description.kind {
            crate::negotiator::DescriptionKind::Offer => SignalingMessage::Offer {
                session_id: session_id.to_string(),
                sdp: description.sdp.clone(),
                from: from.to_string(),
                media: MediaKind::from_sdp(&description.sdp),
            },
            crate::negotiator::DescriptionKind::Answer => SignalingMessage::Answer {
                session_id: session_id.to_string(),
                sdp: description.sdp.clone(),
            },
        }
    }

    pub fn ice_candidate(session_id: &str, candidate: &IceCandidate) -> Self {
        SignalingMessage::IceCandidate {
            session_id: session_id.to_string(),
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            SignalingMessage::Offer { session_id, .. }
            | SignalingMessage::Answer { session_id, .. }
            | SignalingMessage::IceCandidate { session_id, .. }
            | SignalingMessage::Hangup { session_id, .. } => Some(session_id),
            SignalingMessage::Error { session_id, .. } => session_id.as_deref(),
        }
    }

    /// The invitation an offer represents, for the application to accept or decline
    pub fn incoming_call(&self) -> Option<IncomingCall> {
        match self {
            SignalingMessage::Offer {
                session_id,
                sdp,
                from,
                media,
            } => Some(IncomingCall {
                session_id: session_id.clone(),
                caller: from.clone(),
                media_kind: *media,
                offer: SessionDescription::offer(sdp.clone()),
            }),
            _ => None,
        }
    }

    /// Convert into a routable event. Relay errors have no session event.
    pub fn into_event(self) -> Option<SignalingEvent> {
        match self {
            SignalingMessage::Offer { session_id, sdp, .. } => Some(SignalingEvent::Description {
                session_id,
                description: SessionDescription::offer(sdp),
            }),
            SignalingMessage::Answer { session_id, sdp } => Some(SignalingEvent::Description {
                session_id,
                description: SessionDescription::answer(sdp),
            }),
            SignalingMessage::IceCandidate {
                session_id,
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => Some(SignalingEvent::Candidate {
                session_id,
                candidate: IceCandidate {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                },
            }),
            SignalingMessage::Hangup { session_id, reason } => Some(SignalingEvent::Hangup { session_id, reason }),
            SignalingMessage::Error { .. } => None,
        }
    }
}

/// In-process signaling between two parties
pub struct SignalingRelay;

impl SignalingRelay {
    /// Connect `a` and `b`. Each side gets its outbound endpoint and the
    /// receiver of JSON frames addressed to it.
    pub fn pair(
        a: &str,
        b: &str,
    ) -> (
        (RelayEndpoint, mpsc::UnboundedReceiver<String>),
        (RelayEndpoint, mpsc::UnboundedReceiver<String>),
    ) {
        let (to_a, a_inbound) = mpsc::unbounded_channel();
        let (to_b, b_inbound) = mpsc::unbounded_channel();
        (
            (RelayEndpoint::new(a, to_b), a_inbound),
            (RelayEndpoint::new(b, to_a), b_inbound),
        )
    }
}

/// One side of a `SignalingRelay`
pub struct RelayEndpoint {
    user: String,
    outbound: mpsc::UnboundedSender<String>,
}

impl RelayEndpoint {
    fn new(user: &str, outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            user: user.to_string(),
            outbound,
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    fn deliver(&self, message: SignalingMessage) -> Result<(), CallError> {
        let json = message.to_json()?;
        debug!("{} -> relay: {}", self.user, json);
        self.outbound
            .send(json)
            .map_err(|_| CallError::SignalingUnavailable("relay peer is gone".to_string()))
    }
}

#[async_trait]
impl SignalingChannel for RelayEndpoint {
    async fn send_session_description(
        &self,
        session_id: &str,
        description: &SessionDescription,
    ) -> Result<(), CallError> {
        self.deliver(SignalingMessage::description(session_id, &self.user, description))
    }

    async fn send_ice_candidate(&self, session_id: &str, candidate: &IceCandidate) -> Result<(), CallError> {
        self.deliver(SignalingMessage::ice_candidate(session_id, candidate))
    }

    async fn send_hangup(&self, session_id: &str, reason: &str) -> Result<(), CallError> {
        self.deliver(SignalingMessage::Hangup {
            session_id: session_id.to_string(),
            reason: reason.to_string(),
        })
    }
}
