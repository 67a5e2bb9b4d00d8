//! callcore - peer-to-peer call session core
//!
//! Establishes, negotiates, maintains and tears down a WebRTC audio/video
//! call between two parties on top of an external signaling channel and
//! call-record service.

pub mod config;
pub mod controller;
pub mod error;
pub mod media;
pub mod negotiator;
pub mod record;
pub mod session;
pub mod signaling;

// Re-exports
pub use config::{CallConfig, Config, MediaConfig, VideoCodec, WebRTCConfig};
pub use controller::{CallController, CallEnded, CallHandle, CallObserver, Collaborators, IncomingCall};
pub use error::CallError;
pub use media::{DeviceMediaAcquirer, LocalMedia, MediaAcquirer, MediaKind, TrackKind};
pub use negotiator::peer_connection::RtcPeerLinkFactory;
pub use negotiator::{
    IceCandidate, NegotiationState, PeerLink, PeerLinkFactory, RemoteMedia, Role, SessionDescription,
};
pub use record::{CallRecordService, EndReason, InMemoryCallRecords, TerminalReason};
pub use session::{CallId, Delivery, SessionSnapshot};
pub use signaling::{SignalingChannel, SignalingEvent, SignalingMessage, SignalingRelay};
