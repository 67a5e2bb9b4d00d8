//! Session Negotiator
//!
//! Owns the peer link of one call and drives the offer/answer state
//! machine:
//!
//! ```text
//! Idle -> Requesting -> AwaitingAnswer --\
//!   \--> AwaitingOffer ------------------+-> Negotiating -> Connected <-> Disconnected
//!                                                                  any -> Ended | Failed
//! ```
//!
//! Remote candidates that arrive before the remote description are held in
//! a bounded buffer and replayed, in arrival order, right after it is
//! applied.

pub mod peer_connection;
pub mod remote;

pub use remote::{RemoteMedia, RemoteTrack};

use crate::error::CallError;
use crate::media::LocalMedia;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// Which side of the call this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Caller,
    Callee,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Caller => "caller",
            Role::Callee => "callee",
        }
    }
}

/// Negotiation state, the single source of truth for a call's progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NegotiationState {
    Idle,
    /// Caller: local media attached, offer being produced
    Requesting,
    /// Caller: offer sent
    AwaitingAnswer,
    /// Callee: local media attached, offer not applied yet
    AwaitingOffer,
    /// Descriptions exchanged, transport not connected yet
    Negotiating,
    Connected,
    /// Transient loss, waiting out the grace window
    Disconnected,
    Ended,
    Failed,
}

impl NegotiationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NegotiationState::Ended | NegotiationState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationState::Idle => "idle",
            NegotiationState::Requesting => "requesting",
            NegotiationState::AwaitingAnswer => "awaiting-answer",
            NegotiationState::AwaitingOffer => "awaiting-offer",
            NegotiationState::Negotiating => "negotiating",
            NegotiationState::Connected => "connected",
            NegotiationState::Disconnected => "disconnected",
            NegotiationState::Ended => "ended",
            NegotiationState::Failed => "failed",
        }
    }

    fn can_transition(self, next: NegotiationState) -> bool {
        use NegotiationState::*;
        match (self, next) {
            (from, Ended | Failed) => !from.is_terminal(),
            (Idle, Requesting) | (Idle, AwaitingOffer) => true,
            (Requesting, AwaitingAnswer) => true,
            (AwaitingAnswer, Negotiating) | (AwaitingOffer, Negotiating) => true,
            (Negotiating, Connected) => true,
            (Connected, Disconnected) | (Disconnected, Connected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// Session description. The SDP is treated as an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: DescriptionKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate, opaque apart from its media line coordinates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Transport connectivity as reported by the peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for TransportState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New => TransportState::New,
            RTCPeerConnectionState::Connecting => TransportState::Connecting,
            RTCPeerConnectionState::Connected => TransportState::Connected,
            RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
            RTCPeerConnectionState::Failed => TransportState::Failed,
            RTCPeerConnectionState::Closed => TransportState::Closed,
            _ => TransportState::New,
        }
    }
}

/// Asynchronous events raised by a peer link
#[derive(Debug, Clone)]
pub enum LinkEvent {
    LocalCandidate(IceCandidate),
    TransportChanged(TransportState),
    RemoteTrack(Arc<RemoteTrack>),
}

/// Where a peer link delivers its events
#[derive(Clone)]
pub struct LinkEventSink(Arc<dyn Fn(LinkEvent) + Send + Sync>);

impl LinkEventSink {
    pub fn new(f: impl Fn(LinkEvent) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn emit(&self, event: LinkEvent) {
        (self.0)(event)
    }
}

impl fmt::Debug for LinkEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LinkEventSink")
    }
}

/// One peer-to-peer media link
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Add the local tracks as outbound media
    async fn attach_local_media(&self, media: &LocalMedia) -> Result<(), CallError>;

    /// Produce an offer and commit it as the local description
    async fn create_offer(&self) -> Result<SessionDescription, CallError>;

    /// Produce an answer and commit it as the local description
    async fn create_answer(&self) -> Result<SessionDescription, CallError>;

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<(), CallError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), CallError>;

    /// Close the transport. Must be safe to call more than once.
    async fn close(&self);
}

/// Creates peer links bound to an event sink
#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    async fn create(&self, events: LinkEventSink) -> Result<Arc<dyn PeerLink>, CallError>;
}

/// What happened to a remote candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Applied,
    Buffered,
    /// Buffer full or session finished
    Dropped,
    /// Rejected by the link; counted, never fatal
    Rejected,
}

/// What a transport change means for the session
#[derive(Debug, Clone)]
pub enum TransportOutcome {
    Ignored,
    /// First connection. Carries remote media if it became available now.
    Connected(Option<Arc<RemoteMedia>>),
    /// Back from Disconnected inside the grace window
    Recovered,
    /// Entered Disconnected; the grace window starts
    Lost,
    /// Transport failed permanently
    Failed,
    /// Transport closed
    Closed,
}

/// Per-call negotiation state machine
pub struct Negotiator {
    role: Role,
    state: NegotiationState,
    link: Option<Arc<dyn PeerLink>>,
    pending_ice: VecDeque<IceCandidate>,
    max_pending: usize,
    remote_applied: bool,
    applied_candidates: u64,
    failed_candidates: u64,
    remote_media: Option<Arc<RemoteMedia>>,
    held_tracks: Vec<Arc<RemoteTrack>>,
}

impl Negotiator {
    pub fn new(role: Role, max_pending: usize) -> Self {
        Self {
            role,
            state: NegotiationState::Idle,
            link: None,
            pending_ice: VecDeque::new(),
            max_pending,
            remote_applied: false,
            applied_candidates: 0,
            failed_candidates: 0,
            remote_media: None,
            held_tracks: Vec::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_ice.len()
    }

    pub fn applied_candidates(&self) -> u64 {
        self.applied_candidates
    }

    pub fn failed_candidates(&self) -> u64 {
        self.failed_candidates
    }

    pub fn remote_media(&self) -> Option<&Arc<RemoteMedia>> {
        self.remote_media.as_ref()
    }

    pub fn has_link(&self) -> bool {
        self.link.is_some()
    }

    pub fn bind_link(&mut self, link: Arc<dyn PeerLink>) {
        self.link = Some(link);
    }

    fn link(&self) -> Result<Arc<dyn PeerLink>, CallError> {
        self.link
            .clone()
            .ok_or_else(|| CallError::NegotiationFailed("no peer link bound".to_string()))
    }

    fn transition(&mut self, next: NegotiationState) -> Result<(), CallError> {
        if !self.state.can_transition(next) {
            return Err(CallError::NegotiationFailed(format!(
                "illegal transition {} -> {}",
                self.state, next
            )));
        }
        debug!("Negotiation {} -> {}", self.state, next);
        self.state = next;
        Ok(())
    }

    fn expect(&self, role: Role, state: NegotiationState) -> Result<(), CallError> {
        if self.role != role || self.state != state {
            return Err(CallError::NegotiationFailed(format!(
                "{} cannot do this in state {}",
                self.role.as_str(),
                self.state
            )));
        }
        Ok(())
    }

    /// Caller: attach local tracks. Idle -> Requesting.
    pub async fn start_outgoing(&mut self, media: &LocalMedia) -> Result<(), CallError> {
        self.expect(Role::Caller, NegotiationState::Idle)?;
        self.link()?.attach_local_media(media).await?;
        self.transition(NegotiationState::Requesting)
    }

    /// Caller: produce the local offer. Stays in Requesting until it is sent.
    pub async fn create_offer(&mut self) -> Result<SessionDescription, CallError> {
        self.expect(Role::Caller, NegotiationState::Requesting)?;
        self.link()?.create_offer().await
    }

    /// Caller: the offer reached the signaling channel. Requesting -> AwaitingAnswer.
    pub fn offer_sent(&mut self) -> Result<(), CallError> {
        self.transition(NegotiationState::AwaitingAnswer)
    }

    /// Callee: attach local tracks. Idle -> AwaitingOffer.
    pub async fn prepare_incoming(&mut self, media: &LocalMedia) -> Result<(), CallError> {
        self.expect(Role::Callee, NegotiationState::Idle)?;
        self.link()?.attach_local_media(media).await?;
        self.transition(NegotiationState::AwaitingOffer)
    }

    /// Apply a remote description in role-correct order and move to
    /// Negotiating. The callee gets back the answer to send.
    ///
    /// Any other combination (an answer to a callee, a second offer, a
    /// duplicate answer) is an error the session treats as Failed.
    pub async fn apply_remote_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<Option<SessionDescription>, CallError> {
        let answer = match (self.role, self.state, description.kind) {
            (Role::Callee, NegotiationState::AwaitingOffer, DescriptionKind::Offer) => {
                let link = self.link()?;
                link.set_remote_description(description).await?;
                self.remote_applied = true;
                Some(link.create_answer().await?)
            }
            (Role::Caller, NegotiationState::AwaitingAnswer, DescriptionKind::Answer) => {
                self.link()?.set_remote_description(description).await?;
                self.remote_applied = true;
                None
            }
            (role, state, kind) => {
                return Err(CallError::NegotiationFailed(format!(
                    "unexpected {:?} for {} in state {}",
                    kind,
                    role.as_str(),
                    state
                )));
            }
        };

        self.transition(NegotiationState::Negotiating)?;
        let flushed = self.flush_pending_candidates().await;
        info!(
            "Remote {:?} applied ({} buffered candidate(s) replayed)",
            description.kind, flushed
        );
        Ok(answer)
    }

    /// Apply a remote candidate, or hold it until the remote description is in place.
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> CandidateOutcome {
        if self.state.is_terminal() {
            return CandidateOutcome::Dropped;
        }

        if !self.remote_applied {
            if self.pending_ice.len() >= self.max_pending {
                warn!(
                    "Pending candidate buffer full ({}), dropping {}",
                    self.max_pending, candidate.candidate
                );
                return CandidateOutcome::Dropped;
            }
            self.pending_ice.push_back(candidate);
            return CandidateOutcome::Buffered;
        }

        if self.apply_candidate(&candidate).await {
            CandidateOutcome::Applied
        } else {
            CandidateOutcome::Rejected
        }
    }

    /// Replay buffered candidates in arrival order. The buffer is emptied, so
    /// a second flush applies nothing. Returns how many were applied.
    pub async fn flush_pending_candidates(&mut self) -> usize {
        if !self.remote_applied {
            return 0;
        }
        let pending = std::mem::take(&mut self.pending_ice);
        let mut applied = 0;
        for candidate in pending {
            if self.apply_candidate(&candidate).await {
                applied += 1;
            }
        }
        applied
    }

    async fn apply_candidate(&mut self, candidate: &IceCandidate) -> bool {
        let Some(link) = self.link.clone() else {
            return false;
        };
        match link.add_ice_candidate(candidate).await {
            Ok(()) => {
                self.applied_candidates += 1;
                true
            }
            Err(e) => {
                self.failed_candidates += 1;
                warn!(
                    "Dropping remote candidate ({} failed so far): {}",
                    self.failed_candidates, e
                );
                false
            }
        }
    }

    /// Map a transport report onto the state machine. Connectivity is
    /// observed here, never forced.
    pub fn on_transport_state(&mut self, transport: TransportState) -> TransportOutcome {
        if self.state.is_terminal() {
            return TransportOutcome::Ignored;
        }

        match (transport, self.state) {
            (TransportState::Connected, NegotiationState::Negotiating) => {
                self.state = NegotiationState::Connected;
                info!("Transport connected");
                TransportOutcome::Connected(self.promote_held_tracks())
            }
            (TransportState::Connected, NegotiationState::Disconnected) => {
                self.state = NegotiationState::Connected;
                info!("Transport recovered");
                TransportOutcome::Recovered
            }
            (TransportState::Disconnected, NegotiationState::Connected) => {
                self.state = NegotiationState::Disconnected;
                warn!("Transport lost");
                TransportOutcome::Lost
            }
            (TransportState::Failed, _) => TransportOutcome::Failed,
            (TransportState::Closed, _) => TransportOutcome::Closed,
            (other, state) => {
                debug!("Ignoring transport {:?} in state {}", other, state);
                TransportOutcome::Ignored
            }
        }
    }

    /// Record a track announced by the link. Returns the remote media handle
    /// the first time it becomes available.
    pub fn on_remote_track(&mut self, track: Arc<RemoteTrack>) -> Option<Arc<RemoteMedia>> {
        match self.state {
            NegotiationState::Ended | NegotiationState::Failed => None,
            NegotiationState::Connected | NegotiationState::Disconnected => {
                if let Some(media) = &self.remote_media {
                    media.add(track);
                    return None;
                }
                self.held_tracks.push(track);
                self.promote_held_tracks()
            }
            _ => {
                debug!("Holding remote {} track {} until connected", track.kind().as_str(), track.id());
                self.held_tracks.push(track);
                None
            }
        }
    }

    fn promote_held_tracks(&mut self) -> Option<Arc<RemoteMedia>> {
        if self.remote_media.is_some() || self.held_tracks.is_empty() {
            return None;
        }
        let media = Arc::new(RemoteMedia::new(std::mem::take(&mut self.held_tracks)));
        self.remote_media = Some(media.clone());
        Some(media)
    }

    /// Enter a terminal state and close the link. Idempotent.
    pub async fn finish(&mut self, terminal: NegotiationState) {
        if self.state.is_terminal() {
            return;
        }
        let terminal = if terminal == NegotiationState::Failed {
            NegotiationState::Failed
        } else {
            NegotiationState::Ended
        };
        debug!("Negotiation {} -> {}", self.state, terminal);
        self.state = terminal;
        self.pending_ice.clear();
        self.held_tracks.clear();
        self.remote_media = None;
        if let Some(link) = self.link.take() {
            link.close().await;
        }
    }
}

impl fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Negotiator")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("pending_ice", &self.pending_ice.len())
            .field("remote_applied", &self.remote_applied)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VideoCodec;
    use crate::media::{CaptureSession, MediaKind};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeLink {
        applied: Mutex<Vec<String>>,
        reject: Mutex<Vec<String>>,
        closed: Mutex<u32>,
    }

    #[async_trait]
    impl PeerLink for FakeLink {
        async fn attach_local_media(&self, _media: &LocalMedia) -> Result<(), CallError> {
            Ok(())
        }

        async fn create_offer(&self) -> Result<SessionDescription, CallError> {
            Ok(SessionDescription::offer("v=0 offer"))
        }

        async fn create_answer(&self) -> Result<SessionDescription, CallError> {
            Ok(SessionDescription::answer("v=0 answer"))
        }

        async fn set_remote_description(&self, _d: &SessionDescription) -> Result<(), CallError> {
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), CallError> {
            if self.reject.lock().contains(&candidate.candidate) {
                return Err(CallError::NegotiationFailed("bad candidate".to_string()));
            }
            self.applied.lock().push(candidate.candidate.clone());
            Ok(())
        }

        async fn close(&self) {
            *self.closed.lock() += 1;
        }
    }

    fn media() -> LocalMedia {
        LocalMedia::new(MediaKind::AudioOnly, VideoCodec::VP8, CaptureSession::new())
    }

    async fn callee_with(link: Arc<FakeLink>) -> Negotiator {
        let mut n = Negotiator::new(Role::Callee, 4);
        n.bind_link(link);
        n.prepare_incoming(&media()).await.unwrap();
        n
    }

    #[tokio::test]
    async fn buffered_candidates_replay_in_order_once() {
        let link = Arc::new(FakeLink::default());
        let mut n = callee_with(link.clone()).await;

        for c in ["c1", "c2", "c3"] {
            assert_eq!(n.add_remote_candidate(IceCandidate::new(c)).await, CandidateOutcome::Buffered);
        }
        assert!(link.applied.lock().is_empty());

        let answer = n.apply_remote_description(&SessionDescription::offer("v=0")).await.unwrap();
        assert_eq!(answer.unwrap().kind, DescriptionKind::Answer);
        assert_eq!(n.state(), NegotiationState::Negotiating);
        assert_eq!(*link.applied.lock(), vec!["c1", "c2", "c3"]);
        assert_eq!(n.pending_candidates(), 0);

        assert_eq!(n.flush_pending_candidates().await, 0);
        assert_eq!(link.applied.lock().len(), 3);
    }

    #[tokio::test]
    async fn buffer_overflow_drops_newest() {
        let link = Arc::new(FakeLink::default());
        let mut n = callee_with(link).await;
        for i in 0..4 {
            n.add_remote_candidate(IceCandidate::new(format!("c{}", i))).await;
        }
        assert_eq!(n.add_remote_candidate(IceCandidate::new("c4")).await, CandidateOutcome::Dropped);
        assert_eq!(n.pending_candidates(), 4);
    }

    #[tokio::test]
    async fn rejected_candidates_are_counted_not_fatal() {
        let link = Arc::new(FakeLink::default());
        link.reject.lock().push("bad".to_string());
        let mut n = callee_with(link.clone()).await;
        n.add_remote_candidate(IceCandidate::new("bad")).await;
        n.add_remote_candidate(IceCandidate::new("good")).await;
        n.apply_remote_description(&SessionDescription::offer("v=0")).await.unwrap();

        assert_eq!(n.failed_candidates(), 1);
        assert_eq!(n.applied_candidates(), 1);
        assert_eq!(n.state(), NegotiationState::Negotiating);
    }

    #[tokio::test]
    async fn out_of_order_descriptions_fail() {
        let link = Arc::new(FakeLink::default());
        let mut n = callee_with(link).await;
        assert!(n.apply_remote_description(&SessionDescription::answer("v=0")).await.is_err());

        let mut caller = Negotiator::new(Role::Caller, 4);
        caller.bind_link(Arc::new(FakeLink::default()));
        caller.start_outgoing(&media()).await.unwrap();
        caller.create_offer().await.unwrap();
        caller.offer_sent().unwrap();
        caller.apply_remote_description(&SessionDescription::answer("v=0")).await.unwrap();
        let dup = caller.apply_remote_description(&SessionDescription::answer("v=0")).await;
        assert!(matches!(dup, Err(CallError::NegotiationFailed(_))));
    }

    #[tokio::test]
    async fn second_offer_to_negotiating_callee_fails() {
        let link = Arc::new(FakeLink::default());
        let mut n = callee_with(link).await;
        let answer = n.apply_remote_description(&SessionDescription::offer("v=0")).await.unwrap();
        assert!(answer.is_some());
        assert_eq!(n.state(), NegotiationState::Negotiating);

        let again = n.apply_remote_description(&SessionDescription::offer("v=0")).await;
        assert!(matches!(again, Err(CallError::NegotiationFailed(_))));
        assert_eq!(n.state(), NegotiationState::Negotiating);
    }

    #[tokio::test]
    async fn remote_media_appears_once_after_connected() {
        let link = Arc::new(FakeLink::default());
        let mut n = callee_with(link).await;
        n.apply_remote_description(&SessionDescription::offer("v=0")).await.unwrap();

        let audio = Arc::new(RemoteTrack::new(crate::media::TrackKind::Audio, "a", "s"));
        assert!(n.on_remote_track(audio).is_none());
        assert!(n.remote_media().is_none());

        let TransportOutcome::Connected(Some(remote)) = n.on_transport_state(TransportState::Connected) else {
            panic!("expected remote media on connect");
        };
        assert_eq!(remote.tracks().len(), 1);

        let video = Arc::new(RemoteTrack::new(crate::media::TrackKind::Video, "v", "s"));
        assert!(n.on_remote_track(video).is_none());
        assert!(remote.has_video());
    }

    #[tokio::test]
    async fn disconnect_only_counts_after_connected() {
        let link = Arc::new(FakeLink::default());
        let mut n = callee_with(link).await;
        n.apply_remote_description(&SessionDescription::offer("v=0")).await.unwrap();

        assert!(matches!(n.on_transport_state(TransportState::Disconnected), TransportOutcome::Ignored));
        n.on_transport_state(TransportState::Connected);
        assert!(matches!(n.on_transport_state(TransportState::Disconnected), TransportOutcome::Lost));
        assert!(matches!(n.on_transport_state(TransportState::Connected), TransportOutcome::Recovered));
        assert_eq!(n.state(), NegotiationState::Connected);
    }

    #[tokio::test]
    async fn finish_is_idempotent_and_closes_once() {
        let link = Arc::new(FakeLink::default());
        let mut n = callee_with(link.clone()).await;
        n.finish(NegotiationState::Ended).await;
        n.finish(NegotiationState::Failed).await;
        assert_eq!(n.state(), NegotiationState::Ended);
        assert_eq!(*link.closed.lock(), 1);
        assert_eq!(n.add_remote_candidate(IceCandidate::new("late")).await, CandidateOutcome::Dropped);
    }

    #[test]
    fn transport_state_maps_from_peer_connection() {
        assert_eq!(TransportState::from(RTCPeerConnectionState::Connected), TransportState::Connected);
        assert_eq!(TransportState::from(RTCPeerConnectionState::Unspecified), TransportState::New);
    }
}
