//! Call session actor
//!
//! Every call runs as one tokio task that owns its `CallSession` and drains
//! a single mailbox. Signaling events, peer link events, toggles and end
//! requests are all processed there, one at a time, in arrival order.
//!
//! Setup steps that can suspend (acquisition, description handling,
//! collaborator calls) race against the session's cancel signal, so ending
//! a call mid-setup stops the pending step and releases what was acquired.

use crate::config::CallConfig;
use crate::controller::{CallEnded, CallHandle, CallObserver};
use crate::error::CallError;
use crate::media::{LocalMedia, MediaAcquirer, MediaKind, TrackKind};
use crate::negotiator::{
    LinkEvent, LinkEventSink, NegotiationState, Negotiator, PeerLinkFactory, RemoteMedia, Role,
    SessionDescription, TransportOutcome,
};
use crate::record::{CallRecordService, EndReason, TerminalReason};
use crate::signaling::{SignalingChannel, SignalingEvent};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

/// Session ids of recently finished calls; late events for them are dropped
const CLOSED_ROUTE_MEMORY: usize = 64;

/// Local identifier of a call, valid before the record service assigns a session id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read-only copy of a call, republished on every change
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub call_id: CallId,
    pub session_id: Option<String>,
    pub peer: String,
    pub role: Role,
    pub media_kind: MediaKind,
    pub state: NegotiationState,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub has_local_media: bool,
    pub has_remote_media: bool,
    pub pending_candidates: usize,
    pub failed_candidates: u64,
    pub connected_at: Option<Instant>,
    pub ended_at: Option<Instant>,
    pub terminal_reason: Option<TerminalReason>,
}

impl SessionSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Time spent connected so far, or in total once the call ended
    pub fn connected_duration(&self) -> Option<Duration> {
        let connected_at = self.connected_at?;
        let until = self.ended_at.unwrap_or_else(Instant::now);
        Some(until.saturating_duration_since(connected_at))
    }
}

/// Whether an inbound signaling event found its session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Held until a session with this id is registered
    Buffered,
    Dropped,
}

pub(crate) enum SessionEvent {
    Signal(SignalingEvent),
    Link(LinkEvent),
    Toggle {
        track: TrackKind,
        enabled: bool,
        reply: oneshot::Sender<bool>,
    },
    End {
        reply: oneshot::Sender<()>,
    },
}

pub(crate) enum Setup {
    Outgoing,
    Incoming {
        offer: SessionDescription,
        early: Vec<SignalingEvent>,
    },
}

/// Collaborators and shared state handed to every session
pub(crate) struct SessionContext {
    pub config: CallConfig,
    pub acquirer: Arc<dyn MediaAcquirer>,
    pub links: Arc<dyn PeerLinkFactory>,
    pub signaling: Arc<dyn SignalingChannel>,
    pub records: Arc<dyn CallRecordService>,
    pub observer: Arc<dyn CallObserver>,
    pub registry: Registry,
}

/// Aggregate root of one call attempt
pub(crate) struct CallSession {
    call_id: CallId,
    session_id: Option<String>,
    peer: String,
    role: Role,
    media_kind: MediaKind,
    negotiator: Negotiator,
    local_media: Option<LocalMedia>,
    audio_enabled: bool,
    video_enabled: bool,
    connected_at: Option<Instant>,
    ended_at: Option<Instant>,
    remote_notified: bool,
}

impl CallSession {
    pub(crate) fn new(
        call_id: CallId,
        peer: &str,
        role: Role,
        media_kind: MediaKind,
        session_id: Option<String>,
        max_pending_candidates: usize,
    ) -> Self {
        Self {
            call_id,
            session_id,
            peer: peer.to_string(),
            role,
            media_kind,
            negotiator: Negotiator::new(role, max_pending_candidates),
            local_media: None,
            audio_enabled: true,
            video_enabled: media_kind.has_video(),
            connected_at: None,
            ended_at: None,
            remote_notified: false,
        }
    }

    pub(crate) fn snapshot(&self, terminal: Option<&TerminalReason>) -> SessionSnapshot {
        SessionSnapshot {
            call_id: self.call_id,
            session_id: self.session_id.clone(),
            peer: self.peer.clone(),
            role: self.role,
            media_kind: self.media_kind,
            state: self.negotiator.state(),
            audio_enabled: self.audio_enabled,
            video_enabled: self.video_enabled,
            has_local_media: self.local_media.is_some(),
            has_remote_media: self.negotiator.remote_media().is_some(),
            pending_candidates: self.negotiator.pending_candidates(),
            failed_candidates: self.negotiator.failed_candidates(),
            connected_at: self.connected_at,
            ended_at: self.ended_at,
            terminal_reason: terminal.cloned(),
        }
    }
}

fn require_media(media: &Option<LocalMedia>) -> Result<&LocalMedia, CallError> {
    media
        .as_ref()
        .ok_or_else(|| CallError::DeviceUnavailable("local media already released".to_string()))
}

/// Run `operation` unless the session is cancelled first.
async fn cancellable<T, F>(cancel: &mut watch::Receiver<bool>, operation: F) -> Result<T, CallError>
where
    F: Future<Output = Result<T, CallError>>,
{
    tokio::select! {
        biased;
        _ = cancel.wait_for(|cancelled| *cancelled) => Err(CallError::Cancelled),
        result = operation => result,
    }
}

pub(crate) struct SessionActor {
    session: CallSession,
    ctx: Arc<SessionContext>,
    handle: CallHandle,
    mailbox: mpsc::UnboundedReceiver<SessionEvent>,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: watch::Receiver<bool>,
    snapshot: watch::Sender<SessionSnapshot>,
    grace: Option<Instant>,
    terminal: Option<TerminalReason>,
    /// The local description may have reached the peer
    offer_in_flight: bool,
    /// The peer hung up before setup finished
    remote_hung_up: bool,
}

impl SessionActor {
    pub(crate) fn new(
        session: CallSession,
        ctx: Arc<SessionContext>,
        handle: CallHandle,
        mailbox: mpsc::UnboundedReceiver<SessionEvent>,
        events: mpsc::UnboundedSender<SessionEvent>,
        cancel: watch::Receiver<bool>,
        snapshot: watch::Sender<SessionSnapshot>,
    ) -> Self {
        Self {
            session,
            ctx,
            handle,
            mailbox,
            events,
            cancel,
            snapshot,
            grace: None,
            terminal: None,
            offer_in_flight: false,
            remote_hung_up: false,
        }
    }

    /// Set the call up, report the outcome on `reply`, then serve the mailbox
    /// until the call ends.
    pub(crate) async fn run(mut self, setup: Setup, reply: oneshot::Sender<Result<(), CallError>>) {
        let result = match setup {
            Setup::Outgoing => self.setup_outgoing().await,
            Setup::Incoming { offer, early } => self.setup_incoming(offer, early).await,
        };

        if let Err(err) = result {
            warn!("Call {} with {} setup failed: {}", self.session.call_id, self.session.peer, err);
            self.abort_setup(&err).await;
            let _ = reply.send(Err(err));
            return;
        }

        self.publish();
        let _ = reply.send(Ok(()));
        self.event_loop().await;
        debug!("Call {} actor finished", self.session.call_id);
    }

    fn link_sink(&self) -> LinkEventSink {
        let events = self.events.clone();
        LinkEventSink::new(move |event| {
            let _ = events.send(SessionEvent::Link(event));
        })
    }

    async fn setup_outgoing(&mut self) -> Result<(), CallError> {
        let ctx = self.ctx.clone();
        let kind = self.session.media_kind;

        let media = cancellable(&mut self.cancel, ctx.acquirer.acquire(kind)).await?;
        self.session.local_media = Some(media);
        self.publish();

        let session_id = cancellable(
            &mut self.cancel,
            ctx.records
                .notify_call_started(&ctx.config.local_user, &self.session.peer, kind),
        )
        .await
        .map_err(CallError::into_signaling)?;
        info!("Call {} registered as session {}", self.session.call_id, session_id);
        self.session.session_id = Some(session_id.clone());
        for event in ctx.registry.bind_route(self.session.call_id, &session_id) {
            let _ = self.events.send(SessionEvent::Signal(event));
        }

        let sink = self.link_sink();
        let link = cancellable(&mut self.cancel, ctx.links.create(sink)).await?;
        self.session.negotiator.bind_link(link);

        let media = require_media(&self.session.local_media)?;
        cancellable(&mut self.cancel, self.session.negotiator.start_outgoing(media)).await?;
        self.publish();

        let offer = cancellable(&mut self.cancel, self.session.negotiator.create_offer()).await?;
        self.offer_in_flight = true;
        cancellable(
            &mut self.cancel,
            ctx.signaling.send_session_description(&session_id, &offer),
        )
        .await
        .map_err(CallError::into_signaling)?;
        self.session.negotiator.offer_sent()?;
        info!("Offer sent to {} for session {}", self.session.peer, session_id);
        Ok(())
    }

    async fn setup_incoming(
        &mut self,
        offer: SessionDescription,
        early: Vec<SignalingEvent>,
    ) -> Result<(), CallError> {
        let mut early_candidates = Vec::new();
        for event in early {
            match event {
                SignalingEvent::Candidate { candidate, .. } => early_candidates.push(candidate),
                SignalingEvent::Hangup { reason, .. } => {
                    info!("{} hung up before the call was accepted ({})", self.session.peer, reason);
                    self.remote_hung_up = true;
                    return Err(CallError::Cancelled);
                }
                SignalingEvent::Description { description, .. } => {
                    debug!("Ignoring early {:?} description", description.kind);
                }
            }
        }

        let ctx = self.ctx.clone();
        let media = cancellable(&mut self.cancel, ctx.acquirer.acquire(self.session.media_kind)).await?;
        self.session.local_media = Some(media);
        self.publish();

        let sink = self.link_sink();
        let link = cancellable(&mut self.cancel, ctx.links.create(sink)).await?;
        self.session.negotiator.bind_link(link);

        let media = require_media(&self.session.local_media)?;
        cancellable(&mut self.cancel, self.session.negotiator.prepare_incoming(media)).await?;
        for candidate in early_candidates {
            self.session.negotiator.add_remote_candidate(candidate).await;
        }
        self.publish();

        let answer = cancellable(
            &mut self.cancel,
            self.session.negotiator.apply_remote_description(&offer),
        )
        .await?
        .ok_or_else(|| CallError::NegotiationFailed("offer produced no answer".to_string()))?;

        let session_id = self.session.session_id.clone().unwrap_or_default();
        cancellable(
            &mut self.cancel,
            ctx.signaling.send_session_description(&session_id, &answer),
        )
        .await
        .map_err(CallError::into_signaling)?;
        info!("Answer sent to {} for session {}", self.session.peer, session_id);
        Ok(())
    }

    /// Undo a failed setup. The caller gets the error; the observer hears nothing.
    async fn abort_setup(&mut self, err: &CallError) {
        let reason = TerminalReason::from(err.clone());
        let state = if reason.is_failure() {
            NegotiationState::Failed
        } else {
            NegotiationState::Ended
        };
        self.session.negotiator.finish(state).await;
        if let Some(media) = self.session.local_media.take() {
            self.ctx.acquirer.release(&media);
        }

        if let Some(session_id) = self.session.session_id.clone() {
            let send_hangup = match self.session.role {
                Role::Caller => self.offer_in_flight,
                Role::Callee => !self.remote_hung_up,
            };
            if send_hangup {
                if let Err(e) = self.ctx.signaling.send_hangup(&session_id, &reason.to_string()).await {
                    debug!("Failed to send hangup for {}: {}", session_id, e);
                }
            }
            if self.session.role == Role::Caller {
                if let Err(e) = self.ctx.records.notify_call_ended(&session_id, &reason, 0).await {
                    warn!("Failed to close call record {}: {}", session_id, e);
                }
            }
        }

        self.session.ended_at = Some(Instant::now());
        self.terminal = Some(reason);
        self.ctx.registry.remove(self.session.call_id);
        self.publish();
        self.drain_mailbox();
    }

    async fn event_loop(&mut self) {
        while self.terminal.is_none() {
            let grace = self.grace;
            tokio::select! {
                biased;
                _ = futures::FutureExt::map(self.cancel.wait_for(|cancelled| *cancelled), |r| r.map(|_| ())) => {
                    self.terminate(TerminalReason::Ended(EndReason::LocalHangup)).await;
                }
                _ = sleep_until(grace.unwrap_or_else(Instant::now)), if grace.is_some() => {
                    warn!("Call {} did not recover inside the grace window", self.session.call_id);
                    self.terminate(TerminalReason::Ended(EndReason::ConnectivityTerminated)).await;
                }
                event = self.mailbox.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => self.terminate(TerminalReason::Ended(EndReason::LocalHangup)).await,
                },
            }
        }
        self.drain_mailbox();
    }

    async fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Signal(signal) => self.on_signal(signal).await,
            SessionEvent::Link(link_event) => self.on_link_event(link_event).await,
            SessionEvent::Toggle { track, enabled, reply } => {
                let applied = self.toggle(track, enabled);
                let _ = reply.send(applied);
            }
            SessionEvent::End { reply } => {
                self.terminate(TerminalReason::Ended(EndReason::LocalHangup)).await;
                let _ = reply.send(());
            }
        }
        if self.terminal.is_none() {
            self.publish();
        }
    }

    async fn on_signal(&mut self, signal: SignalingEvent) {
        match signal {
            SignalingEvent::Description { description, .. } => {
                let applied = cancellable(
                    &mut self.cancel,
                    self.session.negotiator.apply_remote_description(&description),
                )
                .await;
                match applied {
                    Ok(None) => {}
                    Ok(Some(answer)) => {
                        let session_id = self.session.session_id.clone().unwrap_or_default();
                        if let Err(e) = self.ctx.signaling.send_session_description(&session_id, &answer).await {
                            self.terminate(TerminalReason::Failed(e.into_signaling().to_string())).await;
                        }
                    }
                    Err(CallError::Cancelled) => {
                        self.terminate(TerminalReason::Ended(EndReason::LocalHangup)).await;
                    }
                    Err(e) => {
                        warn!("Call {}: {}", self.session.call_id, e);
                        self.terminate(TerminalReason::Failed(e.to_string())).await;
                    }
                }
            }
            SignalingEvent::Candidate { candidate, .. } => {
                let outcome = self.session.negotiator.add_remote_candidate(candidate).await;
                debug!("Call {} remote candidate: {:?}", self.session.call_id, outcome);
            }
            SignalingEvent::Hangup { reason, .. } => {
                info!("{} hung up ({})", self.session.peer, reason);
                self.terminate(TerminalReason::Ended(EndReason::RemoteHangup)).await;
            }
        }
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::LocalCandidate(candidate) => {
                let Some(session_id) = &self.session.session_id else {
                    return;
                };
                if let Err(e) = self.ctx.signaling.send_ice_candidate(session_id, &candidate).await {
                    warn!("Failed to send local candidate for {}: {}", session_id, e);
                }
            }
            LinkEvent::TransportChanged(transport) => {
                match self.session.negotiator.on_transport_state(transport) {
                    TransportOutcome::Connected(remote) => {
                        self.session.connected_at.get_or_insert_with(Instant::now);
                        self.grace = None;
                        info!("Call {} with {} connected", self.session.call_id, self.session.peer);
                        if let Some(remote) = remote {
                            self.notify_remote_media(remote);
                        }
                    }
                    TransportOutcome::Recovered => {
                        self.grace = None;
                        info!("Call {} recovered inside the grace window", self.session.call_id);
                    }
                    TransportOutcome::Lost => {
                        let window = self.ctx.config.grace_window();
                        self.grace = Some(Instant::now() + window);
                        warn!(
                            "Call {}: {}, waiting {:?} for recovery",
                            self.session.call_id,
                            CallError::ConnectivityLost,
                            window
                        );
                    }
                    TransportOutcome::Failed => {
                        self.terminate(TerminalReason::Ended(EndReason::ConnectivityTerminated)).await;
                    }
                    TransportOutcome::Closed => {
                        self.terminate(TerminalReason::Ended(EndReason::TransportClosed)).await;
                    }
                    TransportOutcome::Ignored => {}
                }
            }
            LinkEvent::RemoteTrack(track) => {
                if let Some(remote) = self.session.negotiator.on_remote_track(track) {
                    self.notify_remote_media(remote);
                }
            }
        }
    }

    fn notify_remote_media(&mut self, remote: Arc<RemoteMedia>) {
        if self.session.remote_notified {
            return;
        }
        self.session.remote_notified = true;
        info!(
            "Call {} remote media available ({} track(s))",
            self.session.call_id,
            remote.tracks().len()
        );
        self.ctx.observer.on_remote_media(&self.handle, remote);
    }

    fn toggle(&mut self, track: TrackKind, enabled: bool) -> bool {
        let Some(media) = &self.session.local_media else {
            return false;
        };
        if !self.ctx.acquirer.toggle(media, track, enabled) {
            debug!("Call {} has no {} track to toggle", self.session.call_id, track.as_str());
            return false;
        }
        match track {
            TrackKind::Audio => self.session.audio_enabled = enabled,
            TrackKind::Video => self.session.video_enabled = enabled,
        }
        true
    }

    /// Reach a terminal state: close the link, release media, tell the
    /// remote party and the record service, then notify the observer once.
    async fn terminate(&mut self, reason: TerminalReason) {
        if self.terminal.is_some() {
            return;
        }

        let final_state = if reason.is_failure() {
            NegotiationState::Failed
        } else {
            NegotiationState::Ended
        };
        self.grace = None;
        self.session.negotiator.finish(final_state).await;
        if let Some(media) = self.session.local_media.take() {
            self.ctx.acquirer.release(&media);
        }

        let now = Instant::now();
        self.session.ended_at = Some(now);
        let connected_duration = self
            .session
            .connected_at
            .map(|at| now.saturating_duration_since(at));

        let ctx = self.ctx.clone();
        if let Some(session_id) = self.session.session_id.clone() {
            if reason != TerminalReason::Ended(EndReason::RemoteHangup) {
                if let Err(e) = ctx.signaling.send_hangup(&session_id, &reason.to_string()).await {
                    debug!("Failed to send hangup for {}: {}", session_id, e);
                }
            }
            let seconds = connected_duration.map(|d| d.as_secs()).unwrap_or(0);
            if let Err(e) = ctx.records.notify_call_ended(&session_id, &reason, seconds).await {
                warn!("Failed to close call record {}: {}", session_id, e);
            }
        }

        let ended = CallEnded {
            call_id: self.session.call_id,
            session_id: self.session.session_id.clone(),
            peer: self.session.peer.clone(),
            role: self.session.role,
            media_kind: self.session.media_kind,
            reason: reason.clone(),
            connected_duration,
        };
        info!("{}", ended.describe());

        self.terminal = Some(reason);
        ctx.registry.remove(self.session.call_id);
        ctx.observer.on_call_ended(&ended);
        self.publish();
    }

    /// Answer anything still queued once the session is over
    fn drain_mailbox(&mut self) {
        self.mailbox.close();
        while let Ok(event) = self.mailbox.try_recv() {
            if let SessionEvent::End { reply } = event {
                let _ = reply.send(());
            }
        }
    }

    fn publish(&self) {
        self.snapshot
            .send_replace(self.session.snapshot(self.terminal.as_ref()));
    }
}

pub(crate) struct SessionEntry {
    pub peer: String,
    pub route: Option<String>,
    pub mailbox: mpsc::UnboundedSender<SessionEvent>,
    pub cancel: Arc<watch::Sender<bool>>,
    pub snapshot: watch::Receiver<SessionSnapshot>,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<CallId, SessionEntry>,
    routes: HashMap<String, CallId>,
    early: HashMap<String, Vec<SignalingEvent>>,
    early_len: usize,
    closed: VecDeque<String>,
}

impl RegistryInner {
    fn take_early(&mut self, route: &str) -> Vec<SignalingEvent> {
        let events = self.early.remove(route).unwrap_or_default();
        self.early_len -= events.len();
        events
    }
}

/// Active sessions, their signaling routes and the early inbox
pub(crate) struct Registry {
    inner: Mutex<RegistryInner>,
    max_sessions: usize,
    early_limit: usize,
}

impl Registry {
    pub(crate) fn new(max_sessions: usize, early_limit: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            max_sessions,
            early_limit,
        }
    }

    /// Register a new session. Returns signaling that arrived for its route
    /// before it existed.
    pub(crate) fn admit(&self, call_id: CallId, entry: SessionEntry) -> Result<Vec<SignalingEvent>, CallError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if inner.sessions.values().any(|e| e.peer == entry.peer) {
            return Err(CallError::AlreadyInCall(entry.peer));
        }
        if inner.sessions.len() >= self.max_sessions {
            return Err(CallError::TooManySessions(self.max_sessions));
        }

        let early = match &entry.route {
            Some(route) => {
                if inner.routes.contains_key(route) {
                    return Err(CallError::AlreadyInCall(entry.peer));
                }
                inner.routes.insert(route.clone(), call_id);
                inner.take_early(route)
            }
            None => Vec::new(),
        };
        inner.sessions.insert(call_id, entry);
        Ok(early)
    }

    /// Attach a session id to an admitted session
    pub(crate) fn bind_route(&self, call_id: CallId, route: &str) -> Vec<SignalingEvent> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(entry) = inner.sessions.get_mut(&call_id) else {
            return Vec::new();
        };
        entry.route = Some(route.to_string());
        inner.routes.insert(route.to_string(), call_id);
        inner.take_early(route)
    }

    pub(crate) fn route(&self, event: SignalingEvent) -> Delivery {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if let Some(call_id) = inner.routes.get(event.session_id()) {
            if let Some(entry) = inner.sessions.get(call_id) {
                return match entry.mailbox.send(SessionEvent::Signal(event)) {
                    Ok(()) => Delivery::Delivered,
                    Err(_) => Delivery::Dropped,
                };
            }
        }

        if inner.closed.iter().any(|route| route == event.session_id()) {
            debug!("Dropping late signaling for finished session {}", event.session_id());
            return Delivery::Dropped;
        }
        if inner.early_len >= self.early_limit {
            warn!(
                "Early signaling inbox full ({}), dropping event for {}",
                self.early_limit,
                event.session_id()
            );
            return Delivery::Dropped;
        }
        inner.early_len += 1;
        inner
            .early
            .entry(event.session_id().to_string())
            .or_default()
            .push(event);
        Delivery::Buffered
    }

    /// Forget held signaling for a session that will never be accepted
    pub(crate) fn discard_early(&self, route: &str) -> usize {
        let mut inner = self.inner.lock();
        let discarded = inner.take_early(route).len();
        remember_closed(&mut inner.closed, route);
        discarded
    }

    pub(crate) fn remove(&self, call_id: CallId) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(entry) = inner.sessions.remove(&call_id) else {
            return;
        };
        if let Some(route) = entry.route {
            if inner.routes.get(&route) == Some(&call_id) {
                inner.routes.remove(&route);
            }
            inner.take_early(&route);
            remember_closed(&mut inner.closed, &route);
        }
    }

    pub(crate) fn control(
        &self,
        call_id: CallId,
    ) -> Option<(mpsc::UnboundedSender<SessionEvent>, Arc<watch::Sender<bool>>)> {
        self.inner
            .lock()
            .sessions
            .get(&call_id)
            .map(|e| (e.mailbox.clone(), e.cancel.clone()))
    }

    pub(crate) fn mailbox(&self, call_id: CallId) -> Option<mpsc::UnboundedSender<SessionEvent>> {
        self.inner.lock().sessions.get(&call_id).map(|e| e.mailbox.clone())
    }

    pub(crate) fn snapshot(&self, call_id: CallId) -> Option<watch::Receiver<SessionSnapshot>> {
        self.inner.lock().sessions.get(&call_id).map(|e| e.snapshot.clone())
    }

    pub(crate) fn call_ids(&self) -> Vec<CallId> {
        self.inner.lock().sessions.keys().copied().collect()
    }

    pub(crate) fn active(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<SessionSnapshot> = self
            .inner
            .lock()
            .sessions
            .values()
            .map(|e| e.snapshot.borrow().clone())
            .collect();
        snapshots.sort_by(|a, b| a.peer.cmp(&b.peer));
        snapshots
    }
}

fn remember_closed(closed: &mut VecDeque<String>, route: &str) {
    if closed.len() >= CLOSED_ROUTE_MEMORY {
        closed.pop_front();
    }
    closed.push_back(route.to_string());
}
