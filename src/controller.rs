//! Call Controller
//!
//! The application-facing API. Each call it starts or accepts becomes a
//! session actor; the controller only routes requests into actor mailboxes
//! and hands out read-only views.

use crate::config::CallConfig;
use crate::error::CallError;
use crate::media::{MediaAcquirer, MediaKind, TrackKind};
use crate::negotiator::{NegotiationState, PeerLinkFactory, RemoteMedia, Role, SessionDescription};
use crate::record::{format_duration, CallRecordService, EndReason, TerminalReason};
use crate::session::{
    CallId, CallSession, Delivery, Registry, SessionActor, SessionContext, SessionEntry,
    SessionEvent, SessionSnapshot, Setup,
};
use crate::signaling::{SignalingChannel, SignalingEvent};
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// Application callbacks. Each fires at most once per session.
pub trait CallObserver: Send + Sync {
    /// Remote media became available for the first time
    fn on_remote_media(&self, call: &CallHandle, remote: Arc<RemoteMedia>);

    /// The call reached Ended or Failed
    fn on_call_ended(&self, ended: &CallEnded);
}

/// End-of-call notification
#[derive(Debug, Clone)]
pub struct CallEnded {
    pub call_id: CallId,
    pub session_id: Option<String>,
    pub peer: String,
    pub role: Role,
    pub media_kind: MediaKind,
    pub reason: TerminalReason,
    pub connected_duration: Option<Duration>,
}

impl CallEnded {
    pub fn is_failure(&self) -> bool {
        self.reason.is_failure()
    }

    /// Human-readable summary
    pub fn describe(&self) -> String {
        match self.connected_duration {
            Some(duration) => format!(
                "Call with {} ended: {} after {}",
                self.peer,
                self.reason,
                format_duration(duration.as_secs())
            ),
            None => format!("Call with {} ended: {}", self.peer, self.reason),
        }
    }
}

/// Invitation carried by an inbound offer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCall {
    pub session_id: String,
    pub caller: String,
    pub media_kind: MediaKind,
    pub offer: SessionDescription,
}

/// Read-only view of one call
#[derive(Clone)]
pub struct CallHandle {
    call_id: CallId,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl CallHandle {
    pub(crate) fn new(call_id: CallId, snapshot: watch::Receiver<SessionSnapshot>) -> Self {
        Self { call_id, snapshot }
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> NegotiationState {
        self.snapshot.borrow().state
    }

    pub fn session_id(&self) -> Option<String> {
        self.snapshot.borrow().session_id.clone()
    }

    /// Wait until a snapshot satisfies `predicate`
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Result<SessionSnapshot, CallError> {
        let mut snapshot = self.snapshot.clone();
        snapshot
            .wait_for(predicate)
            .await
            .map(|s| s.clone())
            .map_err(|_| CallError::SessionNotFound(self.call_id.to_string()))
    }

    pub async fn wait_for_state(&self, state: NegotiationState) -> Result<SessionSnapshot, CallError> {
        self.wait_for(|s| s.state == state).await
    }
}

impl fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle")
            .field("call_id", &self.call_id)
            .field("state", &self.state())
            .finish()
    }
}

/// External collaborators the controller depends on
pub struct Collaborators {
    pub acquirer: Arc<dyn MediaAcquirer>,
    pub links: Arc<dyn PeerLinkFactory>,
    pub signaling: Arc<dyn SignalingChannel>,
    pub records: Arc<dyn CallRecordService>,
    pub observer: Arc<dyn CallObserver>,
}

/// Fires the session's cancel signal if a setup future is dropped
struct CancelOnDrop {
    cancel: Option<Arc<watch::Sender<bool>>>,
}

impl CancelOnDrop {
    fn new(cancel: Arc<watch::Sender<bool>>) -> Self {
        Self { cancel: Some(cancel) }
    }

    fn disarm(mut self) {
        self.cancel = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.send_replace(true);
        }
    }
}

/// Lifecycle API for calls
#[derive(Clone)]
pub struct CallController {
    ctx: Arc<SessionContext>,
}

impl CallController {
    pub fn new(config: CallConfig, collaborators: Collaborators) -> Self {
        let registry = Registry::new(config.max_sessions, config.early_inbox_limit);
        Self {
            ctx: Arc::new(SessionContext {
                config,
                acquirer: collaborators.acquirer,
                links: collaborators.links,
                signaling: collaborators.signaling,
                records: collaborators.records,
                observer: collaborators.observer,
                registry,
            }),
        }
    }

    pub fn config(&self) -> &CallConfig {
        &self.ctx.config
    }

    /// Call `peer`. Returns once the offer is sent (AwaitingAnswer).
    ///
    /// Fails with `DeviceUnavailable` or `SignalingUnavailable`; on failure
    /// nothing is held and no end-of-call notification fires. Dropping the
    /// returned future cancels the setup.
    pub async fn start_outgoing_call(&self, peer: &str, media_kind: MediaKind) -> Result<CallHandle, CallError> {
        info!("Starting {} call to {}", media_kind.as_str(), peer);
        self.launch(peer, Role::Caller, media_kind, None).await
    }

    /// Accept an inbound offer. Returns once the answer is sent (Negotiating).
    pub async fn accept_incoming_call(&self, incoming: IncomingCall) -> Result<CallHandle, CallError> {
        info!(
            "Accepting {} call from {} (session {})",
            incoming.media_kind.as_str(),
            incoming.caller,
            incoming.session_id
        );
        let IncomingCall {
            session_id,
            caller,
            media_kind,
            offer,
        } = incoming;
        self.launch(&caller, Role::Callee, media_kind, Some((session_id, offer)))
            .await
    }

    /// Reject an inbound offer without touching any device
    pub async fn decline_incoming_call(&self, incoming: &IncomingCall) -> Result<(), CallError> {
        let discarded = self.ctx.registry.discard_early(&incoming.session_id);
        debug!("Discarded {} early event(s) for {}", discarded, incoming.session_id);

        self.ctx
            .signaling
            .send_hangup(&incoming.session_id, EndReason::Declined.as_str())
            .await
            .map_err(CallError::into_signaling)?;

        if let Err(e) = self
            .ctx
            .records
            .notify_call_ended(&incoming.session_id, &TerminalReason::Ended(EndReason::Declined), 0)
            .await
        {
            debug!("Declined call {} has no local record: {}", incoming.session_id, e);
        }
        info!("Declined call from {}", incoming.caller);
        Ok(())
    }

    async fn launch(
        &self,
        peer: &str,
        role: Role,
        media_kind: MediaKind,
        incoming: Option<(String, SessionDescription)>,
    ) -> Result<CallHandle, CallError> {
        let call_id = CallId::new();
        let session_id = incoming.as_ref().map(|(id, _)| id.clone());
        let session = CallSession::new(
            call_id,
            peer,
            role,
            media_kind,
            session_id.clone(),
            self.ctx.config.max_pending_candidates,
        );

        let (snapshot_tx, snapshot_rx) = watch::channel(session.snapshot(None));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);

        let early = self.ctx.registry.admit(
            call_id,
            SessionEntry {
                peer: peer.to_string(),
                route: session_id,
                mailbox: events_tx.clone(),
                cancel: cancel_tx.clone(),
                snapshot: snapshot_rx.clone(),
            },
        )?;

        let setup = match incoming {
            Some((_, offer)) => Setup::Incoming { offer, early },
            None => Setup::Outgoing,
        };

        let handle = CallHandle::new(call_id, snapshot_rx);
        let actor = SessionActor::new(
            session,
            self.ctx.clone(),
            handle.clone(),
            events_rx,
            events_tx,
            cancel_rx,
            snapshot_tx,
        );

        let guard = CancelOnDrop::new(cancel_tx);
        let (reply_tx, reply_rx) = oneshot::channel();
        tokio::spawn(actor.run(setup, reply_tx));

        let result = reply_rx.await.unwrap_or(Err(CallError::Cancelled));
        guard.disarm();
        result.map(|()| handle)
    }

    /// End a call in whatever state it is in. Unknown or finished calls are
    /// a no-op, so this is safe to call any number of times.
    pub async fn decline_or_end(&self, call_id: CallId) {
        let Some((mailbox, cancel)) = self.ctx.registry.control(call_id) else {
            debug!("Call {} already ended", call_id);
            return;
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = mailbox.send(SessionEvent::End { reply: reply_tx });
        cancel.send_replace(true);
        let _ = reply_rx.await;
    }

    /// Enable or disable the local audio track. Returns whether a track was changed.
    pub async fn toggle_audio(&self, call_id: CallId, enabled: bool) -> Result<bool, CallError> {
        self.toggle(call_id, TrackKind::Audio, enabled).await
    }

    /// Enable or disable the local video track. On audio-only calls this
    /// does nothing and returns `Ok(false)`.
    pub async fn toggle_video(&self, call_id: CallId, enabled: bool) -> Result<bool, CallError> {
        self.toggle(call_id, TrackKind::Video, enabled).await
    }

    async fn toggle(&self, call_id: CallId, track: TrackKind, enabled: bool) -> Result<bool, CallError> {
        let not_found = || CallError::SessionNotFound(call_id.to_string());
        let mailbox = self.ctx.registry.mailbox(call_id).ok_or_else(not_found)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        mailbox
            .send(SessionEvent::Toggle {
                track,
                enabled,
                reply: reply_tx,
            })
            .map_err(|_| not_found())?;
        reply_rx.await.map_err(|_| not_found())
    }

    /// Route an inbound signaling event to its session. Events for sessions
    /// that do not exist yet are held until the session is registered.
    pub fn handle_signaling(&self, event: SignalingEvent) -> Delivery {
        let session_id = event.session_id().to_string();
        let delivery = self.ctx.registry.route(event);
        if delivery == Delivery::Dropped {
            warn!("Dropped signaling event for session {}", session_id);
        }
        delivery
    }

    pub fn session(&self, call_id: CallId) -> Option<SessionSnapshot> {
        self.ctx.registry.snapshot(call_id).map(|rx| rx.borrow().clone())
    }

    pub fn subscribe(&self, call_id: CallId) -> Option<CallHandle> {
        self.ctx
            .registry
            .snapshot(call_id)
            .map(|rx| CallHandle::new(call_id, rx))
    }

    pub fn active_calls(&self) -> Vec<SessionSnapshot> {
        self.ctx.registry.active()
    }

    /// End every active call
    pub async fn end_all(&self) {
        for call_id in self.ctx.registry.call_ids() {
            self.decline_or_end(call_id).await;
        }
    }
}

impl fmt::Debug for CallController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallController")
            .field("local_user", &self.ctx.config.local_user)
            .field("active_calls", &self.ctx.registry.call_ids().len())
            .finish()
    }
}
