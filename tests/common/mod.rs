//! Fake collaborators for driving a `CallController` without devices or network

#![allow(dead_code)]

use async_trait::async_trait;
use callcore::config::VideoCodec;
use callcore::media::CaptureSession;
use callcore::negotiator::{LinkEvent, LinkEventSink, RemoteTrack, TransportState};
use callcore::negotiator::DescriptionKind;
use callcore::{
    CallConfig, CallController, CallEnded, CallError, CallHandle, CallId, CallObserver, CallRecordService,
    Collaborators, IceCandidate, InMemoryCallRecords, LocalMedia, MediaAcquirer, MediaKind, PeerLink,
    PeerLinkFactory, RemoteMedia, SessionDescription, SessionSnapshot, SignalingChannel, SignalingEvent,
    TerminalReason, TrackKind,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const SETTLE: Duration = Duration::from_secs(2);

#[derive(Default)]
pub struct FakeAcquirer {
    pub unavailable: AtomicBool,
    /// Open capture, then never finish acquiring
    pub hang: AtomicBool,
    opened: Mutex<Vec<Arc<AtomicBool>>>,
    pub toggles: Mutex<Vec<(TrackKind, bool)>>,
}

impl FakeAcquirer {
    pub fn opened(&self) -> usize {
        self.opened.lock().len()
    }

    pub fn all_released(&self) -> bool {
        self.opened.lock().iter().all(|running| !running.load(Ordering::Relaxed))
    }
}

#[async_trait]
impl MediaAcquirer for FakeAcquirer {
    async fn acquire(&self, kind: MediaKind) -> Result<LocalMedia, CallError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(CallError::DeviceUnavailable("no microphone".to_string()));
        }
        let media = LocalMedia::new(kind, VideoCodec::VP8, CaptureSession::new());
        self.opened.lock().push(media.capture().running_flag());
        if self.hang.load(Ordering::Relaxed) {
            std::future::pending::<()>().await;
        }
        Ok(media)
    }

    fn toggle(&self, media: &LocalMedia, track: TrackKind, enabled: bool) -> bool {
        self.toggles.lock().push((track, enabled));
        media.set_track_enabled(track, enabled)
    }
}

pub struct FakeLink {
    sink: LinkEventSink,
    media_kind: Mutex<Option<MediaKind>>,
    pub remote: Mutex<Vec<SessionDescription>>,
    pub applied: Mutex<Vec<String>>,
    pub closed: AtomicBool,
    stall_remote: bool,
    reject_answers: bool,
}

impl FakeLink {
    pub fn applied(&self) -> Vec<String> {
        self.applied.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn transport(&self, state: TransportState) {
        self.sink.emit(LinkEvent::TransportChanged(state));
    }

    pub fn remote_track(&self, kind: TrackKind) {
        let id = format!("remote-{}", kind.as_str());
        self.sink
            .emit(LinkEvent::RemoteTrack(Arc::new(RemoteTrack::new(kind, id, "remote-stream"))));
    }

    pub fn local_candidate(&self, candidate: &str) {
        self.sink.emit(LinkEvent::LocalCandidate(IceCandidate::new(candidate)));
    }

    fn sdp(&self) -> String {
        let mut sdp = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n".to_string();
        if self.media_kind.lock().map(|k| k.has_video()).unwrap_or(false) {
            sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\n");
        }
        sdp
    }
}

#[async_trait]
impl PeerLink for FakeLink {
    async fn attach_local_media(&self, media: &LocalMedia) -> Result<(), CallError> {
        *self.media_kind.lock() = Some(media.kind());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        Ok(SessionDescription::offer(self.sdp()))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        Ok(SessionDescription::answer(self.sdp()))
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<(), CallError> {
        self.remote.lock().push(description.clone());
        if self.reject_answers && description.kind == DescriptionKind::Answer {
            return Err(CallError::NegotiationFailed("malformed answer".to_string()));
        }
        if self.stall_remote {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), CallError> {
        if candidate.candidate.starts_with("bad") {
            return Err(CallError::NegotiationFailed("unparseable candidate".to_string()));
        }
        self.applied.lock().push(candidate.candidate.clone());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct FakeLinkFactory {
    /// Links never finish applying a remote description
    pub stall_remote: AtomicBool,
    pub reject_answers: AtomicBool,
    links: Mutex<Vec<Arc<FakeLink>>>,
}

impl FakeLinkFactory {
    pub fn latest(&self) -> Arc<FakeLink> {
        self.links.lock().last().cloned().expect("no link created")
    }

    pub fn created(&self) -> usize {
        self.links.lock().len()
    }
}

#[async_trait]
impl PeerLinkFactory for FakeLinkFactory {
    async fn create(&self, events: LinkEventSink) -> Result<Arc<dyn PeerLink>, CallError> {
        let link = Arc::new(FakeLink {
            sink: events,
            media_kind: Mutex::new(None),
            remote: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            stall_remote: self.stall_remote.load(Ordering::Relaxed),
            reject_answers: self.reject_answers.load(Ordering::Relaxed),
        });
        self.links.lock().push(link.clone());
        Ok(link)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Description(String, SessionDescription),
    Candidate(String, IceCandidate),
    Hangup(String, String),
}

#[derive(Default)]
pub struct FakeSignaling {
    pub unavailable: AtomicBool,
    /// Descriptions are recorded but the send never completes
    pub stall_descriptions: AtomicBool,
    sent: Mutex<Vec<Sent>>,
}

impl FakeSignaling {
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    pub fn descriptions(&self) -> Vec<(String, SessionDescription)> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Description(id, d) => Some((id, d)),
                _ => None,
            })
            .collect()
    }

    pub fn hangups(&self) -> Vec<(String, String)> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Hangup(id, reason) => Some((id, reason)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, sent: Sent) -> Result<(), CallError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(CallError::SignalingUnavailable("relay offline".to_string()));
        }
        self.sent.lock().push(sent);
        Ok(())
    }
}

#[async_trait]
impl SignalingChannel for FakeSignaling {
    async fn send_session_description(
        &self,
        session_id: &str,
        description: &SessionDescription,
    ) -> Result<(), CallError> {
        self.record(Sent::Description(session_id.to_string(), description.clone()))?;
        if self.stall_descriptions.load(Ordering::Relaxed) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn send_ice_candidate(&self, session_id: &str, candidate: &IceCandidate) -> Result<(), CallError> {
        self.record(Sent::Candidate(session_id.to_string(), candidate.clone()))
    }

    async fn send_hangup(&self, session_id: &str, reason: &str) -> Result<(), CallError> {
        self.record(Sent::Hangup(session_id.to_string(), reason.to_string()))
    }
}

/// Record service that cannot be reached
pub struct UnreachableRecords;

#[async_trait]
impl CallRecordService for UnreachableRecords {
    async fn notify_call_started(&self, _: &str, _: &str, _: MediaKind) -> Result<String, CallError> {
        Err(CallError::SignalingUnavailable("record service offline".to_string()))
    }

    async fn notify_call_ended(&self, _: &str, _: &TerminalReason, _: u64) -> Result<(), CallError> {
        Err(CallError::SignalingUnavailable("record service offline".to_string()))
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    pub remote_media: Mutex<Vec<(CallId, usize)>>,
    pub ended: Mutex<Vec<CallEnded>>,
}

impl RecordingObserver {
    pub fn remote_media_count(&self) -> usize {
        self.remote_media.lock().len()
    }

    pub fn ended(&self) -> Vec<CallEnded> {
        self.ended.lock().clone()
    }
}

impl CallObserver for RecordingObserver {
    fn on_remote_media(&self, call: &CallHandle, remote: Arc<RemoteMedia>) {
        self.remote_media.lock().push((call.call_id(), remote.tracks().len()));
    }

    fn on_call_ended(&self, ended: &CallEnded) {
        self.ended.lock().push(ended.clone());
    }
}

pub struct Harness {
    pub controller: CallController,
    pub acquirer: Arc<FakeAcquirer>,
    pub links: Arc<FakeLinkFactory>,
    pub signaling: Arc<FakeSignaling>,
    pub records: Arc<InMemoryCallRecords>,
    pub observer: Arc<RecordingObserver>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(CallConfig::default())
    }

    pub fn with_config(config: CallConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_records(records: Arc<dyn CallRecordService>) -> Self {
        Self::build(CallConfig::default(), Some(records))
    }

    fn build(config: CallConfig, records_override: Option<Arc<dyn CallRecordService>>) -> Self {
        let acquirer = Arc::new(FakeAcquirer::default());
        let links = Arc::new(FakeLinkFactory::default());
        let signaling = Arc::new(FakeSignaling::default());
        let records = Arc::new(InMemoryCallRecords::new());
        let observer = Arc::new(RecordingObserver::default());
        let record_service: Arc<dyn CallRecordService> = match records_override {
            Some(service) => service,
            None => records.clone(),
        };

        let controller = CallController::new(
            config,
            Collaborators {
                acquirer: acquirer.clone(),
                links: links.clone(),
                signaling: signaling.clone(),
                records: record_service,
                observer: observer.clone(),
            },
        );

        Self {
            controller,
            acquirer,
            links,
            signaling,
            records,
            observer,
        }
    }
}

pub fn candidate(session_id: &str, candidate: &str) -> SignalingEvent {
    SignalingEvent::Candidate {
        session_id: session_id.to_string(),
        candidate: IceCandidate::new(candidate),
    }
}

pub fn answer(session_id: &str) -> SignalingEvent {
    SignalingEvent::Description {
        session_id: session_id.to_string(),
        description: SessionDescription::answer("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n"),
    }
}

pub fn hangup(session_id: &str) -> SignalingEvent {
    SignalingEvent::Hangup {
        session_id: session_id.to_string(),
        reason: "bye".to_string(),
    }
}

/// Wait (bounded) for the call to reach a snapshot matching `predicate`
pub async fn settle(call: &CallHandle, predicate: impl FnMut(&SessionSnapshot) -> bool) -> SessionSnapshot {
    tokio::time::timeout(SETTLE, call.wait_for(predicate))
        .await
        .expect("call did not settle in time")
        .expect("call snapshot channel closed")
}

/// Poll until `condition` holds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(SETTLE, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
