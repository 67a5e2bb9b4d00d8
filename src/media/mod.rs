//! Media Acquirer
//!
//! Opens local capture (microphone, optionally camera) and hands out a
//! `LocalMedia` handle. This module knows nothing about negotiation; the
//! peer link only reads the webrtc-rs tracks it exposes.

pub mod capture;
pub mod track;

pub use track::{LocalTrack, TrackKind};

use crate::config::{CaptureSource, MediaConfig, VideoCodec};
use crate::error::CallError;
use async_trait::async_trait;
use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// What a call carries, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    #[serde(rename = "audio")]
    AudioOnly,
    #[serde(rename = "video")]
    AudioVideo,
}

impl MediaKind {
    pub fn has_video(&self) -> bool {
        matches!(self, MediaKind::AudioVideo)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::AudioOnly => "audio",
            MediaKind::AudioVideo => "video",
        }
    }

    /// Infer the media kind of an offer from its media sections.
    pub fn from_sdp(sdp: &str) -> Self {
        if sdp.lines().any(|line| line.starts_with("m=video")) {
            MediaKind::AudioVideo
        } else {
            MediaKind::AudioOnly
        }
    }
}

/// An open capture session: a running flag plus the tasks feeding the tracks
#[derive(Debug, Default)]
pub struct CaptureSession {
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CaptureSession {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Flag shared with capture threads and pumps; cleared on release
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Tie a pump task to this session so release aborts it
    pub fn track_task(&self, task: JoinHandle<()>) {
        self.tasks.lock().push(task);
    }

    fn stop(&self) -> bool {
        let was_running = self.running.swap(false, Ordering::Relaxed);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        was_running
    }
}

/// Local capture handle, exclusively owned by one call session.
///
/// Capture stops on `release()` or when the handle is dropped.
#[derive(Debug)]
pub struct LocalMedia {
    kind: MediaKind,
    stream_id: String,
    audio: Arc<LocalTrack>,
    video: Option<Arc<LocalTrack>>,
    capture: CaptureSession,
}

impl LocalMedia {
    /// Build the tracks for `kind` around an open capture session
    pub fn new(kind: MediaKind, video_codec: VideoCodec, capture: CaptureSession) -> Self {
        let stream_id = format!("callcore-{}", uuid::Uuid::new_v4());
        let audio = Arc::new(LocalTrack::new(
            TrackKind::Audio,
            track::audio_capability(),
            &stream_id,
        ));
        let video = kind.has_video().then(|| {
            Arc::new(LocalTrack::new(
                TrackKind::Video,
                track::video_capability(video_codec),
                &stream_id,
            ))
        });

        Self {
            kind,
            stream_id,
            audio,
            video,
            capture,
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn audio(&self) -> &Arc<LocalTrack> {
        &self.audio
    }

    pub fn video(&self) -> Option<&Arc<LocalTrack>> {
        self.video.as_ref()
    }

    pub fn track(&self, kind: TrackKind) -> Option<&Arc<LocalTrack>> {
        match kind {
            TrackKind::Audio => Some(&self.audio),
            TrackKind::Video => self.video.as_ref(),
        }
    }

    pub fn tracks(&self) -> Vec<Arc<LocalTrack>> {
        std::iter::once(self.audio.clone())
            .chain(self.video.clone())
            .collect()
    }

    pub fn capture(&self) -> &CaptureSession {
        &self.capture
    }

    /// Enable or disable a track class. Returns false when the track does not exist.
    pub fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> bool {
        match self.track(kind) {
            Some(track) => {
                track.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    /// Stop capture. Idempotent.
    pub fn release(&self) {
        if self.capture.stop() {
            for track in self.tracks() {
                track.stop();
            }
            info!("Released local media {}", self.stream_id);
        }
    }

    pub fn is_released(&self) -> bool {
        !self.capture.is_running()
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.release();
    }
}

/// Local capture provider
#[async_trait]
pub trait MediaAcquirer: Send + Sync {
    /// Open capture for `kind`. Fails with `DeviceUnavailable` when no usable
    /// device exists or access is denied.
    async fn acquire(&self, kind: MediaKind) -> Result<LocalMedia, CallError>;

    /// Stop capture for a handle obtained from `acquire`
    fn release(&self, media: &LocalMedia) {
        media.release();
    }

    /// Enable/disable a track class without stopping capture.
    /// Returns false (and does nothing) when the track does not exist.
    fn toggle(&self, media: &LocalMedia, track: TrackKind, enabled: bool) -> bool {
        media.set_track_enabled(track, enabled)
    }
}

/// Acquirer backed by the configured capture source
pub struct DeviceMediaAcquirer {
    config: MediaConfig,
}

impl DeviceMediaAcquirer {
    pub fn new(config: MediaConfig) -> Self {
        Self { config }
    }

    async fn check_camera(&self) -> Result<(), CallError> {
        let path = &self.config.video_device;
        tokio::fs::metadata(path).await.map_err(|e| {
            CallError::DeviceUnavailable(format!("camera {}: {}", path.display(), e))
        })?;
        debug!("Camera device {} present", path.display());
        Ok(())
    }

    #[cfg(feature = "audio")]
    async fn start_microphone(&self, media: &LocalMedia) -> Result<(), CallError> {
        use capture::{AudioCaptureConfig, AudioPacket};
        use log::error;
        use tokio::sync::broadcast;

        let device = tokio::task::spawn_blocking(capture::probe_input_device)
            .await
            .map_err(|e| CallError::DeviceUnavailable(format!("device probe aborted: {}", e)))?
            .map_err(CallError::DeviceUnavailable)?;
        info!("Using input device: {}", device);

        let (tx, rx) = broadcast::channel::<AudioPacket>(64);
        let running = media.capture().running_flag();
        let config = AudioCaptureConfig {
            sample_rate: self.config.sample_rate,
            channels: self.config.channels,
            bitrate: self.config.audio_bitrate,
        };
        let thread_running = running.clone();
        std::thread::Builder::new()
            .name("callcore-mic".to_string())
            .spawn(move || {
                if let Err(e) = capture::run_microphone_capture(config, tx, thread_running) {
                    error!("Microphone capture failed: {}", e);
                }
            })
            .map_err(|e| CallError::DeviceUnavailable(format!("capture thread: {}", e)))?;

        let pump = tokio::spawn(capture::pump_packets(media.audio().clone(), rx, running));
        media.capture().track_task(pump);
        Ok(())
    }

    #[cfg(not(feature = "audio"))]
    async fn start_microphone(&self, _media: &LocalMedia) -> Result<(), CallError> {
        Err(CallError::DeviceUnavailable(
            "microphone capture requires the `audio` feature".to_string(),
        ))
    }
}

#[async_trait]
impl MediaAcquirer for DeviceMediaAcquirer {
    async fn acquire(&self, kind: MediaKind) -> Result<LocalMedia, CallError> {
        if kind.has_video() {
            self.check_camera().await?;
        }

        let media = LocalMedia::new(kind, self.config.video_codec, CaptureSession::new());
        match self.config.source {
            CaptureSource::Silence => {
                let pump = tokio::spawn(capture::pump_silence(
                    media.audio().clone(),
                    media.capture().running_flag(),
                ));
                media.capture().track_task(pump);
            }
            CaptureSource::Device => self.start_microphone(&media).await?,
        }

        info!(
            "Acquired local media {} ({}, {} track(s))",
            media.stream_id(),
            kind.as_str(),
            media.tracks().len()
        );
        Ok(media)
    }
}
