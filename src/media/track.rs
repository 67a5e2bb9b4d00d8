//! Local outbound tracks
//!
//! A `LocalTrack` wraps a webrtc-rs sample track together with the
//! enable/stop flags the call controller flips. Disabling a track never
//! touches the peer connection: audio keeps flowing as Opus silence and
//! video frames are dropped.

use super::capture::OPUS_SILENCE_FRAME;
use crate::config::VideoCodec;
use crate::error::CallError;
use bytes::Bytes;
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Track class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

/// Opus 48 kHz stereo, the only audio codec the call core sends
pub fn audio_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_string(),
        clock_rate: 48_000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

pub fn video_capability(codec: VideoCodec) -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: codec.mime_type().to_string(),
        clock_rate: 90_000,
        channels: 0,
        sdp_fmtp_line: codec.sdp_fmtp_line().to_string(),
        rtcp_feedback: vec![],
    }
}

/// A single outbound capture track
pub struct LocalTrack {
    kind: TrackKind,
    id: String,
    rtc_track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
    samples_written: AtomicU64,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, capability: RTCRtpCodecCapability, stream_id: &str) -> Self {
        let id = format!("{}-{}", kind.as_str(), uuid::Uuid::new_v4());
        let rtc_track = Arc::new(TrackLocalStaticSample::new(
            capability,
            id.clone(),
            stream_id.to_string(),
        ));

        Self {
            kind,
            id,
            rtc_track,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            samples_written: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The webrtc-rs track handed to the peer link
    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        self.rtc_track.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written.load(Ordering::Relaxed)
    }

    /// Write one encoded frame.
    ///
    /// While disabled, audio frames are replaced by Opus silence of the same
    /// duration and video frames are dropped.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<(), CallError> {
        if self.is_stopped() {
            return Err(CallError::DeviceUnavailable(format!("track {} released", self.id)));
        }

        let data = match (self.kind, self.is_enabled()) {
            (_, true) => data,
            (TrackKind::Audio, false) => Bytes::from_static(&OPUS_SILENCE_FRAME),
            (TrackKind::Video, false) => return Ok(()),
        };

        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };
        if let Err(e) = self.rtc_track.write_sample(&sample).await {
            debug!("Track {} write error: {}", self.id, e);
            return Err(CallError::NegotiationFailed(format!("track write failed: {}", e)));
        }
        self.samples_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_video_drops_frames() {
        let track = LocalTrack::new(TrackKind::Video, video_capability(VideoCodec::VP8), "s");
        track.set_enabled(false);
        track
            .write_sample(Bytes::from_static(&[1, 2, 3]), Duration::from_millis(33))
            .await
            .unwrap();
        assert_eq!(track.samples_written(), 0);
    }

    #[tokio::test]
    async fn stopped_track_rejects_writes() {
        let track = LocalTrack::new(TrackKind::Audio, audio_capability(), "s");
        track.stop();
        let err = track
            .write_sample(Bytes::from_static(&OPUS_SILENCE_FRAME), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::DeviceUnavailable(_)));
    }

    #[test]
    fn video_capability_follows_codec() {
        let cap = video_capability(VideoCodec::H264);
        assert_eq!(cap.mime_type, "video/H264");
        assert_eq!(cap.clock_rate, 90_000);
    }
}
