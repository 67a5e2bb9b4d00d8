//! Configuration management for callcore

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Video codec used for the outbound camera track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    VP8,
    H264,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::VP8 => "vp8",
            VideoCodec::H264 => "h264",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodec::VP8 => "video/VP8",
            VideoCodec::H264 => "video/H264",
        }
    }

    pub fn sdp_fmtp_line(&self) -> &'static str {
        match self {
            VideoCodec::VP8 => "",
            VideoCodec::H264 => "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
        }
    }
}

/// Where local audio comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CaptureSource {
    /// Synthetic Opus silence, no device needed
    #[default]
    Silence,
    /// Default microphone through cpal (requires the `audio` feature)
    Device,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Call lifecycle configuration
    #[serde(default)]
    pub call: CallConfig,

    /// WebRTC configuration
    #[serde(default)]
    pub webrtc: WebRTCConfig,

    /// Local media configuration
    #[serde(default)]
    pub media: MediaConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// Identity of the local participant, reported to the call-record service
    #[serde(default = "default_local_user")]
    pub local_user: String,

    /// How long a Disconnected session waits for the transport to recover
    #[serde(default = "default_disconnect_grace_ms")]
    pub disconnect_grace_ms: u64,

    /// Remote candidates held before the remote description is applied
    #[serde(default = "default_max_pending_candidates")]
    pub max_pending_candidates: usize,

    /// Signaling events held for sessions that are not registered yet
    #[serde(default = "default_early_inbox_limit")]
    pub early_inbox_limit: usize,

    /// Maximum concurrent sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl CallConfig {
    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            local_user: default_local_user(),
            disconnect_grace_ms: default_disconnect_grace_ms(),
            max_pending_candidates: default_max_pending_candidates(),
            early_inbox_limit: default_early_inbox_limit(),
            max_sessions: default_max_sessions(),
        }
    }
}

/// ICE server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// WebRTC peer link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRTCConfig {
    /// ICE servers used when no explicit STUN/TURN host is configured
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,

    /// STUN host (overrides `ice_servers` when set)
    #[serde(default)]
    pub stun_host: String,

    #[serde(default = "default_stun_port")]
    pub stun_port: u16,

    /// TURN relay host
    #[serde(default)]
    pub turn_host: String,

    #[serde(default = "default_turn_port")]
    pub turn_port: u16,

    /// TURN transport ("udp" or "tcp")
    #[serde(default)]
    pub turn_protocol: String,

    /// Use turns: instead of turn:
    #[serde(default)]
    pub turn_tls: bool,

    #[serde(default)]
    pub turn_username: String,

    #[serde(default)]
    pub turn_password: String,

    /// Emit candidates as they are gathered instead of waiting for gathering to complete
    #[serde(default = "default_ice_trickle")]
    pub ice_trickle: bool,

    /// Public IPs advertised as host candidates
    #[serde(default)]
    pub nat1to1_ips: Vec<String>,

    /// Restrict ICE UDP sockets to this port range
    #[serde(default)]
    pub ephemeral_udp_port_range: Option<[u16; 2]>,
}

impl Default for WebRTCConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            stun_host: String::new(),
            stun_port: default_stun_port(),
            turn_host: String::new(),
            turn_port: default_turn_port(),
            turn_protocol: String::new(),
            turn_tls: false,
            turn_username: String::new(),
            turn_password: String::new(),
            ice_trickle: default_ice_trickle(),
            nat1to1_ips: Vec::new(),
            ephemeral_udp_port_range: None,
        }
    }
}

/// Local capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(default)]
    pub source: CaptureSource,

    #[serde(default)]
    pub video_codec: VideoCodec,

    /// Camera device node that must exist for audio+video calls
    #[serde(default = "default_video_device")]
    pub video_device: PathBuf,

    /// Capture sample rate (Hz)
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Capture channel count (1 or 2)
    #[serde(default = "default_channels")]
    pub channels: u16,

    /// Opus bitrate (bps)
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: u32,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            source: CaptureSource::Silence,
            video_codec: VideoCodec::VP8,
            video_device: default_video_device(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            audio_bitrate: default_audio_bitrate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.call.local_user.trim().is_empty() {
            return Err("Call local_user must not be empty".into());
        }

        if self.call.disconnect_grace_ms == 0 {
            return Err("Call disconnect_grace_ms must be non-zero".into());
        }

        if self.call.max_pending_candidates == 0 {
            return Err("Call max_pending_candidates must be non-zero".into());
        }

        if self.call.max_sessions == 0 {
            return Err("Call max_sessions must be non-zero".into());
        }

        if !matches!(self.media.sample_rate, 8_000 | 12_000 | 16_000 | 24_000 | 48_000) {
            return Err("Media sample_rate must be an Opus rate (8000, 12000, 16000, 24000, 48000)".into());
        }

        if self.media.channels == 0 || self.media.channels > 2 {
            return Err("Media channels must be 1 or 2".into());
        }

        if self.media.audio_bitrate == 0 {
            return Err("Media audio_bitrate must be non-zero".into());
        }

        if let Some([min, max]) = self.webrtc.ephemeral_udp_port_range {
            if min == 0 || min > max {
                return Err("WebRTC ephemeral_udp_port_range must be [min, max] with 0 < min <= max".into());
            }
        }

        if !self.webrtc.turn_host.is_empty() && self.webrtc.turn_port == 0 {
            return Err("WebRTC turn_port must be non-zero when turn_host is set".into());
        }

        if self.webrtc.ice_servers.iter().any(|server| server.urls.is_empty()) {
            return Err("WebRTC ice_servers entries need at least one url".into());
        }

        Ok(())
    }
}

fn default_local_user() -> String {
    "local".to_string()
}

fn default_ice_servers() -> Vec<IceServerConfig> {
    ["stun:stun.l.google.com:19302", "stun:stun1.l.google.com:19302"]
        .iter()
        .map(|url| IceServerConfig {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        })
        .collect()
}

fn default_video_device() -> PathBuf {
    PathBuf::from("/dev/video0")
}

fn default_disconnect_grace_ms() -> u64 { 5000 }
fn default_max_pending_candidates() -> usize { 64 }
fn default_early_inbox_limit() -> usize { 128 }
fn default_max_sessions() -> usize { 4 }
fn default_stun_port() -> u16 { 3478 }
fn default_turn_port() -> u16 { 3478 }
fn default_ice_trickle() -> bool { true }
fn default_sample_rate() -> u32 { 48_000 }
fn default_channels() -> u16 { 2 }
fn default_audio_bitrate() -> u32 { 32_000 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.call.grace_window(), Duration::from_secs(5));
        assert_eq!(cfg.webrtc.ice_servers.len(), 2);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [call]
            local_user = "alice"
            disconnect_grace_ms = 1500

            [media]
            video_codec = "h264"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.call.local_user, "alice");
        assert_eq!(cfg.call.disconnect_grace_ms, 1500);
        assert_eq!(cfg.call.max_pending_candidates, 64);
        assert_eq!(cfg.media.video_codec, VideoCodec::H264);
        assert_eq!(cfg.media.source, CaptureSource::Silence);
        assert!(cfg.webrtc.ice_trickle);
    }

    #[test]
    fn validate_rejects_zero_grace_window() {
        let mut cfg = Config::default();
        cfg.call.disconnect_grace_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_non_opus_sample_rate() {
        let mut cfg = Config::default();
        cfg.media.sample_rate = 44_100;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_port_range() {
        let mut cfg = Config::default();
        cfg.webrtc.ephemeral_udp_port_range = Some([50_000, 40_000]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = Config::load(Path::new("/nonexistent/callcore.toml")).unwrap();
        assert_eq!(cfg.call.local_user, "local");
    }
}
