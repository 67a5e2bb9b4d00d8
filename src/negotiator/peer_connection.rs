//! webrtc-rs backed peer link
//!
//! Builds one `RTCPeerConnection` per call from `WebRTCConfig` and turns its
//! callbacks into `LinkEvent`s.

use super::{
    DescriptionKind, IceCandidate, LinkEvent, LinkEventSink, PeerLink, PeerLinkFactory,
    RemoteTrack, SessionDescription, TransportState,
};
use crate::config::{IceServerConfig, WebRTCConfig};
use crate::error::CallError;
use crate::media::{LocalMedia, TrackKind};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;

/// Creates `RtcPeerLink`s from WebRTC configuration
pub struct RtcPeerLinkFactory {
    config: WebRTCConfig,
}

impl RtcPeerLinkFactory {
    pub fn new(config: WebRTCConfig) -> Self {
        Self { config }
    }

    /// Create a new PeerConnection with the configured settings
    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, CallError> {
        let mut setting_engine = SettingEngine::default();

        if !self.config.nat1to1_ips.is_empty() {
            setting_engine.set_nat_1to1_ips(self.config.nat1to1_ips.clone(), RTCIceCandidateType::Host);
        }

        if let Some(range) = self.config.ephemeral_udp_port_range {
            let ephemeral = EphemeralUDP::new(range[0], range[1])
                .map_err(|e| CallError::Config(format!("Invalid ICE UDP port range: {}", e)))?;
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
        }

        // Opus, VP8, VP9 and H264 with their default payload types
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| CallError::NegotiationFailed(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| CallError::NegotiationFailed(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let ice_servers = build_ice_servers(&self.config)
            .into_iter()
            .map(|server| RTCIceServer {
                urls: server.urls,
                username: server.username.unwrap_or_default(),
                credential: server.credential.unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| CallError::NegotiationFailed(format!("Failed to create peer connection: {}", e)))?;

        Ok(Arc::new(peer_connection))
    }
}

#[async_trait]
impl PeerLinkFactory for RtcPeerLinkFactory {
    async fn create(&self, events: LinkEventSink) -> Result<Arc<dyn PeerLink>, CallError> {
        let peer_connection = self.create_peer_connection().await?;
        let ice_trickle = self.config.ice_trickle;

        let state_events = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                debug!("Peer connection state: {}", state);
                events.emit(LinkEvent::TransportChanged(TransportState::from(state)));
            })
        }));

        if ice_trickle {
            let candidate_events = events.clone();
            peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = candidate_events.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        debug!("ICE gathering complete");
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => events.emit(LinkEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        })),
                        Err(e) => warn!("Failed to serialize local candidate: {}", e),
                    }
                })
            }));
        }

        let track_events = events;
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = track_events.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Video => TrackKind::Video,
                    _ => TrackKind::Audio,
                };
                let remote = Arc::new(RemoteTrack::new(kind, track.id(), track.stream_id()));
                info!("Remote {} track {} arrived", kind.as_str(), remote.id());
                events.emit(LinkEvent::RemoteTrack(remote.clone()));

                tokio::spawn(async move {
                    while let Ok((packet, _)) = track.read_rtp().await {
                        remote.publish(packet.payload);
                    }
                    debug!("Remote track {} ended", remote.id());
                });
            })
        }));

        Ok(Arc::new(RtcPeerLink {
            peer_connection,
            ice_trickle,
        }))
    }
}

/// One `RTCPeerConnection`
pub struct RtcPeerLink {
    peer_connection: Arc<RTCPeerConnection>,
    ice_trickle: bool,
}

impl RtcPeerLink {
    /// Commit `description` locally. Without trickle ICE the returned SDP
    /// carries every gathered candidate.
    async fn commit_local(&self, description: RTCSessionDescription) -> Result<String, CallError> {
        let mut gather_complete = self.peer_connection.gathering_complete_promise().await;

        self.peer_connection
            .set_local_description(description.clone())
            .await
            .map_err(|e| CallError::NegotiationFailed(format!("Failed to set local description: {}", e)))?;

        if !self.ice_trickle {
            let _ = gather_complete.recv().await;
        }

        match self.peer_connection.local_description().await {
            Some(local) => Ok(local.sdp),
            None => Ok(description.sdp),
        }
    }
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn attach_local_media(&self, media: &LocalMedia) -> Result<(), CallError> {
        for track in media.tracks() {
            let rtc_track = track.rtc_track() as Arc<dyn TrackLocal + Send + Sync>;
            let sender = self
                .peer_connection
                .add_track(rtc_track)
                .await
                .map_err(|e| CallError::NegotiationFailed(format!("Failed to add {} track: {}", track.kind().as_str(), e)))?;

            // RTCP must be drained for interceptors (NACK, reports) to run
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while sender.read(&mut rtcp_buf).await.is_ok() {}
            });
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| CallError::NegotiationFailed(format!("Failed to create offer: {}", e)))?;
        Ok(SessionDescription::offer(self.commit_local(offer).await?))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| CallError::NegotiationFailed(format!("Failed to create answer: {}", e)))?;
        Ok(SessionDescription::answer(self.commit_local(answer).await?))
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<(), CallError> {
        let parsed = match description.kind {
            DescriptionKind::Offer => RTCSessionDescription::offer(description.sdp.clone()),
            DescriptionKind::Answer => RTCSessionDescription::answer(description.sdp.clone()),
        }
        .map_err(|e| CallError::NegotiationFailed(format!("Invalid SDP {:?}: {}", description.kind, e)))?;

        self.peer_connection
            .set_remote_description(parsed)
            .await
            .map_err(|e| CallError::NegotiationFailed(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), CallError> {
        let candidate_init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };

        self.peer_connection
            .add_ice_candidate(candidate_init)
            .await
            .map_err(|e| CallError::NegotiationFailed(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn close(&self) {
        if let Err(e) = self.peer_connection.close().await {
            warn!("Failed to close peer connection: {}", e);
        }
    }
}

/// Explicit STUN/TURN hosts win over the `ice_servers` list.
fn build_ice_servers(config: &WebRTCConfig) -> Vec<IceServerConfig> {
    let mut servers = Vec::new();

    if !config.stun_host.is_empty() && config.stun_port != 0 {
        servers.push(IceServerConfig {
            urls: vec![format!("stun:{}:{}", config.stun_host, config.stun_port)],
            username: None,
            credential: None,
        });
    }

    if !config.turn_host.is_empty() {
        let scheme = if config.turn_tls { "turns" } else { "turn" };
        let transport = if config.turn_protocol.is_empty() {
            "udp"
        } else {
            config.turn_protocol.as_str()
        };
        let url = format!(
            "{}:{}:{}?transport={}",
            scheme, config.turn_host, config.turn_port, transport
        );

        let (username, credential) = if !config.turn_username.is_empty() && !config.turn_password.is_empty() {
            (Some(config.turn_username.clone()), Some(config.turn_password.clone()))
        } else {
            (None, None)
        };

        servers.push(IceServerConfig {
            urls: vec![url],
            username,
            credential,
        });
    }

    if servers.is_empty() {
        return config.ice_servers.clone();
    }

    servers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ice_servers_are_public_stun() {
        let servers = build_ice_servers(&WebRTCConfig::default());
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.l.google.com:19302".to_string()]);
    }

    #[test]
    fn turn_host_builds_credentialed_url() {
        let config = WebRTCConfig {
            turn_host: "turn.example.org".to_string(),
            turn_port: 5349,
            turn_tls: true,
            turn_protocol: "tcp".to_string(),
            turn_username: "alice".to_string(),
            turn_password: "secret".to_string(),
            ..WebRTCConfig::default()
        };
        let servers = build_ice_servers(&config);
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, vec!["turns:turn.example.org:5349?transport=tcp".to_string()]);
        assert_eq!(servers[0].username.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn factory_creates_link_and_offer() {
        let factory = RtcPeerLinkFactory::new(WebRTCConfig {
            ice_servers: Vec::new(),
            ..WebRTCConfig::default()
        });
        let link = factory.create(LinkEventSink::new(|_| {})).await.unwrap();
        let media = LocalMedia::new(
            crate::media::MediaKind::AudioOnly,
            crate::config::VideoCodec::VP8,
            crate::media::CaptureSession::new(),
        );
        link.attach_local_media(&media).await.unwrap();
        let offer = link.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=audio"));
        link.close().await;
    }
}
