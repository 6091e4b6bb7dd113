//! Peer connection backend
//!
//! [`PeerBackend`] is the seam between the negotiation state machine and the
//! WebRTC stack. The production implementation wraps a webrtc-rs
//! `RTCPeerConnection`; callbacks it raises are turned into [`PeerEvent`]s
//! stamped with the session generation so stale ones can be discarded.

use super::{NegotiationError, PeerEvent, TransportState};
use crate::capture::{SourceKind, TrackHandle};
use crate::config::WebRTCConfig;
use crate::signaling::IceCandidatePayload;
use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::TrackLocal;

/// Receive-side constraints for an offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferConstraints {
    pub receive_audio: bool,
    pub receive_video: bool,
}

impl OfferConstraints {
    /// Publisher constraints: never ask to receive anything
    pub fn send_only() -> Self {
        Self {
            receive_audio: false,
            receive_video: false,
        }
    }
}

/// One underlying peer connection
#[async_trait]
pub trait PeerBackend: Send + Sync {
    /// Add a send-only track for a ready source
    async fn attach_track(&self, kind: SourceKind, track: TrackHandle) -> Result<(), NegotiationError>;

    /// Create an offer honouring the constraints
    async fn create_offer(&self, constraints: OfferConstraints) -> Result<String, NegotiationError>;

    /// Apply a (possibly rewritten) offer as local description, returning
    /// the SDP that was actually applied
    async fn set_local_offer(&self, sdp: &str) -> Result<String, NegotiationError>;

    async fn set_remote_answer(&self, sdp: &str) -> Result<(), NegotiationError>;

    async fn add_remote_candidate(&self, candidate: &IceCandidatePayload) -> Result<(), NegotiationError>;

    async fn close(&self) -> Result<(), NegotiationError>;
}

/// Builds a fresh backend per session generation
#[async_trait]
pub trait PeerBackendFactory: Send + Sync {
    async fn create(
        &self,
        generation: u64,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerBackend>, NegotiationError>;
}

impl From<RTCIceConnectionState> for TransportState {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::New | RTCIceConnectionState::Unspecified => TransportState::New,
            RTCIceConnectionState::Checking => TransportState::Checking,
            RTCIceConnectionState::Connected => TransportState::Connected,
            RTCIceConnectionState::Completed => TransportState::Completed,
            RTCIceConnectionState::Disconnected => TransportState::Disconnected,
            RTCIceConnectionState::Failed => TransportState::Failed,
            RTCIceConnectionState::Closed => TransportState::Closed,
        }
    }
}

/// Factory for webrtc-rs peer connections
pub struct WebRtcBackendFactory {
    config: WebRTCConfig,
}

impl WebRtcBackendFactory {
    pub fn new(config: WebRTCConfig) -> Self {
        Self { config }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = self
            .config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerBackendFactory for WebRtcBackendFactory {
    async fn create(
        &self,
        generation: u64,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerBackend>, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| NegotiationError::Backend(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| NegotiationError::Backend(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer_connection = Arc::new(
            api.new_peer_connection(self.rtc_configuration())
                .await
                .map_err(|e| NegotiationError::Backend(format!("Failed to create peer connection: {}", e)))?,
        );

        let candidate_tx = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidate_tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ICE gathering complete (generation {})", generation);
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidate_tx.send(PeerEvent::LocalCandidate {
                            generation,
                            candidate: IceCandidatePayload {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            },
                        });
                    }
                    Err(e) => warn!("Failed to serialize local ICE candidate: {}", e),
                }
            })
        }));

        let state_tx = events;
        peer_connection.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let state_tx = state_tx.clone();
            Box::pin(async move {
                let _ = state_tx.send(PeerEvent::Transport {
                    generation,
                    state: state.into(),
                });
            })
        }));

        Ok(Box::new(WebRtcBackend {
            peer_connection,
            last_offer: Mutex::new(None),
        }))
    }
}

/// webrtc-rs backed peer connection
pub struct WebRtcBackend {
    peer_connection: Arc<RTCPeerConnection>,
    last_offer: Mutex<Option<String>>,
}

#[async_trait]
impl PeerBackend for WebRtcBackend {
    async fn attach_track(&self, kind: SourceKind, track: TrackHandle) -> Result<(), NegotiationError> {
        let init = RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Sendonly,
            send_encodings: Vec::new(),
        };
        self.peer_connection
            .add_transceiver_from_track(track as Arc<dyn TrackLocal + Send + Sync>, Some(init))
            .await
            .map_err(|e| NegotiationError::Backend(format!("Failed to add {} transceiver: {}", kind, e)))?;
        Ok(())
    }

    async fn create_offer(&self, constraints: OfferConstraints) -> Result<String, NegotiationError> {
        for (wanted, codec_type) in [
            (constraints.receive_audio, RTPCodecType::Audio),
            (constraints.receive_video, RTPCodecType::Video),
        ] {
            if wanted {
                let init = RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: Vec::new(),
                };
                self.peer_connection
                    .add_transceiver_from_kind(codec_type, Some(init))
                    .await
                    .map_err(|e| NegotiationError::Backend(format!("Failed to add receive transceiver: {}", e)))?;
            }
        }

        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| NegotiationError::Sdp(format!("Failed to create offer: {}", e)))?;
        *self.last_offer.lock() = Some(offer.sdp.clone());
        Ok(offer.sdp)
    }

    async fn set_local_offer(&self, sdp: &str) -> Result<String, NegotiationError> {
        let desc = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| NegotiationError::Sdp(format!("Invalid local offer: {}", e)))?;
        match self.peer_connection.set_local_description(desc).await {
            Ok(()) => Ok(sdp.to_string()),
            Err(e) => {
                // Some stacks refuse munged local offers; fall back to the original.
                let original = self.last_offer.lock().clone();
                match original {
                    Some(original) if original != sdp => {
                        debug!("Rewritten offer rejected ({}); applying original", e);
                        let desc = RTCSessionDescription::offer(original.clone())
                            .map_err(|e| NegotiationError::Sdp(format!("Invalid local offer: {}", e)))?;
                        self.peer_connection
                            .set_local_description(desc)
                            .await
                            .map_err(|e| NegotiationError::Sdp(format!("Failed to set local description: {}", e)))?;
                        Ok(original)
                    }
                    _ => Err(NegotiationError::Sdp(format!("Failed to set local description: {}", e))),
                }
            }
        }
    }

    async fn set_remote_answer(&self, sdp: &str) -> Result<(), NegotiationError> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| NegotiationError::Sdp(format!("Invalid SDP answer: {}", e)))?;
        self.peer_connection
            .set_remote_description(answer)
            .await
            .map_err(|e| NegotiationError::Sdp(format!("Failed to set remote description: {}", e)))
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidatePayload) -> Result<(), NegotiationError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| NegotiationError::Ice(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.peer_connection
            .close()
            .await
            .map_err(|e| NegotiationError::Backend(format!("Failed to close connection: {}", e)))
    }
}
