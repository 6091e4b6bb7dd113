//! Capture device seam
//!
//! The OS-level device is a collaborator: all the core needs from it is
//! "acquire and hand me a track" and "release". [`RtpTrackDevice`] is the
//! default implementation, which allocates a local RTP track that the host
//! integration feeds with encoded media.

use super::source::{SourceKind, TrackHandle};
use super::CaptureError;
use crate::config::VideoCodec;
use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

const STREAM_ID: &str = "castlink-stream";

/// A device that can be acquired to produce a media track
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Source kind served by this device
    fn kind(&self) -> SourceKind;

    /// Acquire the device and start producing media
    async fn acquire(&self) -> Result<TrackHandle, CaptureError>;

    /// Release the device. Must be safe to call when not acquired.
    async fn release(&self) -> Result<(), CaptureError>;
}

/// Audio front-end processing requested from the microphone collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioProcessing {
    pub echo_cancellation: bool,
    pub auto_gain_control: bool,
    pub noise_suppression: bool,
    pub highpass_filter: bool,
}

impl Default for AudioProcessing {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            auto_gain_control: true,
            noise_suppression: true,
            highpass_filter: true,
        }
    }
}

/// Device backed by a local RTP track written by the host
pub struct RtpTrackDevice {
    kind: SourceKind,
    codec: VideoCodec,
    audio: AudioProcessing,
    track: Mutex<Option<TrackHandle>>,
}

impl RtpTrackDevice {
    pub fn new(kind: SourceKind, codec: VideoCodec) -> Self {
        Self {
            kind,
            codec,
            audio: AudioProcessing::default(),
            track: Mutex::new(None),
        }
    }

    pub fn with_audio_processing(mut self, audio: AudioProcessing) -> Self {
        self.audio = audio;
        self
    }

    /// Processing the host should apply when feeding microphone frames
    pub fn audio_processing(&self) -> AudioProcessing {
        self.audio
    }

    /// Track currently handed out, if acquired
    pub fn current_track(&self) -> Option<TrackHandle> {
        self.track.lock().clone()
    }

    fn capability(&self) -> RTCRtpCodecCapability {
        if self.kind.is_audio() {
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            }
        } else {
            RTCRtpCodecCapability {
                mime_type: self.codec.mime_type().to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: self.codec.fmtp_line().to_string(),
                rtcp_feedback: vec![],
            }
        }
    }
}

#[async_trait]
impl CaptureDevice for RtpTrackDevice {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn acquire(&self) -> Result<TrackHandle, CaptureError> {
        let mut slot = self.track.lock();
        if let Some(track) = slot.as_ref() {
            return Ok(track.clone());
        }

        if self.kind.is_audio() {
            debug!("Microphone processing requested: {:?}", self.audio);
        }

        let track = Arc::new(TrackLocalStaticRTP::new(
            self.capability(),
            format!("{}-{}", self.kind, uuid::Uuid::new_v4()),
            STREAM_ID.to_string(),
        ));
        *slot = Some(track.clone());
        Ok(track)
    }

    async fn release(&self) -> Result<(), CaptureError> {
        self.track.lock().take();
        Ok(())
    }
}

/// Build the default device set for the configured sources
pub fn default_devices(kinds: &[SourceKind], codec: VideoCodec) -> Vec<Arc<dyn CaptureDevice>> {
    kinds
        .iter()
        .map(|kind| Arc::new(RtpTrackDevice::new(*kind, codec)) as Arc<dyn CaptureDevice>)
        .collect()
}
