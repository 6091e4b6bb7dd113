//! Capture sources
//!
//! Tracks readiness of the local camera, microphone and screen sources.
//! The devices themselves are collaborators behind [`CaptureDevice`].

pub mod device;
pub mod manager;
pub mod source;

pub use device::{default_devices, AudioProcessing, CaptureDevice, RtpTrackDevice};
pub use manager::CaptureManager;
pub use source::{CaptureSource, SourceKind, TrackHandle};

use thiserror::Error;

/// Capture-related errors
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Device busy, permission absent or hardware missing
    #[error("capture source {kind} unavailable: {reason}")]
    Unavailable { kind: SourceKind, reason: String },

    /// The manager has been shut down
    #[error("capture manager is shut down")]
    ShutDown,
}

/// Readiness transitions raised by the capture manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    SourceReady(SourceKind),
    SourceFailed { kind: SourceKind, reason: String },
}

impl CaptureEvent {
    pub fn kind(&self) -> SourceKind {
        match self {
            CaptureEvent::SourceReady(kind) => *kind,
            CaptureEvent::SourceFailed { kind, .. } => *kind,
        }
    }
}
