//! Peer session negotiation
//!
//! Viewer bookkeeping, parking of early signals, SDP rewriting and the
//! controller that owns the single live peer session.

pub mod backend;
pub mod controller;
pub mod pending;
pub mod registry;
pub mod sdp;

pub use backend::{OfferConstraints, PeerBackend, PeerBackendFactory, WebRtcBackendFactory};
pub use controller::{PeerSessionController, SessionState, SignalSink};
pub use pending::{PendingSignal, PendingSignalQueue};
pub use registry::{Viewer, ViewerRegistry};
pub use sdp::force_sendonly;

use crate::signaling::IceCandidatePayload;
use thiserror::Error;

/// Negotiation errors
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("peer backend error: {0}")]
    Backend(String),

    #[error("SDP error: {0}")]
    Sdp(String),

    #[error("ICE error: {0}")]
    Ice(String),

    #[error("no active peer session")]
    NoSession,

    /// The signaling channel refused the message
    #[error("could not deliver offer to {0}")]
    NotDelivered(String),
}

/// ICE transport state of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// Whether the connection must be rebuilt to recover
    pub fn needs_rebuild(&self) -> bool {
        matches!(self, TransportState::Failed | TransportState::Disconnected)
    }
}

/// Callbacks from a peer backend, tagged with the session generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    LocalCandidate {
        generation: u64,
        candidate: IceCandidatePayload,
    },
    Transport {
        generation: u64,
        state: TransportState,
    },
}

impl PeerEvent {
    pub fn generation(&self) -> u64 {
        match self {
            PeerEvent::LocalCandidate { generation, .. } => *generation,
            PeerEvent::Transport { generation, .. } => *generation,
        }
    }
}
