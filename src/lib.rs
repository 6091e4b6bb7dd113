//! castlink-core - WebRTC publisher core
//!
//! Captures local media sources, connects to a signaling server and offers
//! send-only WebRTC sessions to viewers as they appear.

pub mod capture;
pub mod clock;
pub mod config;
pub mod service;
pub mod session;
pub mod signaling;

// Re-exports
pub use capture::{CaptureError, CaptureManager, SourceKind};
pub use config::{Config, ConfigError, GatingPolicy, VideoCodec, WebRTCConfig};
pub use service::{HostNotification, ServiceDeps, ServiceError, ServiceHandle, ServiceLifecycle, StopReport};
pub use session::{NegotiationError, PeerSessionController, SessionState};
pub use signaling::{ConnectionState, SignalingClient, SignalingError, SignalingEvent, SignalingStatus};
