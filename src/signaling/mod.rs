//! Signaling
//!
//! This module provides the client side of the signaling channel:
//! - JSON wire protocol (`identify`, viewer presence, `signal`)
//! - Bounded exponential reconnect backoff
//! - WebSocket transport behind a connector seam
//! - The reconnecting client and its event surface

pub mod backoff;
pub mod client;
pub mod protocol;
pub mod transport;

pub use backoff::Backoff;
pub use client::{ConnectionState, SignalingClient, SignalingEvent, SignalingHandle, SignalingStatus};
pub use protocol::{Frame, IceCandidatePayload, InboundMessage, SignalEnvelope, SignalPayload};
pub use transport::{AlwaysOnline, Connector, Link, LinkMessage, NetworkFlag, NetworkMonitor, WebSocketConnector};

use thiserror::Error;

/// Signaling-related errors
#[derive(Debug, Error)]
pub enum SignalingError {
    /// Connect error, malformed URL or no network
    #[error("signaling connect failed: {0}")]
    Connect(String),

    /// Unparseable JSON or missing required field
    #[error("malformed signal: {0}")]
    MalformedSignal(String),

    /// Outbound encoding failure
    #[error("signaling protocol error: {0}")]
    Protocol(String),
}
