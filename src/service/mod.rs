//! Service lifecycle
//!
//! Starts capture and signaling, funnels their events into the session
//! controller through one event loop, and tears everything down on stop.

pub mod lifecycle;

pub use lifecycle::{ServiceDeps, ServiceHandle, ServiceLifecycle};

use crate::capture::{CaptureError, SourceKind};
use crate::config::ConfigError;
use crate::session::NegotiationError;
use crate::signaling::SignalingError;
use thiserror::Error;

/// Service-level errors
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("service is not running")]
    NotRunning,
}

/// Conditions reported to the host application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostNotification {
    /// Required sources could not be acquired. When `fatal` is set none of
    /// them came up and the service has stopped itself.
    PermissionOrCaptureError { sources: Vec<SourceKind>, fatal: bool },

    /// Reconnect budget exhausted
    SignalingUnavailable { attempts: u32 },
}

/// Outcome of a teardown. Every step runs; failures are collected here.
#[derive(Debug, Default)]
pub struct StopReport {
    pub errors: Vec<ServiceError>,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}
