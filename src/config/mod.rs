//! Configuration management for castlink

use crate::capture::SourceKind;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration loading/validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Video codec used for video capture tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    H264,
    VP8,
    VP9,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::VP8 => "vp8",
            VideoCodec::VP9 => "vp9",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "video/H264",
            VideoCodec::VP8 => "video/VP8",
            VideoCodec::VP9 => "video/VP9",
        }
    }

    pub fn fmtp_line(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
            VideoCodec::VP8 => "",
            VideoCodec::VP9 => "profile-id=0",
        }
    }
}

/// Which sources must be ready before an offer may be built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GatingPolicy {
    /// Only required sources gate the offer; optional ones attach later
    #[default]
    RequiredOnly,
    /// Every configured source (required and optional) gates the offer
    AllSources,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Signaling server connection
    #[serde(default)]
    pub signaling: SignalingConfig,

    /// Capture source selection
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Negotiation tuning
    #[serde(default)]
    pub negotiation: NegotiationConfig,

    /// WebRTC configuration
    #[serde(default)]
    pub webrtc: WebRTCConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// WebSocket endpoint of the signaling server
    #[serde(default = "default_signaling_url")]
    pub url: String,

    /// First reconnect delay in milliseconds
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,

    /// Reconnect delay cap in milliseconds
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    /// Consecutive failed attempts before giving up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// How often to re-check network availability while offline
    #[serde(default = "default_network_poll_ms")]
    pub network_poll_ms: u64,

    /// Upper bound on one WebSocket handshake
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: default_signaling_url(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            network_poll_ms: default_network_poll_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl SignalingConfig {
    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn network_poll(&self) -> Duration {
        Duration::from_millis(self.network_poll_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Sources that must be ready before negotiating
    #[serde(default = "default_required_sources")]
    pub required: Vec<SourceKind>,

    /// Sources attached when available
    #[serde(default = "default_optional_sources")]
    pub optional: Vec<SourceKind>,

    /// Offer gating policy
    #[serde(default)]
    pub gating: GatingPolicy,

    /// Video codec for camera and screen tracks
    #[serde(default)]
    pub video_codec: VideoCodec,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            required: default_required_sources(),
            optional: default_optional_sources(),
            gating: GatingPolicy::RequiredOnly,
            video_codec: VideoCodec::H264,
        }
    }
}

impl CaptureConfig {
    /// Every configured source, required first
    pub fn all_sources(&self) -> Vec<SourceKind> {
        let mut kinds = self.required.clone();
        for kind in &self.optional {
            if !kinds.contains(kind) {
                kinds.push(*kind);
            }
        }
        kinds
    }

    /// The set that gates offer construction under the configured policy
    pub fn gating_set(&self) -> HashSet<SourceKind> {
        match self.gating {
            GatingPolicy::RequiredOnly => self.required.iter().copied().collect(),
            GatingPolicy::AllSources => self.all_sources().into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationConfig {
    /// Lifetime of a parked inbound signal, in seconds
    #[serde(default = "default_pending_ttl_secs")]
    pub pending_ttl_secs: u64,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            pending_ttl_secs: default_pending_ttl_secs(),
        }
    }
}

impl NegotiationConfig {
    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }
}

/// ICE server entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// WebRTC peer connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRTCConfig {
    /// STUN/TURN servers handed to the peer connection
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for WebRTCConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &PathBuf) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = url::Url::parse(&self.signaling.url)
            .map_err(|e| ConfigError::Invalid(format!("signaling url {:?}: {}", self.signaling.url, e)))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ConfigError::Invalid("signaling url must use ws:// or wss://".into()));
        }

        if self.signaling.reconnect_base_ms == 0 {
            return Err(ConfigError::Invalid("reconnect base delay must be non-zero".into()));
        }
        if self.signaling.reconnect_base_ms > self.signaling.reconnect_max_ms {
            return Err(ConfigError::Invalid("reconnect base delay cannot exceed max delay".into()));
        }
        if self.signaling.network_poll_ms == 0 {
            return Err(ConfigError::Invalid("network poll interval must be non-zero".into()));
        }
        if self.signaling.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid("signaling connect timeout must be non-zero".into()));
        }

        if self.capture.required.is_empty() {
            return Err(ConfigError::Invalid("at least one required capture source is needed".into()));
        }
        for kind in &self.capture.optional {
            if self.capture.required.contains(kind) {
                return Err(ConfigError::Invalid(format!(
                    "capture source {} cannot be both required and optional",
                    kind
                )));
            }
        }

        if self.negotiation.pending_ttl_secs == 0 {
            return Err(ConfigError::Invalid("pending signal TTL must be non-zero".into()));
        }

        for server in &self.webrtc.ice_servers {
            if server.urls.is_empty() {
                return Err(ConfigError::Invalid("ICE server entry needs at least one url".into()));
            }
        }

        Ok(())
    }
}

fn default_signaling_url() -> String {
    "ws://127.0.0.1:3000/signal".to_string()
}

fn default_reconnect_base_ms() -> u64 { 1_000 }
fn default_reconnect_max_ms() -> u64 { 30_000 }
fn default_max_reconnect_attempts() -> u32 { 10 }
fn default_network_poll_ms() -> u64 { 2_000 }
fn default_connect_timeout_ms() -> u64 { 10_000 }
fn default_pending_ttl_secs() -> u64 { 60 }

fn default_required_sources() -> Vec<SourceKind> {
    vec![SourceKind::Camera, SourceKind::Microphone]
}

fn default_optional_sources() -> Vec<SourceKind> {
    vec![SourceKind::Screen]
}

fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec!["stun:stun.l.google.com:19302".to_string()],
        username: None,
        credential: None,
    }]
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.signaling.reconnect_base(), Duration::from_secs(1));
        assert_eq!(cfg.signaling.reconnect_max(), Duration::from_secs(30));
        assert_eq!(cfg.signaling.max_reconnect_attempts, 10);
        assert_eq!(cfg.signaling.connect_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.negotiation.pending_ttl(), Duration::from_secs(60));
    }

    #[test]
    fn validate_rejects_zero_connect_timeout() {
        let mut cfg = Config::default();
        cfg.signaling.connect_timeout_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_http_url() {
        let mut cfg = Config::default();
        cfg.signaling.url = "http://example.org".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_overlapping_sources() {
        let mut cfg = Config::default();
        cfg.capture.optional.push(SourceKind::Camera);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_required() {
        let mut cfg = Config::default();
        cfg.capture.required.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg = Config::from_toml(
            r#"
            [signaling]
            url = "wss://signal.example.org/ws"

            [capture]
            required = ["camera"]
            optional = ["microphone", "screen"]
            gating = "all_sources"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.signaling.url, "wss://signal.example.org/ws");
        assert_eq!(cfg.signaling.max_reconnect_attempts, 10);
        assert_eq!(cfg.capture.required, vec![SourceKind::Camera]);
        assert_eq!(cfg.capture.gating, GatingPolicy::AllSources);
        assert_eq!(cfg.capture.gating_set().len(), 3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn required_only_gating_ignores_optional() {
        let cfg = Config::default();
        let set = cfg.capture.gating_set();
        assert!(set.contains(&SourceKind::Camera));
        assert!(set.contains(&SourceKind::Microphone));
        assert!(!set.contains(&SourceKind::Screen));
    }
}
