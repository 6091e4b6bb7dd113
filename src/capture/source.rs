//! Capture source model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

/// Media handle produced by a ready source. The host writes RTP into it.
pub type TrackHandle = Arc<TrackLocalStaticRTP>;

/// Kind of capture source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Camera,
    Microphone,
    Screen,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Camera => "camera",
            SourceKind::Microphone => "microphone",
            SourceKind::Screen => "screen",
        }
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, SourceKind::Microphone)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "camera" => Ok(SourceKind::Camera),
            "microphone" | "mic" | "audio" => Ok(SourceKind::Microphone),
            "screen" => Ok(SourceKind::Screen),
            other => Err(format!("unknown capture source: {}", other)),
        }
    }
}

/// A single capture source as tracked by the manager
#[derive(Clone)]
pub struct CaptureSource {
    pub kind: SourceKind,
    pub ready: bool,
    pub track: Option<TrackHandle>,
}

impl CaptureSource {
    pub fn new(kind: SourceKind) -> Self {
        Self {
            kind,
            ready: false,
            track: None,
        }
    }
}

impl fmt::Debug for CaptureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureSource")
            .field("kind", &self.kind)
            .field("ready", &self.ready)
            .field("track", &self.track.as_ref().map(|_| "<track>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kind_aliases() {
        assert_eq!("mic".parse::<SourceKind>(), Ok(SourceKind::Microphone));
        assert_eq!(" Camera ".parse::<SourceKind>(), Ok(SourceKind::Camera));
        assert!("lidar".parse::<SourceKind>().is_err());
    }
}
