//! Signaling wire protocol
//!
//! Every WebSocket text frame is a JSON object `{"event": <name>, "data": <payload>}`.
//! Negotiation payloads travel inside the `signal` event as
//! `{to, from, signal: {type, sdp}}` or `{to, from, signal: {candidate: {...}}}`.

use super::SignalingError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Event names used on the wire
pub mod events {
    pub const IDENTIFY: &str = "identify";
    pub const ASSIGNED_ID: &str = "id";
    pub const VIEWER_READY: &str = "web-client-ready";
    pub const VIEWER_DISCONNECTED: &str = "web-client-disconnected";
    pub const SIGNAL: &str = "signal";
    pub const ERROR: &str = "error";
}

/// Role announced in the `identify` frame
pub const PUBLISHER_ROLE: &str = "publisher";

/// Outer frame carried over the socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Parse a frame from JSON text
    pub fn from_json(text: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(text)
            .map_err(|e| SignalingError::MalformedSignal(format!("invalid frame: {}", e)))
    }

    /// Serialize to JSON text
    pub fn to_json(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self)
            .map_err(|e| SignalingError::Protocol(format!("failed to serialize frame: {}", e)))
    }

    /// `identify` frame sent right after the handshake
    pub fn identify() -> Self {
        Self::new(events::IDENTIFY, json!({ "role": PUBLISHER_ROLE }))
    }

    /// `signal` frame addressed to a viewer
    pub fn signal(to: &str, from: Option<&str>, payload: &SignalPayload) -> Result<Self, SignalingError> {
        let envelope = SignalEnvelope {
            to: Some(to.to_string()),
            from: from.map(str::to_string),
            signal: payload.clone(),
        };
        let data = serde_json::to_value(&envelope)
            .map_err(|e| SignalingError::Protocol(format!("failed to encode signal: {}", e)))?;
        Ok(Self::new(events::SIGNAL, data))
    }
}

/// ICE candidate as exchanged with the browser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

/// Negotiation payload of a `signal` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireSignal", into = "WireSignal")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate(IceCandidatePayload),
}

impl SignalPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::Candidate(_) => "candidate",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum WireSignal {
    Description {
        #[serde(rename = "type")]
        kind: String,
        sdp: String,
    },
    Candidate {
        candidate: IceCandidatePayload,
    },
}

impl TryFrom<WireSignal> for SignalPayload {
    type Error = String;

    fn try_from(wire: WireSignal) -> Result<Self, Self::Error> {
        match wire {
            WireSignal::Description { kind, sdp } => match kind.as_str() {
                "offer" => Ok(SignalPayload::Offer { sdp }),
                "answer" => Ok(SignalPayload::Answer { sdp }),
                other => Err(format!("unsupported description type: {}", other)),
            },
            WireSignal::Candidate { candidate } => Ok(SignalPayload::Candidate(candidate)),
        }
    }
}

impl From<SignalPayload> for WireSignal {
    fn from(payload: SignalPayload) -> Self {
        match payload {
            SignalPayload::Offer { sdp } => WireSignal::Description {
                kind: "offer".to_string(),
                sdp,
            },
            SignalPayload::Answer { sdp } => WireSignal::Description {
                kind: "answer".to_string(),
                sdp,
            },
            SignalPayload::Candidate(candidate) => WireSignal::Candidate { candidate },
        }
    }
}

/// Addressed negotiation message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    pub signal: SignalPayload,
}

/// Inbound message after decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// Server-assigned id of this client
    AssignedId(String),
    ViewerReady(String),
    ViewerDisconnected(String),
    Signal { viewer_id: String, payload: SignalPayload },
    ServerError { message: String, code: Option<String> },
    /// Event this client does not handle
    Unknown(String),
}

/// Decode one inbound text frame
pub fn parse_inbound(text: &str) -> Result<InboundMessage, SignalingError> {
    let frame = Frame::from_json(text.trim())?;
    match frame.event.as_str() {
        events::ASSIGNED_ID => Ok(InboundMessage::AssignedId(id_from(&frame)?)),
        events::VIEWER_READY => Ok(InboundMessage::ViewerReady(id_from(&frame)?)),
        events::VIEWER_DISCONNECTED => Ok(InboundMessage::ViewerDisconnected(id_from(&frame)?)),
        events::SIGNAL => {
            let envelope: SignalEnvelope = serde_json::from_value(frame.data)
                .map_err(|e| SignalingError::MalformedSignal(format!("invalid signal: {}", e)))?;
            let viewer_id = envelope
                .from
                .filter(|id| !id.is_empty())
                .ok_or_else(|| SignalingError::MalformedSignal("signal without sender".to_string()))?;
            Ok(InboundMessage::Signal {
                viewer_id,
                payload: envelope.signal,
            })
        }
        events::ERROR => {
            let message = frame
                .data
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unspecified")
                .to_string();
            let code = frame.data.get("code").and_then(Value::as_str).map(str::to_string);
            Ok(InboundMessage::ServerError { message, code })
        }
        other => Ok(InboundMessage::Unknown(other.to_string())),
    }
}

fn id_from(frame: &Frame) -> Result<String, SignalingError> {
    match frame.data.as_str() {
        Some(id) if !id.is_empty() => Ok(id.to_string()),
        _ => Err(SignalingError::MalformedSignal(format!(
            "{} requires a non-empty id string",
            frame.event
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_frame() {
        let json = Frame::identify().to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["event"], "identify");
        assert_eq!(value["data"]["role"], "publisher");
    }

    #[test]
    fn parse_viewer_ready() {
        let msg = parse_inbound(r#"{"event":"web-client-ready","data":"v1"}"#).unwrap();
        assert_eq!(msg, InboundMessage::ViewerReady("v1".to_string()));
    }

    #[test]
    fn parse_answer_signal() {
        let text = r#"{"event":"signal","data":{"to":"me","from":"v1","signal":{"type":"answer","sdp":"v=0\r\n"}}}"#;
        match parse_inbound(text).unwrap() {
            InboundMessage::Signal { viewer_id, payload } => {
                assert_eq!(viewer_id, "v1");
                assert_eq!(payload, SignalPayload::Answer { sdp: "v=0\r\n".to_string() });
            }
            other => panic!("Expected Signal, got {:?}", other),
        }
    }

    #[test]
    fn parse_candidate_signal() {
        let text = r#"{"event":"signal","data":{"from":"v1","signal":{"candidate":{"sdpMid":"0","sdpMLineIndex":0,"candidate":"candidate:1 1 udp 1 10.0.0.1 9 typ host"}}}}"#;
        match parse_inbound(text).unwrap() {
            InboundMessage::Signal { payload: SignalPayload::Candidate(c), .. } => {
                assert_eq!(c.sdp_mid.as_deref(), Some("0"));
                assert_eq!(c.sdp_mline_index, Some(0));
                assert!(c.candidate.starts_with("candidate:1"));
            }
            other => panic!("Expected Candidate, got {:?}", other),
        }
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(matches!(parse_inbound("not json"), Err(SignalingError::MalformedSignal(_))));
        assert!(matches!(
            parse_inbound(r#"{"event":"web-client-ready","data":42}"#),
            Err(SignalingError::MalformedSignal(_))
        ));
        assert!(matches!(
            parse_inbound(r#"{"event":"signal","data":{"signal":{"type":"answer","sdp":"x"}}}"#),
            Err(SignalingError::MalformedSignal(_))
        ));
        assert!(matches!(
            parse_inbound(r#"{"event":"signal","data":{"from":"v1","signal":{"type":"rollback","sdp":"x"}}}"#),
            Err(SignalingError::MalformedSignal(_))
        ));
    }

    #[test]
    fn offer_frame_shape() {
        let frame = Frame::signal("v1", Some("pub-1"), &SignalPayload::Offer { sdp: "v=0".to_string() }).unwrap();
        let value: Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(value["event"], "signal");
        assert_eq!(value["data"]["to"], "v1");
        assert_eq!(value["data"]["from"], "pub-1");
        assert_eq!(value["data"]["signal"]["type"], "offer");
        assert_eq!(value["data"]["signal"]["sdp"], "v=0");
    }

    #[test]
    fn candidate_frame_shape() {
        let payload = SignalPayload::Candidate(IceCandidatePayload {
            candidate: "candidate:2".to_string(),
            sdp_mid: Some("1".to_string()),
            sdp_mline_index: Some(1),
        });
        let frame = Frame::signal("v1", None, &payload).unwrap();
        assert_eq!(frame.data["signal"]["candidate"]["sdpMLineIndex"], 1);
        assert_eq!(frame.data["signal"]["candidate"]["sdpMid"], "1");
    }

    #[test]
    fn server_error_and_unknown() {
        let msg = parse_inbound(r#"{"event":"error","data":{"message":"Recipient not found","code":"RECIPIENT_NOT_FOUND"}}"#).unwrap();
        assert_eq!(
            msg,
            InboundMessage::ServerError {
                message: "Recipient not found".to_string(),
                code: Some("RECIPIENT_NOT_FOUND".to_string()),
            }
        );
        let msg = parse_inbound(r#"{"event":"android-client-ready","data":"x"}"#).unwrap();
        assert_eq!(msg, InboundMessage::Unknown("android-client-ready".to_string()));
    }
}
