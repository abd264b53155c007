//! Signaling wire messages
//!
//! JSON objects with a `type` discriminator. Inbound messages are validated here so the
//! rest of the bridge only sees well-formed, closed variants.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::IceCandidate;

/// Message received from a client
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Session description offer
    Offer { sdp: String },
    /// Trickled remote ICE candidate
    IceCandidate { candidate: IceCandidate },
}

/// Message sent to a client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Session description answer
    Answer { sdp: String },
    /// Locally gathered ICE candidate
    IceCandidate { candidate: IceCandidate },
}

/// Why an inbound message was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("message has no type")]
    MissingType,

    #[error("unknown message type '{0}'")]
    UnknownType(String),

    #[error("malformed {kind} message: {reason}")]
    Malformed { kind: &'static str, reason: String },
}

impl ClientMessage {
    /// Parse and validate one text frame
    pub fn parse(text: &str) -> Result<Self, SignalError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| SignalError::InvalidJson(e.to_string()))?;

        let kind = match value.get("type").and_then(Value::as_str) {
            Some("offer") => "offer",
            Some("ice-candidate") => "ice-candidate",
            Some(other) => return Err(SignalError::UnknownType(other.to_string())),
            None => return Err(SignalError::MissingType),
        };

        let message: ClientMessage = serde_json::from_value(value)
            .map_err(|e| SignalError::Malformed { kind, reason: e.to_string() })?;

        match &message {
            ClientMessage::Offer { sdp } if sdp.trim().is_empty() => {
                Err(SignalError::Malformed { kind, reason: "empty sdp".to_string() })
            }
            ClientMessage::IceCandidate { candidate } if candidate.candidate.is_empty() => {
                Err(SignalError::Malformed { kind, reason: "empty candidate".to_string() })
            }
            _ => Ok(message),
        }
    }

    /// Wire name of the message type
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::IceCandidate { .. } => "ice-candidate",
        }
    }
}

impl ServerMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_offer() {
        let message = ClientMessage::parse(r#"{"type":"offer","sdp":"v=0\r\n"}"#).unwrap();
        assert_eq!(message, ClientMessage::Offer { sdp: "v=0\r\n".to_string() });
        assert_eq!(message.kind(), "offer");
    }

    #[test]
    fn parses_candidate_with_camel_case_fields() {
        let text = r#"{"type":"ice-candidate","candidate":{"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 54400 typ host","sdpMid":"0","sdpMLineIndex":0}}"#;
        let ClientMessage::IceCandidate { candidate } = ClientMessage::parse(text).unwrap() else {
            panic!("expected a candidate");
        };
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(ClientMessage::parse("{not json"), Err(SignalError::InvalidJson(_))));
        assert_eq!(ClientMessage::parse(r#"{"sdp":"x"}"#), Err(SignalError::MissingType));
        assert_eq!(
            ClientMessage::parse(r#"{"type":"bye"}"#),
            Err(SignalError::UnknownType("bye".to_string()))
        );
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"offer"}"#),
            Err(SignalError::Malformed { kind: "offer", .. })
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"offer","sdp":"  "}"#),
            Err(SignalError::Malformed { kind: "offer", .. })
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"ice-candidate","candidate":{"candidate":""}}"#),
            Err(SignalError::Malformed { kind: "ice-candidate", .. })
        ));
    }

    #[test]
    fn server_messages_are_tagged() {
        let answer = ServerMessage::Answer { sdp: "v=0".to_string() }.to_json().unwrap();
        let value: Value = serde_json::from_str(&answer).unwrap();
        assert_eq!(value["type"], "answer");
        assert_eq!(value["sdp"], "v=0");

        let candidate = ServerMessage::IceCandidate { candidate: IceCandidate::new("candidate:2") }
            .to_json()
            .unwrap();
        let value: Value = serde_json::from_str(&candidate).unwrap();
        assert_eq!(value["type"], "ice-candidate");
        assert_eq!(value["candidate"]["candidate"], "candidate:2");
        assert!(value["candidate"].get("sdpMid").is_none());
    }

    proptest! {
        #[test]
        fn unknown_types_are_named_in_the_error(kind in "[a-z]{1,12}") {
            prop_assume!(kind != "offer");
            let text = serde_json::json!({ "type": kind, "sdp": "v=0" }).to_string();
            prop_assert_eq!(ClientMessage::parse(&text), Err(SignalError::UnknownType(kind)));
        }

        #[test]
        fn arbitrary_text_never_panics(text in ".{0,64}") {
            let _ = ClientMessage::parse(&text);
        }
    }
}
