//! ICE candidate payload exchanged over signaling

use serde::{Deserialize, Serialize};

/// ICE candidate in `RTCIceCandidateInit` shape
///
/// The bridge never interprets the candidate line itself; it only moves it between the
/// signaling channel and the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// The `candidate:` attribute line
    pub candidate: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Create a candidate with only the attribute line set
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    /// Short prefix of the candidate line for log output
    pub fn summary(&self) -> &str {
        let end = self.candidate.char_indices().nth(24).map_or(self.candidate.len(), |(i, _)| i);
        &self.candidate[..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn browser_field_names() {
        let json = r#"{"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host","sdpMid":"0","sdpMLineIndex":0}"#;
        let candidate: IceCandidate = serde_json::from_str(json).unwrap();

        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert!(candidate.username_fragment.is_none());

        let back = serde_json::to_value(&candidate).unwrap();
        assert_eq!(back["sdpMLineIndex"], 0);
        assert!(back.get("usernameFragment").is_none());
    }

    #[test]
    fn summary_truncates_on_char_boundary() {
        let candidate = IceCandidate::new("candidate:1 1 udp 2122260223 192.168.1.5 50000 typ host");
        assert_eq!(candidate.summary(), "candidate:1 1 udp 212226");
        assert_eq!(IceCandidate::new("short").summary(), "short");
    }
}
