//! Transport-level media state: connection states and track descriptions

use serde::{Deserialize, Serialize};

use super::TrackId;

/// Peer connection state reported by the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Loss that may still recover within the grace window
    pub fn is_transient_loss(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }

    /// The transport will never deliver again
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}

/// Kind of a received media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// A remote track announced by the transport layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub id: TrackId,
    pub kind: TrackKind,
}

impl TrackInfo {
    pub fn video(id: impl Into<String>) -> Self {
        Self { id: TrackId::new(id), kind: TrackKind::Video }
    }

    pub fn audio(id: impl Into<String>) -> Self {
        Self { id: TrackId::new(id), kind: TrackKind::Audio }
    }
}

/// Liveness notifications for an already announced track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackStatus {
    Ended,
    Muted,
    Unmuted,
}
