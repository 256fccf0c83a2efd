use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::lifecycle::LifecycleState;

/// Role asserted for a participant by the identity collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Doctor,
    Patient,
}

impl ParticipantRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ParticipantRole::Doctor => "doctor",
            ParticipantRole::Patient => "patient",
        }
    }
}

impl fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParticipantRole {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "doctor" | "clinician" => Ok(ParticipantRole::Doctor),
            "patient" => Ok(ParticipantRole::Patient),
            other => Err(format!("unknown participant role `{other}`")),
        }
    }
}

/// Media connectivity reported by a client for one of its peer links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaState {
    Connected,
    Disconnected,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    Left,
    Disconnected,
    Timeout,
    Replaced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    Responsive,
    Unresponsive,
    Unreachable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Ended,
    Timeout,
    NegotiationFailed,
    Abandoned,
}

impl EndReason {
    pub fn metric_label(self) -> &'static str {
        match self {
            EndReason::Ended => "ended",
            EndReason::Timeout => "timeout",
            EndReason::NegotiationFailed => "negotiation_failed",
            EndReason::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRef {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_conn_id: String,
    pub user_id: String,
    pub role: ParticipantRole,
    /// Whether the recipient of this record must produce the offer.
    pub is_initiator: bool,
    pub joined_at: DateTime<Utc>,
}

/// Messages sent from a client to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    JoinRoom {
        room_id: String,
    },
    LeaveRoom {
        room_id: String,
    },
    Offer {
        room_id: String,
        to_peer: String,
        payload: serde_json::Value,
    },
    Answer {
        room_id: String,
        to_peer: String,
        payload: serde_json::Value,
    },
    IceCandidate {
        room_id: String,
        to_peer: String,
        payload: serde_json::Value,
    },
    /// The sender applied the remote description received from `peer`.
    RemoteDescriptionApplied {
        room_id: String,
        peer: String,
    },
    ConnectionState {
        room_id: String,
        peer: String,
        state: MediaState,
    },
    Renegotiate {
        room_id: String,
        peer: String,
    },
    ChatMessage {
        room_id: String,
        #[serde(default)]
        sender_id: Option<String>,
        #[serde(default)]
        sender_role: Option<ParticipantRole>,
        #[serde(default)]
        text: String,
        #[serde(default)]
        file: Option<FileRef>,
        #[serde(default)]
        client_seq: Option<u64>,
    },
    TranscriptUpdate {
        room_id: String,
        text: String,
        #[serde(default)]
        sender_role: Option<ParticipantRole>,
    },
    StartSession {
        room_id: String,
    },
    EndSession {
        room_id: String,
    },
    Ping,
}

impl ClientMessage {
    pub fn op(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom { .. } => "join-room",
            ClientMessage::LeaveRoom { .. } => "leave-room",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::IceCandidate { .. } => "ice-candidate",
            ClientMessage::RemoteDescriptionApplied { .. } => "remote-description-applied",
            ClientMessage::ConnectionState { .. } => "connection-state",
            ClientMessage::Renegotiate { .. } => "renegotiate",
            ClientMessage::ChatMessage { .. } => "chat-message",
            ClientMessage::TranscriptUpdate { .. } => "transcript-update",
            ClientMessage::StartSession { .. } => "start-session",
            ClientMessage::EndSession { .. } => "end-session",
            ClientMessage::Ping => "ping",
        }
    }

    pub fn room_id(&self) -> Option<&str> {
        match self {
            ClientMessage::JoinRoom { room_id }
            | ClientMessage::LeaveRoom { room_id }
            | ClientMessage::Offer { room_id, .. }
            | ClientMessage::Answer { room_id, .. }
            | ClientMessage::IceCandidate { room_id, .. }
            | ClientMessage::RemoteDescriptionApplied { room_id, .. }
            | ClientMessage::ConnectionState { room_id, .. }
            | ClientMessage::Renegotiate { room_id, .. }
            | ClientMessage::ChatMessage { room_id, .. }
            | ClientMessage::TranscriptUpdate { room_id, .. }
            | ClientMessage::StartSession { room_id }
            | ClientMessage::EndSession { room_id } => Some(room_id),
            ClientMessage::Ping => None,
        }
    }
}

/// Messages sent from the relay to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Joined {
        room_id: String,
        connection_id: String,
        state: LifecycleState,
        peers: Vec<PeerInfo>,
        ice_servers: Vec<IceServer>,
    },
    UserJoined {
        room_id: String,
        peer_conn_id: String,
        user_id: String,
        role: ParticipantRole,
        is_initiator: bool,
    },
    UserLeft {
        room_id: String,
        peer_conn_id: String,
        reason: LeaveReason,
    },
    Offer {
        room_id: String,
        from_peer: String,
        payload: serde_json::Value,
    },
    Answer {
        room_id: String,
        from_peer: String,
        payload: serde_json::Value,
    },
    IceCandidate {
        room_id: String,
        from_peer: String,
        payload: serde_json::Value,
    },
    Renegotiate {
        room_id: String,
        from_peer: String,
    },
    NegotiationFailed {
        room_id: String,
        peer: String,
        dropped_candidates: usize,
    },
    PeerStatus {
        room_id: String,
        peer_conn_id: String,
        status: PeerStatus,
    },
    SessionState {
        room_id: String,
        state: LifecycleState,
    },
    SessionEnded {
        room_id: String,
        reason: EndReason,
    },
    ChatMessage {
        room_id: String,
        seq: u64,
        sender_id: String,
        sender_role: ParticipantRole,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file: Option<FileRef>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_seq: Option<u64>,
        timestamp: DateTime<Utc>,
    },
    TranscriptUpdate {
        room_id: String,
        seq: u64,
        sender_id: String,
        sender_role: ParticipantRole,
        text: String,
        timestamp: DateTime<Utc>,
    },
    Rejected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        op: String,
        code: ErrorCode,
        reason: String,
    },
    Pong,
    Error {
        message: String,
    },
}

/// Generate a unique connection identifier.
pub fn generate_connection_id() -> String {
    Uuid::new_v4().to_string()
}
