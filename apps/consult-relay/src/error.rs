use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by room operations.
///
/// None of these are fatal to the process. The variants that reject the
/// caller's own request are reported back to it as `rejected` envelopes;
/// `PeerUnreachable` and `Timeout` describe a participant lost by the relay;
/// they are logged and counted while the room learns of it through
/// `peer-status`, `user-left` and `session-state`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("room {room_id} is full ({capacity} participants)")]
    RoomFull { room_id: String, capacity: usize },
    #[error("stale negotiation: {0}")]
    StaleNegotiation(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("peer {0} is unreachable")]
    PeerUnreachable(String),
    #[error("liveness grace period exceeded")]
    Timeout,
    #[error("room {0} is not open for this session")]
    RoomNotPermitted(String),
    #[error("connection is not a member of room {0}")]
    NotInRoom(String),
}

impl RelayError {
    pub fn protocol(reason: impl Into<String>) -> Self {
        RelayError::ProtocolViolation(reason.into())
    }

    pub fn stale(reason: impl Into<String>) -> Self {
        RelayError::StaleNegotiation(reason.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            RelayError::RoomFull { .. } => ErrorCode::RoomFull,
            RelayError::StaleNegotiation(_) => ErrorCode::StaleNegotiation,
            RelayError::ProtocolViolation(_) => ErrorCode::ProtocolViolation,
            RelayError::PeerUnreachable(_) => ErrorCode::PeerUnreachable,
            RelayError::Timeout => ErrorCode::Timeout,
            RelayError::RoomNotPermitted(_) => ErrorCode::RoomNotPermitted,
            RelayError::NotInRoom(_) => ErrorCode::NotInRoom,
        }
    }
}

/// Stable wire and metrics label for a [`RelayError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    RoomFull,
    StaleNegotiation,
    ProtocolViolation,
    PeerUnreachable,
    Timeout,
    RoomNotPermitted,
    NotInRoom,
}

impl ErrorCode {
    pub fn metric_label(self) -> &'static str {
        match self {
            ErrorCode::RoomFull => "room_full",
            ErrorCode::StaleNegotiation => "stale_negotiation",
            ErrorCode::ProtocolViolation => "protocol_violation",
            ErrorCode::PeerUnreachable => "peer_unreachable",
            ErrorCode::Timeout => "timeout",
            ErrorCode::RoomNotPermitted => "room_not_permitted",
            ErrorCode::NotInRoom => "not_in_room",
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn lost_participant_errors_carry_their_labels() {
        let err = RelayError::PeerUnreachable("c-1".into());
        assert_eq!(err.code().metric_label(), "peer_unreachable");
        assert_eq!(err.to_string(), "peer c-1 is unreachable");
        assert_eq!(RelayError::Timeout.code(), ErrorCode::Timeout);
    }
}
