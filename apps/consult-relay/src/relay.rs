use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use chrono::Utc;

use crate::error::{RelayError, RelayResult};
use crate::protocol::{FileRef, ParticipantRole, ServerMessage};

pub const DEFAULT_TRANSCRIPT_DEDUP_WINDOW: Duration = Duration::from_millis(3_000);

#[derive(Debug, Clone)]
struct DeliveredFragment {
    role: ParticipantRole,
    text: String,
    at: Instant,
}

/// Per-room chat and transcript envelope builder.
///
/// Stamps every event with a strictly increasing room sequence number and
/// suppresses transcript fragments re-emitted by a restarting recognizer.
#[derive(Debug, Clone)]
pub struct EventRelay {
    next_seq: u64,
    dedup_window: Duration,
    recent: VecDeque<DeliveredFragment>,
}

pub struct ChatInput {
    pub sender_id: String,
    pub sender_role: ParticipantRole,
    pub text: String,
    pub file: Option<FileRef>,
    pub client_seq: Option<u64>,
}

impl EventRelay {
    pub fn new(dedup_window: Duration) -> Self {
        Self {
            next_seq: 1,
            dedup_window,
            recent: VecDeque::new(),
        }
    }

    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn chat(&mut self, room_id: &str, input: ChatInput) -> RelayResult<ServerMessage> {
        let text = input.text.trim().to_string();
        if text.is_empty() && input.file.is_none() {
            return Err(RelayError::protocol("chat message has neither text nor file"));
        }
        Ok(ServerMessage::ChatMessage {
            room_id: room_id.to_string(),
            seq: self.take_seq(),
            sender_id: input.sender_id,
            sender_role: input.sender_role,
            text,
            file: input.file,
            client_seq: input.client_seq,
            timestamp: Utc::now(),
        })
    }

    /// Builds a transcript envelope, or `Ok(None)` when the same role sent the
    /// same text within the de-duplication window.
    pub fn transcript(
        &mut self,
        room_id: &str,
        sender_id: &str,
        sender_role: ParticipantRole,
        text: &str,
        now: Instant,
    ) -> RelayResult<Option<ServerMessage>> {
        let text = text.trim();
        if text.is_empty() {
            return Err(RelayError::protocol("transcript fragment is empty"));
        }
        if !self.admit_fragment(sender_role, text, now) {
            return Ok(None);
        }
        Ok(Some(ServerMessage::TranscriptUpdate {
            room_id: room_id.to_string(),
            seq: self.take_seq(),
            sender_id: sender_id.to_string(),
            sender_role,
            text: text.to_string(),
            timestamp: Utc::now(),
        }))
    }

    fn admit_fragment(&mut self, role: ParticipantRole, text: &str, now: Instant) -> bool {
        let window = self.dedup_window;
        while let Some(front) = self.recent.front() {
            if now.saturating_duration_since(front.at) >= window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        if self
            .recent
            .iter()
            .any(|fragment| fragment.role == role && fragment.text == text)
        {
            return false;
        }
        self.recent.push_back(DeliveredFragment {
            role,
            text: text.to_string(),
            at: now,
        });
        true
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

impl Default for EventRelay {
    fn default() -> Self {
        Self::new(DEFAULT_TRANSCRIPT_DEDUP_WINDOW)
    }
}
