use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle of a consultation room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Fewer than two participants.
    Idle,
    /// At least one pair is exchanging offer/answer.
    Negotiating,
    /// Every pair reported established media.
    Connected,
    /// Liveness or media connectivity lost; recovery still possible.
    Degraded,
    /// Terminal.
    Closed,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Negotiating => "negotiating",
            LifecycleState::Connected => "connected",
            LifecycleState::Degraded => "degraded",
            LifecycleState::Closed => "closed",
        }
    }

    /// Whether the lifecycle may move from `self` to `next`.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Idle, Negotiating) | (Idle, Degraded) => true,
            (Negotiating, Idle) | (Negotiating, Connected) | (Negotiating, Degraded) => true,
            (Connected, Idle) | (Connected, Negotiating) | (Connected, Degraded) => true,
            (Degraded, Idle) | (Degraded, Negotiating) | (Degraded, Connected) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("invalid lifecycle transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

/// Current lifecycle state plus the instant it was entered.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: LifecycleState,
    since: Instant,
}

impl Lifecycle {
    pub fn new(now: Instant) -> Self {
        Self {
            state: LifecycleState::Idle,
            since: now,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == LifecycleState::Closed
    }

    /// Moves to `next`. Returns `Ok(None)` when already there, `Ok(Some(next))`
    /// on a change.
    pub fn advance(
        &mut self,
        next: LifecycleState,
        now: Instant,
    ) -> Result<Option<LifecycleState>, InvalidTransition> {
        if self.state == next {
            return Ok(None);
        }
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.since = now;
        Ok(Some(next))
    }

    /// True once the room has been degraded for at least `grace`.
    pub fn degraded_longer_than(&self, grace: Duration, now: Instant) -> bool {
        self.state == LifecycleState::Degraded && now.saturating_duration_since(self.since) >= grace
    }
}

/// Facts about a room from which its lifecycle state is derived.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoomFacts {
    pub participants: usize,
    pub pairs: usize,
    pub established_pairs: usize,
    /// Unresponsive participants, link-down reports, failed pairs or a
    /// participant lost to a liveness timeout awaiting rejoin.
    pub impaired: bool,
}

impl RoomFacts {
    pub fn target_state(&self) -> LifecycleState {
        if self.impaired {
            LifecycleState::Degraded
        } else if self.participants < 2 {
            LifecycleState::Idle
        } else if self.pairs > 0 && self.established_pairs == self.pairs {
            LifecycleState::Connected
        } else {
            LifecycleState::Negotiating
        }
    }
}
