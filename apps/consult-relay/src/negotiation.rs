use std::fmt;

use serde_json::Value;

use crate::candidates::{Admission, CandidateQueue};
use crate::error::{RelayError, RelayResult};
use crate::protocol::MediaState;

/// Unordered pair of connections inside one room.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairKey {
    room_id: String,
    low: String,
    high: String,
}

impl PairKey {
    pub fn new(room_id: &str, a: &str, b: &str) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self {
            room_id: room_id.to_string(),
            low: low.to_string(),
            high: high.to_string(),
        }
    }

    pub fn contains(&self, conn_id: &str) -> bool {
        self.low == conn_id || self.high == conn_id
    }

    pub fn other(&self, conn_id: &str) -> Option<&str> {
        if self.low == conn_id {
            Some(&self.high)
        } else if self.high == conn_id {
            Some(&self.low)
        } else {
            None
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}<->{}", self.room_id, self.low, self.high)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    AwaitingOffer,
    OfferSent,
    AnswerSent,
    Established,
    Failed,
}

/// What a media connectivity report did to the pair.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaOutcome {
    /// Recorded; still waiting for the other endpoint.
    Pending,
    /// Both endpoints report media. Candidates still held are returned per
    /// consumer so they can be delivered.
    Established { flushed: Vec<(String, Vec<Value>)> },
    /// A previously established link reports connected again.
    Recovered,
    LinkDown,
    Failed { dropped: usize },
}

/// Offer/answer state for one pair, together with its candidate queues.
#[derive(Debug, Clone)]
pub struct NegotiationSession {
    key: PairKey,
    initiator: String,
    state: NegotiationState,
    renegotiating: bool,
    to_low: CandidateQueue,
    to_high: CandidateQueue,
    low_connected: bool,
    high_connected: bool,
    link_down: bool,
}

impl NegotiationSession {
    pub fn new(key: PairKey, initiator: &str, queue_cap: usize) -> Self {
        debug_assert!(key.contains(initiator));
        Self {
            key,
            initiator: initiator.to_string(),
            state: NegotiationState::AwaitingOffer,
            renegotiating: false,
            to_low: CandidateQueue::new(queue_cap),
            to_high: CandidateQueue::new(queue_cap),
            low_connected: false,
            high_connected: false,
            link_down: false,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn initiator(&self) -> &str {
        &self.initiator
    }

    pub fn responder(&self) -> &str {
        self.key.other(&self.initiator).unwrap_or_default()
    }

    pub fn is_initiator(&self, conn_id: &str) -> bool {
        self.initiator == conn_id
    }

    pub fn is_renegotiating(&self) -> bool {
        self.renegotiating
    }

    pub fn is_established(&self) -> bool {
        self.state == NegotiationState::Established
    }

    pub fn is_impaired(&self) -> bool {
        self.link_down || self.state == NegotiationState::Failed
    }

    pub fn pending_candidates(&self) -> usize {
        self.to_low.len() + self.to_high.len()
    }

    pub fn accept_offer(&mut self, from: &str) -> RelayResult<()> {
        match self.state {
            NegotiationState::Established => {
                return Err(RelayError::stale("pair is already established"))
            }
            NegotiationState::Failed => {
                return Err(RelayError::stale(
                    "negotiation failed; renegotiate before offering",
                ))
            }
            _ => {}
        }
        if !self.is_initiator(from) {
            return Err(RelayError::protocol("not_initiator"));
        }
        self.state = NegotiationState::OfferSent;
        Ok(())
    }

    /// Accepts the responder's answer. Answering proves the responder applied
    /// the offer, so the candidates held for it are returned for delivery.
    pub fn accept_answer(&mut self, from: &str) -> RelayResult<Vec<Value>> {
        if self.state != NegotiationState::OfferSent {
            return Err(RelayError::protocol("answer without prior offer"));
        }
        if self.is_initiator(from) {
            return Err(RelayError::protocol("only the responder may answer"));
        }
        self.state = NegotiationState::AnswerSent;
        Ok(self.queue_toward(from).flush())
    }

    pub fn route_candidate(&mut self, from: &str, candidate: Value) -> RelayResult<Admission> {
        if self.state == NegotiationState::Failed {
            return Err(RelayError::stale("negotiation failed for this pair"));
        }
        let consumer = self
            .key
            .other(from)
            .ok_or_else(|| RelayError::protocol("sender is not part of this pair"))?
            .to_string();
        self.queue_toward(&consumer)
            .enqueue(candidate)
            .map_err(|_| RelayError::protocol("candidate_queue_full"))
    }

    /// `consumer` applied the remote description; returns the candidates held
    /// for it in submission order.
    pub fn description_applied(&mut self, consumer: &str) -> RelayResult<Vec<Value>> {
        match self.state {
            NegotiationState::Failed => {
                Err(RelayError::stale("negotiation failed for this pair"))
            }
            NegotiationState::AwaitingOffer => {
                Err(RelayError::protocol("no remote description has been relayed"))
            }
            _ => Ok(self.queue_toward(consumer).flush()),
        }
    }

    pub fn report_media(&mut self, reporter: &str, media: MediaState) -> RelayResult<MediaOutcome> {
        if !self.key.contains(reporter) {
            return Err(RelayError::protocol("reporter is not part of this pair"));
        }
        match media {
            MediaState::Connected => {
                if self.state == NegotiationState::AwaitingOffer {
                    return Err(RelayError::protocol("media reported before any offer"));
                }
                if self.state == NegotiationState::Failed {
                    return Err(RelayError::stale("negotiation failed for this pair"));
                }
                self.set_connected(reporter, true);
                let was_down = std::mem::replace(&mut self.link_down, false);
                if self.state == NegotiationState::Established {
                    return Ok(if was_down {
                        MediaOutcome::Recovered
                    } else {
                        MediaOutcome::Pending
                    });
                }
                if self.low_connected && self.high_connected {
                    self.state = NegotiationState::Established;
                    self.renegotiating = false;
                    let mut flushed = Vec::new();
                    let low = self.key.low.clone();
                    let high = self.key.high.clone();
                    let to_low = self.to_low.flush();
                    if !to_low.is_empty() {
                        flushed.push((low, to_low));
                    }
                    let to_high = self.to_high.flush();
                    if !to_high.is_empty() {
                        flushed.push((high, to_high));
                    }
                    return Ok(MediaOutcome::Established { flushed });
                }
                Ok(MediaOutcome::Pending)
            }
            MediaState::Disconnected => {
                self.set_connected(reporter, false);
                self.link_down = true;
                Ok(MediaOutcome::LinkDown)
            }
            MediaState::Failed => Ok(MediaOutcome::Failed {
                dropped: self.fail(),
            }),
        }
    }

    /// Marks the pair failed and discards held candidates.
    pub fn fail(&mut self) -> usize {
        self.state = NegotiationState::Failed;
        self.low_connected = false;
        self.high_connected = false;
        self.link_down = false;
        self.to_low.clear() + self.to_high.clear()
    }

    /// Returns the pair to `AwaitingOffer` keeping its key, roles and any
    /// held candidates.
    pub fn renegotiate(&mut self) {
        self.state = NegotiationState::AwaitingOffer;
        self.renegotiating = true;
        self.low_connected = false;
        self.high_connected = false;
        self.link_down = false;
        self.to_low.reopen();
        self.to_high.reopen();
    }

    fn set_connected(&mut self, conn_id: &str, connected: bool) {
        if self.key.low == conn_id {
            self.low_connected = connected;
        } else if self.key.high == conn_id {
            self.high_connected = connected;
        }
    }

    fn queue_toward(&mut self, consumer: &str) -> &mut CandidateQueue {
        if self.key.low == consumer {
            &mut self.to_low
        } else {
            &mut self.to_high
        }
    }
}
