use std::{
    collections::HashMap,
    sync::Arc,
    time::Instant,
};

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::candidates::Admission;
use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::identity::Identity;
use crate::lifecycle::{Lifecycle, LifecycleState, RoomFacts};
use crate::negotiation::{MediaOutcome, NegotiationSession, NegotiationState, PairKey};
use crate::protocol::{
    EndReason, FileRef, LeaveReason, MediaState, ParticipantRole, PeerInfo, PeerStatus,
    ServerMessage,
};
use crate::relay::{ChatInput, EventRelay};

pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

/// Side effects the caller performs after releasing the room lock.
#[derive(Debug, Default)]
pub struct Effects {
    /// The room reached `Closed` during the operation.
    pub closed: Option<EndReason>,
    /// Delivered chat/transcript envelopes to offer to the persistence sink.
    pub persist: Vec<ServerMessage>,
    pub session_started: bool,
}

impl Effects {
    fn merge(&mut self, other: Effects) {
        self.closed = self.closed.or(other.closed);
        self.persist.extend(other.persist);
        self.session_started |= other.session_started;
    }
}

struct Participant {
    conn_id: String,
    identity: Identity,
    joined_at: DateTime<Utc>,
    last_seen: Instant,
    responsive: bool,
    tx: Outbound,
}

pub struct ChatRequest {
    pub sender_id: Option<String>,
    pub sender_role: Option<ParticipantRole>,
    pub text: String,
    pub file: Option<FileRef>,
    pub client_seq: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSnapshot {
    pub conn_id: String,
    pub user_id: String,
    pub role: ParticipantRole,
    pub responsive: bool,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room_id: String,
    pub state: LifecycleState,
    pub created_at: DateTime<Utc>,
    pub participants: Vec<ParticipantSnapshot>,
    pub pairs: usize,
    pub pending_candidates: usize,
    pub last_seq: u64,
}

/// One consultation room. All mutation happens under the owning
/// [`crate::registry::RoomRegistry`] cell lock, so methods here are
/// synchronous and never await.
pub struct Room {
    id: String,
    created_at: DateTime<Utc>,
    participants: Vec<Participant>,
    lifecycle: Lifecycle,
    pairs: HashMap<PairKey, NegotiationSession>,
    relay: EventRelay,
    emptied_at: Option<Instant>,
    awaiting_rejoin: bool,
    negotiation_failures: u32,
    config: Arc<RelayConfig>,
}

impl Room {
    pub fn new(id: &str, config: Arc<RelayConfig>, now: Instant) -> Self {
        Self {
            id: id.to_string(),
            created_at: Utc::now(),
            participants: Vec::new(),
            lifecycle: Lifecycle::new(now),
            pairs: HashMap::new(),
            relay: EventRelay::new(config.transcript_dedup_window),
            emptied_at: Some(now),
            awaiting_rejoin: false,
            negotiation_failures: 0,
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.is_closed()
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn contains(&self, conn_id: &str) -> bool {
        self.position(conn_id).is_some()
    }

    /// Whether `conn_id` produces the offer toward `peer`.
    pub fn is_initiator(&self, conn_id: &str, peer: &str) -> Option<bool> {
        self.pairs
            .get(&PairKey::new(&self.id, conn_id, peer))
            .map(|pair| pair.is_initiator(conn_id))
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            room_id: self.id.clone(),
            state: self.state(),
            created_at: self.created_at,
            participants: self
                .participants
                .iter()
                .map(|participant| ParticipantSnapshot {
                    conn_id: participant.conn_id.clone(),
                    user_id: participant.identity.user_id.clone(),
                    role: participant.identity.role,
                    responsive: participant.responsive,
                    joined_at: participant.joined_at,
                })
                .collect(),
            pairs: self.pairs.len(),
            pending_candidates: self
                .pairs
                .values()
                .map(NegotiationSession::pending_candidates)
                .sum(),
            last_seq: self.relay.last_seq(),
        }
    }

    // ---------------------------------------------------------------------
    // Membership
    // ---------------------------------------------------------------------

    pub fn join(
        &mut self,
        conn_id: &str,
        identity: Identity,
        tx: Outbound,
        now: Instant,
    ) -> RelayResult<Effects> {
        if self.is_closed() {
            return Err(RelayError::stale(format!("room {} is closed", self.id)));
        }
        if self.contains(conn_id) {
            return Err(RelayError::protocol("connection already joined this room"));
        }

        let mut effects = Effects::default();

        // A reconnecting user replaces its own unresponsive connection.
        if let Some(stale) = self
            .participants
            .iter()
            .find(|p| !p.responsive && p.identity.user_id == identity.user_id)
            .map(|p| p.conn_id.clone())
        {
            info!(
                room_id = %self.id,
                old_connection = %stale,
                new_connection = %conn_id,
                "replacing unresponsive connection of rejoining user"
            );
            self.remove_participant(&stale, LeaveReason::Replaced);
        }

        if self.participants.len() >= self.config.max_participants {
            return Err(RelayError::RoomFull {
                room_id: self.id.clone(),
                capacity: self.config.max_participants,
            });
        }

        let joined_at = Utc::now();
        let existing: Vec<PeerInfo> = self
            .participants
            .iter()
            .map(|peer| PeerInfo {
                peer_conn_id: peer.conn_id.clone(),
                user_id: peer.identity.user_id.clone(),
                role: peer.identity.role,
                is_initiator: true,
                joined_at: peer.joined_at,
            })
            .collect();

        for peer in &existing {
            let key = PairKey::new(&self.id, &peer.peer_conn_id, conn_id);
            self.pairs.insert(
                key.clone(),
                NegotiationSession::new(key, conn_id, self.config.candidate_queue_cap),
            );
        }

        self.participants.push(Participant {
            conn_id: conn_id.to_string(),
            identity: identity.clone(),
            joined_at,
            last_seen: now,
            responsive: true,
            tx,
        });
        self.emptied_at = None;
        if self.participants.len() >= 2 {
            self.awaiting_rejoin = false;
        }

        let ack = ServerMessage::Joined {
            room_id: self.id.clone(),
            connection_id: conn_id.to_string(),
            state: self.facts().target_state(),
            peers: existing.clone(),
            ice_servers: self.config.ice_servers.clone(),
        };
        self.deliver(conn_id, ack);

        for peer in &existing {
            self.deliver(
                conn_id,
                ServerMessage::UserJoined {
                    room_id: self.id.clone(),
                    peer_conn_id: peer.peer_conn_id.clone(),
                    user_id: peer.user_id.clone(),
                    role: peer.role,
                    is_initiator: true,
                },
            );
            self.deliver(
                &peer.peer_conn_id,
                ServerMessage::UserJoined {
                    room_id: self.id.clone(),
                    peer_conn_id: conn_id.to_string(),
                    user_id: identity.user_id.clone(),
                    role: identity.role,
                    is_initiator: false,
                },
            );
        }

        info!(
            room_id = %self.id,
            connection_id = %conn_id,
            user_id = %identity.user_id,
            role = %identity.role,
            participants = self.participants.len(),
            "participant joined"
        );

        effects.merge(self.refresh(now));
        Ok(effects)
    }

    pub fn leave(&mut self, conn_id: &str, reason: LeaveReason, now: Instant) -> RelayResult<Effects> {
        if !self.remove_participant(conn_id, reason) {
            return Err(RelayError::NotInRoom(self.id.clone()));
        }
        // Only an explicit leave spares the room from waiting on a rejoin.
        if matches!(reason, LeaveReason::Disconnected | LeaveReason::Timeout) {
            self.awaiting_rejoin = true;
        }
        if self.participants.is_empty() {
            self.emptied_at = Some(now);
            self.awaiting_rejoin = false;
        }
        Ok(self.refresh(now))
    }

    /// Records traffic from `conn_id`; an unresponsive participant recovers.
    pub fn touch(&mut self, conn_id: &str, now: Instant) -> Effects {
        let Some(idx) = self.position(conn_id) else {
            return Effects::default();
        };
        let participant = &mut self.participants[idx];
        participant.last_seen = now;
        if participant.responsive {
            return Effects::default();
        }
        participant.responsive = true;
        debug!(room_id = %self.id, connection_id = %conn_id, "participant responsive again");
        self.broadcast_except(
            Some(conn_id),
            ServerMessage::PeerStatus {
                room_id: self.id.clone(),
                peer_conn_id: conn_id.to_string(),
                status: PeerStatus::Responsive,
            },
        );
        self.refresh(now)
    }

    /// Periodic liveness pass.
    pub fn sweep(&mut self, now: Instant) -> Effects {
        let mut effects = Effects::default();
        if self.is_closed() {
            return effects;
        }

        let degrade_after = self.config.degrade_after();
        let timeout = self.config.heartbeat_timeout;
        let mut timed_out = Vec::new();
        let mut newly_unresponsive = Vec::new();
        for participant in &mut self.participants {
            let silence = now.saturating_duration_since(participant.last_seen);
            if silence >= timeout {
                timed_out.push(participant.conn_id.clone());
            } else if silence >= degrade_after && participant.responsive {
                participant.responsive = false;
                newly_unresponsive.push(participant.conn_id.clone());
            }
        }

        for conn_id in newly_unresponsive {
            warn!(room_id = %self.id, connection_id = %conn_id, "participant missed heartbeats");
            self.broadcast_except(
                Some(&conn_id),
                ServerMessage::PeerStatus {
                    room_id: self.id.clone(),
                    peer_conn_id: conn_id.clone(),
                    status: PeerStatus::Unresponsive,
                },
            );
        }

        for conn_id in timed_out {
            let err = RelayError::Timeout;
            warn!(room_id = %self.id, connection_id = %conn_id, error = %err, "participant removed");
            counter!(
                "consult_relay_participant_timeouts_total",
                1,
                "code" => err.code().metric_label()
            );
            if let Ok(left) = self.leave(&conn_id, LeaveReason::Timeout, now) {
                effects.merge(left);
            }
        }

        effects.merge(self.refresh(now));
        if self.is_closed() {
            return effects;
        }

        if self
            .lifecycle
            .degraded_longer_than(self.config.reconnect_grace, now)
        {
            effects.closed = Some(self.close(EndReason::Timeout, now));
        } else if let Some(emptied_at) = self.emptied_at {
            if self.participants.is_empty()
                && now.saturating_duration_since(emptied_at) >= self.config.empty_room_grace
            {
                effects.closed = Some(self.close(EndReason::Abandoned, now));
            }
        }
        effects
    }

    // ---------------------------------------------------------------------
    // Negotiation
    // ---------------------------------------------------------------------

    pub fn relay_offer(
        &mut self,
        from: &str,
        to: &str,
        payload: Value,
        now: Instant,
    ) -> RelayResult<Effects> {
        let key = self.signal_pair(from, to)?;
        let pair = self
            .pairs
            .get_mut(&key)
            .ok_or_else(|| RelayError::protocol("no negotiation exists for this pair"))?;
        pair.accept_offer(from)?;
        self.forward(
            from,
            to,
            "offer",
            ServerMessage::Offer {
                room_id: self.id.clone(),
                from_peer: from.to_string(),
                payload,
            },
        );
        Ok(self.refresh(now))
    }

    pub fn relay_answer(
        &mut self,
        from: &str,
        to: &str,
        payload: Value,
        now: Instant,
    ) -> RelayResult<Effects> {
        let key = self.signal_pair(from, to)?;
        let pair = self
            .pairs
            .get_mut(&key)
            .ok_or_else(|| RelayError::protocol("answer without prior offer"))?;
        let held = pair.accept_answer(from)?;
        self.forward(
            from,
            to,
            "answer",
            ServerMessage::Answer {
                room_id: self.id.clone(),
                from_peer: from.to_string(),
                payload,
            },
        );
        self.deliver_candidates(to, from, held);
        Ok(self.refresh(now))
    }

    pub fn relay_candidate(
        &mut self,
        from: &str,
        to: &str,
        candidate: Value,
    ) -> RelayResult<Effects> {
        let key = self.signal_pair(from, to)?;
        let pair = self
            .pairs
            .get_mut(&key)
            .ok_or_else(|| RelayError::protocol("ICE candidate for nonexistent pair"))?;
        match pair.route_candidate(from, candidate)? {
            Admission::Forward(candidate) => {
                self.forward(
                    from,
                    to,
                    "ice_candidate",
                    ServerMessage::IceCandidate {
                        room_id: self.id.clone(),
                        from_peer: from.to_string(),
                        payload: candidate,
                    },
                );
            }
            Admission::Queued { depth } => {
                counter!("consult_relay_candidates_queued_total", 1);
                debug!(room_id = %self.id, from = %from, to = %to, depth, "queued ICE candidate");
            }
        }
        Ok(Effects::default())
    }

    /// `consumer` applied the remote description it received from `peer`.
    pub fn description_applied(&mut self, consumer: &str, peer: &str) -> RelayResult<Effects> {
        let key = self.signal_pair(consumer, peer)?;
        let pair = self
            .pairs
            .get_mut(&key)
            .ok_or_else(|| RelayError::protocol("no negotiation exists for this pair"))?;
        let held = pair.description_applied(consumer)?;
        self.deliver_candidates(peer, consumer, held);
        Ok(Effects::default())
    }

    pub fn connection_state(
        &mut self,
        reporter: &str,
        peer: &str,
        media: MediaState,
        now: Instant,
    ) -> RelayResult<Effects> {
        let key = self.signal_pair(reporter, peer)?;
        let pair = self
            .pairs
            .get_mut(&key)
            .ok_or_else(|| RelayError::protocol("no negotiation exists for this pair"))?;
        match pair.report_media(reporter, media)? {
            MediaOutcome::Established { flushed } => {
                info!(room_id = %self.id, pair = %key, "pair established");
                for (consumer, candidates) in flushed {
                    let producer = key.other(&consumer).unwrap_or_default().to_string();
                    self.deliver_candidates(&producer, &consumer, candidates);
                }
            }
            MediaOutcome::Failed { dropped } => {
                self.negotiation_failures += 1;
                warn!(
                    room_id = %self.id,
                    pair = %key,
                    dropped,
                    failures = self.negotiation_failures,
                    "negotiation failed"
                );
                self.deliver(
                    reporter,
                    ServerMessage::NegotiationFailed {
                        room_id: self.id.clone(),
                        peer: peer.to_string(),
                        dropped_candidates: dropped,
                    },
                );
                self.deliver(
                    peer,
                    ServerMessage::NegotiationFailed {
                        room_id: self.id.clone(),
                        peer: reporter.to_string(),
                        dropped_candidates: dropped,
                    },
                );
            }
            MediaOutcome::LinkDown => {
                debug!(room_id = %self.id, pair = %key, reporter = %reporter, "media link down");
            }
            MediaOutcome::Recovered | MediaOutcome::Pending => {}
        }

        let mut effects = Effects::default();
        if self.negotiation_failures >= self.config.max_negotiation_failures {
            effects.closed = Some(self.close(EndReason::NegotiationFailed, now));
            return Ok(effects);
        }
        effects.merge(self.refresh(now));
        Ok(effects)
    }

    /// Resets the pair for an ICE restart, keeping its key, roles and held
    /// candidates.
    pub fn renegotiate(&mut self, from: &str, peer: &str, now: Instant) -> RelayResult<Effects> {
        let key = self.signal_pair(from, peer)?;
        let pair = self
            .pairs
            .get_mut(&key)
            .ok_or_else(|| RelayError::protocol("no negotiation exists for this pair"))?;
        if matches!(
            pair.state(),
            NegotiationState::AwaitingOffer | NegotiationState::OfferSent
        ) {
            return Err(RelayError::protocol("pair is still negotiating"));
        }
        pair.renegotiate();
        info!(room_id = %self.id, pair = %key, requested_by = %from, "renegotiating pair");
        self.forward(
            from,
            peer,
            "renegotiate",
            ServerMessage::Renegotiate {
                room_id: self.id.clone(),
                from_peer: from.to_string(),
            },
        );
        Ok(self.refresh(now))
    }

    // ---------------------------------------------------------------------
    // Chat / transcript
    // ---------------------------------------------------------------------

    pub fn publish_chat(&mut self, from: &str, request: ChatRequest) -> RelayResult<Effects> {
        let identity = self.sender_identity(from, request.sender_id.as_deref(), request.sender_role)?;
        let message = self.relay.chat(
            &self.id,
            ChatInput {
                sender_id: identity.user_id,
                sender_role: identity.role,
                text: request.text,
                file: request.file,
                client_seq: request.client_seq,
            },
        )?;
        self.broadcast_except(Some(from), message.clone());
        counter!("consult_relay_events_relayed_total", 1, "kind" => "chat");
        Ok(Effects {
            persist: vec![message],
            ..Effects::default()
        })
    }

    pub fn publish_transcript(
        &mut self,
        from: &str,
        text: &str,
        claimed_role: Option<ParticipantRole>,
        now: Instant,
    ) -> RelayResult<Effects> {
        let identity = self.sender_identity(from, None, claimed_role)?;
        let Some(message) =
            self.relay
                .transcript(&self.id, &identity.user_id, identity.role, text, now)?
        else {
            counter!("consult_relay_transcripts_deduplicated_total", 1);
            debug!(room_id = %self.id, connection_id = %from, "dropped duplicate transcript fragment");
            return Ok(Effects::default());
        };
        self.broadcast_except(Some(from), message.clone());
        counter!("consult_relay_events_relayed_total", 1, "kind" => "transcript");
        Ok(Effects {
            persist: vec![message],
            ..Effects::default()
        })
    }

    // ---------------------------------------------------------------------
    // Application commands
    // ---------------------------------------------------------------------

    pub fn start_session(&mut self, from: &str) -> RelayResult<Effects> {
        self.require_member(from)?;
        info!(room_id = %self.id, connection_id = %from, "session started");
        self.broadcast_except(
            None,
            ServerMessage::SessionState {
                room_id: self.id.clone(),
                state: self.state(),
            },
        );
        Ok(Effects {
            session_started: true,
            ..Effects::default()
        })
    }

    pub fn end_session(&mut self, from: &str, now: Instant) -> RelayResult<Effects> {
        self.require_member(from)?;
        info!(room_id = %self.id, connection_id = %from, "session ended by participant");
        Ok(Effects {
            closed: Some(self.close(EndReason::Ended, now)),
            ..Effects::default()
        })
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn position(&self, conn_id: &str) -> Option<usize> {
        self.participants.iter().position(|p| p.conn_id == conn_id)
    }

    fn require_member(&self, conn_id: &str) -> RelayResult<usize> {
        self.position(conn_id)
            .ok_or_else(|| RelayError::NotInRoom(self.id.clone()))
    }

    /// Validates a signaling message between two members and returns the
    /// pair key.
    fn signal_pair(&self, from: &str, to: &str) -> RelayResult<PairKey> {
        self.require_member(from)?;
        if from == to {
            return Err(RelayError::protocol("cannot signal to self"));
        }
        if !self.contains(to) {
            return Err(RelayError::stale(format!(
                "peer {to} is no longer in room {}",
                self.id
            )));
        }
        Ok(PairKey::new(&self.id, from, to))
    }

    fn sender_identity(
        &self,
        conn_id: &str,
        claimed_id: Option<&str>,
        claimed_role: Option<ParticipantRole>,
    ) -> RelayResult<Identity> {
        let idx = self.require_member(conn_id)?;
        let identity = &self.participants[idx].identity;
        if claimed_id.is_some_and(|claimed| claimed != identity.user_id) {
            return Err(RelayError::protocol("sender id does not match connection identity"));
        }
        if claimed_role.is_some_and(|claimed| claimed != identity.role) {
            return Err(RelayError::protocol("sender role does not match connection identity"));
        }
        Ok(identity.clone())
    }

    fn remove_participant(&mut self, conn_id: &str, reason: LeaveReason) -> bool {
        let Some(idx) = self.position(conn_id) else {
            return false;
        };
        self.participants.remove(idx);
        self.pairs.retain(|key, _| !key.contains(conn_id));
        info!(
            room_id = %self.id,
            connection_id = %conn_id,
            reason = ?reason,
            participants = self.participants.len(),
            "participant left"
        );
        self.broadcast_except(
            None,
            ServerMessage::UserLeft {
                room_id: self.id.clone(),
                peer_conn_id: conn_id.to_string(),
                reason,
            },
        );
        true
    }

    fn facts(&self) -> RoomFacts {
        RoomFacts {
            participants: self.participants.len(),
            pairs: self.pairs.len(),
            established_pairs: self.pairs.values().filter(|p| p.is_established()).count(),
            impaired: self.awaiting_rejoin
                || self.participants.iter().any(|p| !p.responsive)
                || self.pairs.values().any(NegotiationSession::is_impaired),
        }
    }

    /// Re-derives the lifecycle state and announces a change to the room.
    fn refresh(&mut self, now: Instant) -> Effects {
        let target = self.facts().target_state();
        match self.lifecycle.advance(target, now) {
            Ok(Some(state)) => {
                info!(room_id = %self.id, state = state.as_str(), "room lifecycle changed");
                self.broadcast_except(
                    None,
                    ServerMessage::SessionState {
                        room_id: self.id.clone(),
                        state,
                    },
                );
            }
            Ok(None) => {}
            Err(err) => debug!(room_id = %self.id, error = %err, "lifecycle transition skipped"),
        }
        Effects::default()
    }

    fn close(&mut self, reason: EndReason, now: Instant) -> EndReason {
        if let Err(err) = self.lifecycle.advance(LifecycleState::Closed, now) {
            debug!(room_id = %self.id, error = %err, "room already closed");
            return reason;
        }
        info!(room_id = %self.id, reason = reason.metric_label(), "room closed");
        counter!(
            "consult_relay_rooms_closed_total",
            1,
            "reason" => reason.metric_label()
        );
        self.broadcast_except(
            None,
            ServerMessage::SessionEnded {
                room_id: self.id.clone(),
                reason,
            },
        );
        self.participants.clear();
        self.pairs.clear();
        reason
    }

    /// Sends to one participant. A closed channel marks it unresponsive.
    fn deliver(&mut self, conn_id: &str, message: ServerMessage) -> bool {
        let Some(idx) = self.position(conn_id) else {
            return false;
        };
        let participant = &mut self.participants[idx];
        if participant.tx.send(message).is_ok() {
            return true;
        }
        let err = RelayError::PeerUnreachable(conn_id.to_string());
        warn!(room_id = %self.id, error = %err, "outbound channel closed");
        counter!(
            "consult_relay_rejections_total",
            1,
            "code" => err.code().metric_label()
        );
        participant.responsive = false;
        false
    }

    /// Delivers a signaling message; on failure the sender learns the peer is
    /// unreachable.
    fn forward(&mut self, from: &str, to: &str, kind: &'static str, message: ServerMessage) {
        if self.deliver(to, message) {
            counter!("consult_relay_signals_forwarded_total", 1, "kind" => kind);
            return;
        }
        self.deliver(
            from,
            ServerMessage::PeerStatus {
                room_id: self.id.clone(),
                peer_conn_id: to.to_string(),
                status: PeerStatus::Unreachable,
            },
        );
    }

    fn deliver_candidates(&mut self, producer: &str, consumer: &str, candidates: Vec<Value>) {
        if candidates.is_empty() {
            return;
        }
        debug!(
            room_id = %self.id,
            from = %producer,
            to = %consumer,
            count = candidates.len(),
            "flushing held ICE candidates"
        );
        for candidate in candidates {
            self.forward(
                producer,
                consumer,
                "ice_candidate",
                ServerMessage::IceCandidate {
                    room_id: self.id.clone(),
                    from_peer: producer.to_string(),
                    payload: candidate,
                },
            );
        }
    }

    fn broadcast_except(&mut self, except: Option<&str>, message: ServerMessage) {
        let targets: Vec<String> = self
            .participants
            .iter()
            .filter(|p| Some(p.conn_id.as_str()) != except)
            .map(|p| p.conn_id.clone())
            .collect();
        for conn_id in targets {
            self.deliver(&conn_id, message.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn room() -> Room {
        Room::new("r1", Arc::new(RelayConfig::default()), Instant::now())
    }

    fn identity(user_id: &str, role: ParticipantRole) -> Identity {
        Identity {
            user_id: user_id.to_string(),
            role,
        }
    }

    fn join(
        room: &mut Room,
        conn_id: &str,
        user_id: &str,
        role: ParticipantRole,
        now: Instant,
    ) -> UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        room.join(conn_id, identity(user_id, role), tx, now).unwrap();
        rx
    }

    fn drain(rx: &mut UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn candidates_from(messages: &[ServerMessage]) -> Vec<Value> {
        messages
            .iter()
            .filter_map(|message| match message {
                ServerMessage::IceCandidate { payload, .. } => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    /// Joins doctor `a` then patient `b` and clears the join chatter.
    fn pair_room(
        now: Instant,
    ) -> (
        Room,
        UnboundedReceiver<ServerMessage>,
        UnboundedReceiver<ServerMessage>,
    ) {
        let mut room = room();
        let mut a = join(&mut room, "a", "dr-a", ParticipantRole::Doctor, now);
        let mut b = join(&mut room, "b", "pt-b", ParticipantRole::Patient, now);
        drain(&mut a);
        drain(&mut b);
        (room, a, b)
    }

    #[test_timeout::timeout]
    fn later_joiner_is_initiator() {
        let now = Instant::now();
        let mut room = room();
        let mut a = join(&mut room, "a", "dr-a", ParticipantRole::Doctor, now);
        let a_messages = drain(&mut a);
        assert!(matches!(
            &a_messages[0],
            ServerMessage::Joined { peers, state: LifecycleState::Idle, .. } if peers.is_empty()
        ));

        let mut b = join(&mut room, "b", "pt-b", ParticipantRole::Patient, now);
        let b_messages = drain(&mut b);
        match &b_messages[0] {
            ServerMessage::Joined { peers, .. } => {
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].peer_conn_id, "a");
                assert!(peers[0].is_initiator);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(b_messages.contains(&ServerMessage::UserJoined {
            room_id: "r1".into(),
            peer_conn_id: "a".into(),
            user_id: "dr-a".into(),
            role: ParticipantRole::Doctor,
            is_initiator: true,
        }));

        let a_messages = drain(&mut a);
        assert!(a_messages.contains(&ServerMessage::UserJoined {
            room_id: "r1".into(),
            peer_conn_id: "b".into(),
            user_id: "pt-b".into(),
            role: ParticipantRole::Patient,
            is_initiator: false,
        }));
        assert!(a_messages.contains(&ServerMessage::SessionState {
            room_id: "r1".into(),
            state: LifecycleState::Negotiating,
        }));
        assert_eq!(room.is_initiator("b", "a"), Some(true));
        assert_eq!(room.is_initiator("a", "b"), Some(false));
    }

    #[test_timeout::timeout]
    fn third_participant_is_refused() {
        let now = Instant::now();
        let (mut room, _a, _b) = pair_room(now);
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = room
            .join("c", identity("dr-c", ParticipantRole::Doctor), tx, now)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::RoomFull);
        assert_eq!(room.participant_count(), 2);
    }

    #[test_timeout::timeout]
    fn offer_answer_and_media_connect_the_room() {
        let now = Instant::now();
        let (mut room, mut a, mut b) = pair_room(now);

        room.relay_offer("b", "a", json!({"sdp": "offer"}), now).unwrap();
        assert_eq!(
            drain(&mut a),
            vec![ServerMessage::Offer {
                room_id: "r1".into(),
                from_peer: "b".into(),
                payload: json!({"sdp": "offer"}),
            }]
        );
        room.relay_answer("a", "b", json!({"sdp": "answer"}), now).unwrap();
        assert!(matches!(
            drain(&mut b).as_slice(),
            [ServerMessage::Answer { from_peer, .. }] if from_peer == "a"
        ));

        room.connection_state("a", "b", MediaState::Connected, now).unwrap();
        room.connection_state("b", "a", MediaState::Connected, now).unwrap();
        assert_eq!(room.state(), LifecycleState::Connected);
        assert!(drain(&mut a).contains(&ServerMessage::SessionState {
            room_id: "r1".into(),
            state: LifecycleState::Connected,
        }));
    }

    #[test_timeout::timeout]
    fn early_candidates_are_flushed_in_order_after_answer() {
        let now = Instant::now();
        let (mut room, mut a, _b) = pair_room(now);

        for n in 1..=3 {
            room.relay_candidate("b", "a", json!({ "candidate": n })).unwrap();
        }
        assert!(drain(&mut a).is_empty());

        room.relay_offer("b", "a", json!("offer"), now).unwrap();
        room.relay_answer("a", "b", json!("answer"), now).unwrap();
        let delivered = drain(&mut a);
        assert_eq!(
            candidates_from(&delivered),
            vec![
                json!({"candidate": 1}),
                json!({"candidate": 2}),
                json!({"candidate": 3})
            ]
        );

        room.relay_candidate("b", "a", json!({ "candidate": 4 })).unwrap();
        assert_eq!(candidates_from(&drain(&mut a)), vec![json!({"candidate": 4})]);
    }

    #[test_timeout::timeout]
    fn description_applied_releases_candidates_for_initiator() {
        let now = Instant::now();
        let (mut room, _a, mut b) = pair_room(now);
        room.relay_offer("b", "a", json!("offer"), now).unwrap();
        room.relay_candidate("a", "b", json!("ca-1")).unwrap();
        room.relay_candidate("a", "b", json!("ca-2")).unwrap();
        assert!(candidates_from(&drain(&mut b)).is_empty());

        room.relay_answer("a", "b", json!("answer"), now).unwrap();
        drain(&mut b);
        room.description_applied("b", "a").unwrap();
        assert_eq!(
            candidates_from(&drain(&mut b)),
            vec![json!("ca-1"), json!("ca-2")]
        );
    }

    #[test_timeout::timeout]
    fn offer_to_departed_peer_is_stale() {
        let now = Instant::now();
        let (mut room, _a, mut b) = pair_room(now);
        room.leave("a", LeaveReason::Left, now).unwrap();
        assert!(drain(&mut b).contains(&ServerMessage::UserLeft {
            room_id: "r1".into(),
            peer_conn_id: "a".into(),
            reason: LeaveReason::Left,
        }));
        let err = room.relay_offer("b", "a", json!("offer"), now).unwrap_err();
        assert_eq!(err.code(), ErrorCode::StaleNegotiation);
        assert_eq!(room.state(), LifecycleState::Idle);
    }

    #[test_timeout::timeout]
    fn responder_cannot_offer() {
        let now = Instant::now();
        let (mut room, _a, _b) = pair_room(now);
        let err = room.relay_offer("a", "b", json!("offer"), now).unwrap_err();
        assert_eq!(err, RelayError::protocol("not_initiator"));
    }

    #[test_timeout::timeout]
    fn non_members_cannot_signal() {
        let now = Instant::now();
        let (mut room, _a, _b) = pair_room(now);
        let err = room.relay_offer("z", "a", json!("offer"), now).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotInRoom);
        let err = room.relay_candidate("a", "a", json!("c")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolViolation);
    }

    #[test_timeout::timeout]
    fn chat_is_stamped_and_relayed_to_others() {
        let now = Instant::now();
        let (mut room, mut a, mut b) = pair_room(now);
        let effects = room
            .publish_chat(
                "a",
                ChatRequest {
                    sender_id: None,
                    sender_role: None,
                    text: " take two a day ".into(),
                    file: None,
                    client_seq: Some(1),
                },
            )
            .unwrap();
        assert_eq!(effects.persist.len(), 1);
        assert!(drain(&mut a).is_empty());
        match drain(&mut b).as_slice() {
            [ServerMessage::ChatMessage {
                seq,
                sender_id,
                sender_role,
                text,
                ..
            }] => {
                assert_eq!(*seq, 1);
                assert_eq!(sender_id, "dr-a");
                assert_eq!(*sender_role, ParticipantRole::Doctor);
                assert_eq!(text, "take two a day");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn spoofed_sender_claims_are_rejected() {
        let now = Instant::now();
        let (mut room, _a, mut b) = pair_room(now);
        let err = room
            .publish_chat(
                "a",
                ChatRequest {
                    sender_id: Some("pt-b".into()),
                    sender_role: None,
                    text: "hi".into(),
                    file: None,
                    client_seq: None,
                },
            )
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolViolation);
        let err = room
            .publish_transcript("a", "hello", Some(ParticipantRole::Patient), now)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolViolation);
        assert!(drain(&mut b).is_empty());
    }

    #[test_timeout::timeout]
    fn repeated_transcript_fragment_is_delivered_once() {
        let now = Instant::now();
        let (mut room, _a, mut b) = pair_room(now);
        let first = room
            .publish_transcript("a", "any allergies?", None, now)
            .unwrap();
        let repeat = room
            .publish_transcript("a", "any allergies?", None, now + Duration::from_millis(1_000))
            .unwrap();
        assert_eq!(first.persist.len(), 1);
        assert!(repeat.persist.is_empty());
        assert_eq!(drain(&mut b).len(), 1);
    }

    #[test_timeout::timeout]
    fn silent_participant_degrades_then_times_out_then_room_closes() {
        let t0 = Instant::now();
        let (mut room, mut a, _b) = pair_room(t0);

        let t1 = t0 + Duration::from_secs(25);
        room.touch("a", t1);
        room.sweep(t1);
        assert_eq!(room.state(), LifecycleState::Degraded);
        let a_messages = drain(&mut a);
        assert!(a_messages.contains(&ServerMessage::PeerStatus {
            room_id: "r1".into(),
            peer_conn_id: "b".into(),
            status: PeerStatus::Unresponsive,
        }));

        let t2 = t0 + Duration::from_secs(31);
        room.touch("a", t2);
        let effects = room.sweep(t2);
        assert!(effects.closed.is_none());
        assert!(!room.contains("b"));
        assert!(drain(&mut a).contains(&ServerMessage::UserLeft {
            room_id: "r1".into(),
            peer_conn_id: "b".into(),
            reason: LeaveReason::Timeout,
        }));
        assert_eq!(room.state(), LifecycleState::Degraded);

        let t3 = t1 + Duration::from_secs(30);
        room.touch("a", t3);
        let effects = room.sweep(t3);
        assert_eq!(effects.closed, Some(EndReason::Timeout));
        assert!(room.is_closed());
        assert!(drain(&mut a).contains(&ServerMessage::SessionEnded {
            room_id: "r1".into(),
            reason: EndReason::Timeout,
        }));
    }

    #[test_timeout::timeout]
    fn traffic_restores_an_unresponsive_participant() {
        let t0 = Instant::now();
        let (mut room, mut a, _b) = pair_room(t0);
        let t1 = t0 + Duration::from_secs(21);
        room.touch("a", t1);
        room.sweep(t1);
        assert_eq!(room.state(), LifecycleState::Degraded);
        drain(&mut a);

        room.touch("b", t1 + Duration::from_secs(1));
        assert_eq!(room.state(), LifecycleState::Negotiating);
        assert!(drain(&mut a).contains(&ServerMessage::PeerStatus {
            room_id: "r1".into(),
            peer_conn_id: "b".into(),
            status: PeerStatus::Responsive,
        }));
    }

    #[test_timeout::timeout]
    fn rejoin_replaces_unresponsive_connection() {
        let t0 = Instant::now();
        let (mut room, mut a, _b) = pair_room(t0);
        let t1 = t0 + Duration::from_secs(21);
        room.touch("a", t1);
        room.sweep(t1);
        drain(&mut a);

        let mut b2 = join(&mut room, "b2", "pt-b", ParticipantRole::Patient, t1);
        assert!(!room.contains("b"));
        assert!(drain(&mut a).contains(&ServerMessage::UserLeft {
            room_id: "r1".into(),
            peer_conn_id: "b".into(),
            reason: LeaveReason::Replaced,
        }));
        assert!(matches!(drain(&mut b2).first(), Some(ServerMessage::Joined { .. })));
        assert_eq!(room.is_initiator("b2", "a"), Some(true));
        assert_eq!(room.state(), LifecycleState::Negotiating);
    }

    #[test_timeout::timeout]
    fn empty_room_is_abandoned_after_grace() {
        let t0 = Instant::now();
        let mut room = room();
        let _a = join(&mut room, "a", "dr-a", ParticipantRole::Doctor, t0);
        room.leave("a", LeaveReason::Left, t0).unwrap();
        assert!(room.sweep(t0 + Duration::from_secs(29)).closed.is_none());
        assert_eq!(
            room.sweep(t0 + Duration::from_secs(30)).closed,
            Some(EndReason::Abandoned)
        );
    }

    #[test_timeout::timeout]
    fn disconnected_peer_degrades_the_room_until_reconnect_grace_closes_it() {
        let t0 = Instant::now();
        let (mut room, mut a, _b) = pair_room(t0);

        room.leave("b", LeaveReason::Disconnected, t0).unwrap();
        assert_eq!(room.state(), LifecycleState::Degraded);
        let a_messages = drain(&mut a);
        assert!(a_messages.contains(&ServerMessage::UserLeft {
            room_id: "r1".into(),
            peer_conn_id: "b".into(),
            reason: LeaveReason::Disconnected,
        }));
        assert!(a_messages.contains(&ServerMessage::SessionState {
            room_id: "r1".into(),
            state: LifecycleState::Degraded,
        }));

        let t1 = t0 + Duration::from_secs(29);
        room.touch("a", t1);
        assert!(room.sweep(t1).closed.is_none());

        let t2 = t0 + Duration::from_secs(30);
        room.touch("a", t2);
        assert_eq!(room.sweep(t2).closed, Some(EndReason::Timeout));
        assert!(room.is_closed());
        assert!(drain(&mut a).contains(&ServerMessage::SessionEnded {
            room_id: "r1".into(),
            reason: EndReason::Timeout,
        }));
    }

    #[test_timeout::timeout]
    fn reconnect_within_grace_clears_degraded() {
        let t0 = Instant::now();
        let (mut room, mut a, _b) = pair_room(t0);
        room.leave("b", LeaveReason::Disconnected, t0).unwrap();
        drain(&mut a);

        let t1 = t0 + Duration::from_secs(5);
        let _b2 = join(&mut room, "b2", "pt-b", ParticipantRole::Patient, t1);
        assert_eq!(room.state(), LifecycleState::Negotiating);
        room.touch("a", t0 + Duration::from_secs(31));
        room.touch("b2", t0 + Duration::from_secs(31));
        assert!(room.sweep(t0 + Duration::from_secs(31)).closed.is_none());
    }

    #[test_timeout::timeout]
    fn explicit_leave_leaves_the_room_idle() {
        let t0 = Instant::now();
        let (mut room, _a, _b) = pair_room(t0);
        room.leave("b", LeaveReason::Left, t0).unwrap();
        assert_eq!(room.state(), LifecycleState::Idle);
        room.touch("a", t0 + Duration::from_secs(29));
        assert!(room.sweep(t0 + Duration::from_secs(29)).closed.is_none());
        assert_eq!(room.state(), LifecycleState::Idle);
    }

    #[test_timeout::timeout]
    fn rejoining_an_empty_room_within_grace_keeps_its_context() {
        let t0 = Instant::now();
        let mut room = room();
        let _a = join(&mut room, "a", "dr-a", ParticipantRole::Doctor, t0);
        room.publish_chat(
            "a",
            ChatRequest {
                sender_id: None,
                sender_role: None,
                text: "hello".into(),
                file: None,
                client_seq: None,
            },
        )
        .unwrap();
        room.publish_transcript("a", "any allergies?", None, t0).unwrap();
        let before = room.snapshot();
        assert_eq!(before.last_seq, 2);

        room.leave("a", LeaveReason::Disconnected, t0).unwrap();
        assert_eq!(room.participant_count(), 0);
        let t1 = t0 + Duration::from_secs(1);
        assert!(room.sweep(t1).closed.is_none());

        let mut a2 = join(&mut room, "a2", "dr-a", ParticipantRole::Doctor, t1);
        let _b = join(&mut room, "b", "pt-b", ParticipantRole::Patient, t1);
        drain(&mut a2);
        assert_eq!(room.snapshot().created_at, before.created_at);
        assert_eq!(room.state(), LifecycleState::Negotiating);

        let repeat = room
            .publish_transcript("a2", "any allergies?", None, t0 + Duration::from_secs(2))
            .unwrap();
        assert!(repeat.persist.is_empty());

        let effects = room
            .publish_chat(
                "a2",
                ChatRequest {
                    sender_id: None,
                    sender_role: None,
                    text: "welcome back".into(),
                    file: None,
                    client_seq: None,
                },
            )
            .unwrap();
        assert!(matches!(
            effects.persist.as_slice(),
            [ServerMessage::ChatMessage { seq: 3, .. }]
        ));
    }

    #[test_timeout::timeout]
    fn repeated_negotiation_failure_closes_the_room() {
        let now = Instant::now();
        let (mut room, mut a, mut b) = pair_room(now);
        for attempt in 1..=2 {
            room.relay_offer("b", "a", json!("offer"), now).unwrap();
            let effects = room
                .connection_state("a", "b", MediaState::Failed, now)
                .unwrap();
            assert!(effects.closed.is_none(), "attempt {attempt}");
            assert_eq!(room.state(), LifecycleState::Degraded);
            assert!(drain(&mut b).iter().any(|message| matches!(
                message,
                ServerMessage::NegotiationFailed { peer, .. } if peer == "a"
            )));
            room.renegotiate("b", "a", now).unwrap();
            assert!(drain(&mut a).contains(&ServerMessage::Renegotiate {
                room_id: "r1".into(),
                from_peer: "b".into(),
            }));
        }
        room.relay_offer("b", "a", json!("offer"), now).unwrap();
        let effects = room
            .connection_state("a", "b", MediaState::Failed, now)
            .unwrap();
        assert_eq!(effects.closed, Some(EndReason::NegotiationFailed));
        assert!(room.is_closed());
    }

    #[test_timeout::timeout]
    fn renegotiation_requires_a_completed_round() {
        let now = Instant::now();
        let (mut room, mut a, _b) = pair_room(now);
        let err = room.renegotiate("b", "a", now).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolViolation);

        room.relay_offer("b", "a", json!("offer"), now).unwrap();
        room.relay_answer("a", "b", json!("answer"), now).unwrap();
        drain(&mut a);
        room.renegotiate("a", "b", now).unwrap();
        room.relay_offer("b", "a", json!("restart offer"), now).unwrap();
        assert!(drain(&mut a).contains(&ServerMessage::Offer {
            room_id: "r1".into(),
            from_peer: "b".into(),
            payload: json!("restart offer"),
        }));
    }

    #[test_timeout::timeout]
    fn end_session_closes_and_notifies_everyone() {
        let now = Instant::now();
        let (mut room, mut a, mut b) = pair_room(now);
        let effects = room.end_session("a", now).unwrap();
        assert_eq!(effects.closed, Some(EndReason::Ended));
        let ended = ServerMessage::SessionEnded {
            room_id: "r1".into(),
            reason: EndReason::Ended,
        };
        assert!(drain(&mut a).contains(&ended));
        assert!(drain(&mut b).contains(&ended));

        let (tx, _rx) = mpsc::unbounded_channel();
        let err = room
            .join("c", identity("x", ParticipantRole::Patient), tx, now)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::StaleNegotiation);
    }

    #[test_timeout::timeout]
    fn closed_outbound_channel_reports_peer_unreachable() {
        let now = Instant::now();
        let (mut room, mut a, b) = pair_room(now);
        drop(b);
        room.relay_offer("b", "a", json!("offer"), now).unwrap();
        drain(&mut a);
        room.relay_answer("a", "b", json!("answer"), now).unwrap();
        assert!(drain(&mut a).contains(&ServerMessage::PeerStatus {
            room_id: "r1".into(),
            peer_conn_id: "b".into(),
            status: PeerStatus::Unreachable,
        }));
        let snapshot = room.snapshot();
        let b_entry = snapshot
            .participants
            .iter()
            .find(|participant| participant.conn_id == "b")
            .unwrap();
        assert!(!b_entry.responsive);
    }
}
