use std::{
    sync::Arc,
    time::Instant,
};

use dashmap::{mapref::entry::Entry, DashMap};
use metrics::gauge;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::identity::Identity;
use crate::protocol::LeaveReason;
use crate::room::{Effects, Outbound, Room, RoomSnapshot};

/// Current instant on the runtime clock, so paused-time tests drive liveness.
pub fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Process-wide room table. Each room sits behind its own lock; the map
/// only guards membership of the table itself.
#[derive(Clone)]
pub struct RoomRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    rooms: DashMap<String, Arc<RoomCell>>,
    config: Arc<RelayConfig>,
}

struct RoomCell {
    room: Mutex<Room>,
}

impl RoomRegistry {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                rooms: DashMap::new(),
                config: Arc::new(config),
            }),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    pub fn room_count(&self) -> usize {
        self.inner.rooms.len()
    }

    pub fn join(
        &self,
        room_id: &str,
        conn_id: &str,
        identity: Identity,
        tx: Outbound,
        now: Instant,
    ) -> RelayResult<Effects> {
        if room_id.trim().is_empty() {
            return Err(RelayError::protocol("room id must not be empty"));
        }
        loop {
            let cell = self.cell_or_create(room_id, now);
            let mut room = cell.room.lock();
            if room.is_closed() {
                // Lost a race with a close; retire the cell and retry.
                drop(room);
                self.retire(room_id, &cell);
                continue;
            }
            return room.join(conn_id, identity, tx, now);
        }
    }

    /// Runs `op` against an existing room under its lock. Rooms that end up
    /// closed are removed from the table.
    pub fn with_room<T>(
        &self,
        room_id: &str,
        op: impl FnOnce(&mut Room) -> RelayResult<T>,
    ) -> RelayResult<T> {
        let cell = self
            .cell(room_id)
            .ok_or_else(|| RelayError::NotInRoom(room_id.to_string()))?;
        let mut room = cell.room.lock();
        let result = op(&mut *room);
        let closed = room.is_closed();
        drop(room);
        if closed {
            self.retire(room_id, &cell);
        }
        result
    }

    pub fn leave(
        &self,
        room_id: &str,
        conn_id: &str,
        reason: LeaveReason,
        now: Instant,
    ) -> RelayResult<Effects> {
        self.with_room(room_id, |room| room.leave(conn_id, reason, now))
    }

    pub fn touch(&self, room_id: &str, conn_id: &str, now: Instant) -> Effects {
        self.with_room(room_id, |room| Ok(room.touch(conn_id, now)))
            .unwrap_or_default()
    }

    /// Liveness pass over every room. Returns the effects of rooms that
    /// closed during the pass.
    pub fn sweep(&self, now: Instant) -> Vec<(String, Effects)> {
        let room_ids: Vec<String> = self
            .inner
            .rooms
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut closed = Vec::new();
        for room_id in room_ids {
            let Ok(effects) = self.with_room(&room_id, |room| Ok(room.sweep(now))) else {
                continue;
            };
            if effects.closed.is_some() {
                closed.push((room_id, effects));
            }
        }
        closed
    }

    pub fn snapshot(&self, room_id: &str) -> Option<RoomSnapshot> {
        self.cell(room_id).map(|cell| cell.room.lock().snapshot())
    }

    /// Periodically sweeps rooms and hands the effects of closed rooms to
    /// `on_closed`.
    pub fn spawn_monitor<F>(&self, on_closed: F) -> JoinHandle<()>
    where
        F: Fn(String, Effects) + Send + Sync + 'static,
    {
        let registry = self.clone();
        let mut interval = tokio::time::interval(self.inner.config.heartbeat_interval);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                for (room_id, effects) in registry.sweep(now()) {
                    on_closed(room_id, effects);
                }
            }
        })
    }

    fn cell(&self, room_id: &str) -> Option<Arc<RoomCell>> {
        self.inner
            .rooms
            .get(room_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn cell_or_create(&self, room_id: &str, now: Instant) -> Arc<RoomCell> {
        let cell = match self.inner.rooms.entry(room_id.to_string()) {
            Entry::Occupied(entry) => return Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let cell = Arc::new(RoomCell {
                    room: Mutex::new(Room::new(room_id, Arc::clone(&self.inner.config), now)),
                });
                entry.insert(Arc::clone(&cell));
                cell
            }
        };
        info!(room_id = %room_id, "room created");
        self.record_gauge();
        cell
    }

    fn retire(&self, room_id: &str, cell: &Arc<RoomCell>) {
        if self
            .inner
            .rooms
            .remove_if(room_id, |_, existing| Arc::ptr_eq(existing, cell))
            .is_some()
        {
            debug!(room_id = %room_id, "room removed from registry");
            self.record_gauge();
        }
    }

    fn record_gauge(&self) {
        gauge!("consult_relay_rooms_active", self.inner.rooms.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::lifecycle::LifecycleState;
    use crate::protocol::{EndReason, ParticipantRole, ServerMessage};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn identity(user_id: &str, role: ParticipantRole) -> Identity {
        Identity {
            user_id: user_id.to_string(),
            role,
        }
    }

    fn join(
        registry: &RoomRegistry,
        room_id: &str,
        conn_id: &str,
        now: Instant,
    ) -> RelayResult<mpsc::UnboundedReceiver<ServerMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry
            .join(
                room_id,
                conn_id,
                identity(&format!("user-{conn_id}"), ParticipantRole::Patient),
                tx,
                now,
            )
            .map(|_| rx)
    }

    #[test_timeout::timeout]
    fn rooms_are_created_on_first_join_and_isolated() {
        let registry = RoomRegistry::new(RelayConfig::default());
        let now = Instant::now();
        let _a = join(&registry, "r1", "a", now).unwrap();
        let _b = join(&registry, "r2", "b", now).unwrap();
        assert_eq!(registry.room_count(), 2);
        assert_eq!(registry.snapshot("r1").unwrap().participants.len(), 1);
        assert!(registry.snapshot("missing").is_none());
    }

    #[test_timeout::timeout]
    fn full_room_refuses_extra_connection() {
        let registry = RoomRegistry::new(RelayConfig::default());
        let now = Instant::now();
        let _a = join(&registry, "r1", "a", now).unwrap();
        let _b = join(&registry, "r1", "b", now).unwrap();
        let err = join(&registry, "r1", "c", now).unwrap_err();
        assert_eq!(err.code(), ErrorCode::RoomFull);
    }

    #[test_timeout::timeout]
    fn empty_room_id_is_a_protocol_violation() {
        let registry = RoomRegistry::new(RelayConfig::default());
        let err = join(&registry, "  ", "a", Instant::now()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolViolation);
        assert_eq!(registry.room_count(), 0);
    }

    #[test_timeout::timeout]
    fn operations_on_unknown_rooms_report_not_in_room() {
        let registry = RoomRegistry::new(RelayConfig::default());
        let err = registry
            .leave("nope", "a", LeaveReason::Left, Instant::now())
            .unwrap_err();
        assert_eq!(err, RelayError::NotInRoom("nope".into()));
    }

    #[test_timeout::timeout]
    fn closed_room_is_removed_and_next_join_starts_fresh() {
        let registry = RoomRegistry::new(RelayConfig::default());
        let now = Instant::now();
        let _a = join(&registry, "r1", "a", now).unwrap();
        let effects = registry
            .with_room("r1", |room| room.end_session("a", now))
            .unwrap();
        assert_eq!(effects.closed, Some(EndReason::Ended));
        assert_eq!(registry.room_count(), 0);

        let _c = join(&registry, "r1", "c", now).unwrap();
        let snapshot = registry.snapshot("r1").unwrap();
        assert_eq!(snapshot.state, LifecycleState::Idle);
        assert_eq!(snapshot.participants[0].conn_id, "c");
    }

    #[test_timeout::timeout]
    fn sweep_reports_and_removes_abandoned_rooms() {
        let registry = RoomRegistry::new(RelayConfig::default());
        let t0 = Instant::now();
        let _a = join(&registry, "r1", "a", t0).unwrap();
        registry.leave("r1", "a", LeaveReason::Left, t0).unwrap();

        assert!(registry.sweep(t0 + Duration::from_secs(5)).is_empty());
        assert_eq!(registry.room_count(), 1);

        let closed = registry.sweep(t0 + Duration::from_secs(30));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].0, "r1");
        assert_eq!(closed[0].1.closed, Some(EndReason::Abandoned));
        assert_eq!(registry.room_count(), 0);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn monitor_closes_abandoned_rooms_on_the_runtime_clock() {
        let registry = RoomRegistry::new(RelayConfig::default());
        let _a = join(&registry, "r1", "a", now()).unwrap();
        registry
            .leave("r1", "a", LeaveReason::Left, now())
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = registry.spawn_monitor(move |room_id, effects| {
            let _ = tx.send((room_id, effects.closed));
        });

        let (room_id, reason) = rx.recv().await.unwrap();
        assert_eq!(room_id, "r1");
        assert_eq!(reason, Some(EndReason::Abandoned));
        assert_eq!(registry.room_count(), 0);
        monitor.abort();
    }
}
