use std::{collections::HashSet, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bookkeeping::RoomAuthority;
use crate::error::{RelayError, RelayResult};
use crate::identity::{Identity, IdentityQuery, IdentityVerifier};
use crate::persistence::EventSink;
use crate::protocol::{generate_connection_id, ClientMessage, LeaveReason, ServerMessage};
use crate::registry::{now, RoomRegistry};
use crate::room::{ChatRequest, Effects, Outbound, Room};

/// Shared state behind every route.
pub struct AppState {
    pub registry: RoomRegistry,
    pub verifier: IdentityVerifier,
    pub authority: Arc<dyn RoomAuthority>,
    pub sink: Arc<dyn EventSink>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Hands the side effects of a room operation to the collaborators. Runs
    /// after the room lock was released; the calls themselves are spawned.
    pub fn apply_effects(&self, room_id: &str, effects: Effects) {
        for event in effects.persist {
            let sink = Arc::clone(&self.sink);
            let room_id = room_id.to_string();
            tokio::spawn(async move {
                if let Err(err) = sink.append(&room_id, &event).await {
                    counter!("consult_relay_sink_failures_total", 1);
                    warn!(room_id = %room_id, error = %err, "failed to persist room event");
                }
            });
        }

        if effects.session_started {
            let authority = Arc::clone(&self.authority);
            let room_id = room_id.to_string();
            tokio::spawn(async move {
                if let Err(err) = authority.mark_started(&room_id).await {
                    warn!(room_id = %room_id, error = %err, "failed to mark session started");
                }
            });
        }

        if let Some(reason) = effects.closed {
            let authority = Arc::clone(&self.authority);
            let room_id = room_id.to_string();
            tokio::spawn(async move {
                if let Err(err) = authority.mark_ended(&room_id).await {
                    warn!(
                        room_id = %room_id,
                        reason = reason.metric_label(),
                        error = %err,
                        "failed to mark session ended"
                    );
                }
            });
        }
    }
}

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<IdentityQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    match state.verifier.resolve(&query) {
        Ok(identity) => ws
            .on_upgrade(move |socket| handle_socket(socket, state, identity))
            .into_response(),
        Err(err) => {
            counter!(
                "consult_relay_rejections_total",
                1,
                "code" => err.metric_label()
            );
            warn!(error = %err, "identity resolution failed");
            (StatusCode::UNAUTHORIZED, err.to_string()).into_response()
        }
    }
}

/// Per-connection context threaded through every handler.
struct Connection {
    conn_id: String,
    identity: Identity,
    tx: Outbound,
    rooms: HashSet<String>,
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, identity: Identity) {
    let conn_id = generate_connection_id();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    counter!("consult_relay_connections_total", 1);
    info!(
        connection_id = %conn_id,
        user_id = %identity.user_id,
        role = %identity.role,
        "websocket connected"
    );

    let writer_conn_id = conn_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(err) => {
                    error!(connection_id = %writer_conn_id, error = %err, "failed to encode message");
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        debug!(connection_id = %writer_conn_id, "writer task ended");
    });

    let mut conn = Connection {
        conn_id,
        identity,
        tx,
        rooms: HashSet::new(),
    };

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(connection_id = %conn.conn_id, error = %err, "websocket error");
                break;
            }
        };

        touch_rooms(&state, &conn);
        match frame {
            Message::Text(text) => handle_frame(&state, &mut conn, &text).await,
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => handle_frame(&state, &mut conn, &text).await,
                Err(_) => {
                    debug!(connection_id = %conn.conn_id, "ignoring non-UTF8 binary frame");
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    for room_id in conn.rooms.drain() {
        match state
            .registry
            .leave(&room_id, &conn.conn_id, LeaveReason::Disconnected, now())
        {
            Ok(effects) => state.apply_effects(&room_id, effects),
            Err(err) => debug!(room_id = %room_id, error = %err, "leave on disconnect skipped"),
        }
    }
    writer.abort();
    info!(connection_id = %conn.conn_id, "websocket disconnected");
}

fn touch_rooms(state: &AppState, conn: &Connection) {
    let at = now();
    for room_id in &conn.rooms {
        let effects = state.registry.touch(room_id, &conn.conn_id, at);
        state.apply_effects(room_id, effects);
    }
}

async fn handle_frame(state: &AppState, conn: &mut Connection, text: &str) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(err) => {
            warn!(connection_id = %conn.conn_id, error = %err, "failed to parse client message");
            let _ = conn.tx.send(ServerMessage::Error {
                message: format!("Invalid message format: {}", err),
            });
            return;
        }
    };

    let op = message.op();
    let room_id = message.room_id().map(str::to_string);
    if let Err(err) = dispatch(state, conn, message).await {
        let code = err.code();
        counter!("consult_relay_rejections_total", 1, "code" => code.metric_label());
        debug!(
            connection_id = %conn.conn_id,
            op,
            code = code.metric_label(),
            error = %err,
            "rejected client message"
        );
        let _ = conn.tx.send(ServerMessage::Rejected {
            room_id,
            op: op.to_string(),
            code,
            reason: err.to_string(),
        });
    }
}

async fn dispatch(state: &AppState, conn: &mut Connection, message: ClientMessage) -> RelayResult<()> {
    let me = conn.conn_id.clone();
    match message {
        ClientMessage::JoinRoom { room_id } => {
            let permitted = match state.authority.may_exist(&room_id).await {
                Ok(permitted) => permitted,
                Err(err) => {
                    warn!(room_id = %room_id, error = %err, "room check failed");
                    false
                }
            };
            if !permitted {
                return Err(RelayError::RoomNotPermitted(room_id));
            }
            let effects = state.registry.join(
                &room_id,
                &me,
                conn.identity.clone(),
                conn.tx.clone(),
                now(),
            )?;
            conn.rooms.insert(room_id.clone());
            state.apply_effects(&room_id, effects);
            Ok(())
        }
        ClientMessage::LeaveRoom { room_id } => {
            let effects = state
                .registry
                .leave(&room_id, &me, LeaveReason::Left, now())?;
            conn.rooms.remove(&room_id);
            state.apply_effects(&room_id, effects);
            Ok(())
        }
        ClientMessage::Offer {
            room_id,
            to_peer,
            payload,
        } => in_room(state, &room_id, |room| {
            room.relay_offer(&me, &to_peer, payload, now())
        }),
        ClientMessage::Answer {
            room_id,
            to_peer,
            payload,
        } => in_room(state, &room_id, |room| {
            room.relay_answer(&me, &to_peer, payload, now())
        }),
        ClientMessage::IceCandidate {
            room_id,
            to_peer,
            payload,
        } => in_room(state, &room_id, |room| {
            room.relay_candidate(&me, &to_peer, payload)
        }),
        ClientMessage::RemoteDescriptionApplied { room_id, peer } => {
            in_room(state, &room_id, |room| room.description_applied(&me, &peer))
        }
        ClientMessage::ConnectionState {
            room_id,
            peer,
            state: media,
        } => in_room(state, &room_id, |room| {
            room.connection_state(&me, &peer, media, now())
        }),
        ClientMessage::Renegotiate { room_id, peer } => {
            in_room(state, &room_id, |room| room.renegotiate(&me, &peer, now()))
        }
        ClientMessage::ChatMessage {
            room_id,
            sender_id,
            sender_role,
            text,
            file,
            client_seq,
        } => in_room(state, &room_id, |room| {
            room.publish_chat(
                &me,
                ChatRequest {
                    sender_id,
                    sender_role,
                    text,
                    file,
                    client_seq,
                },
            )
        }),
        ClientMessage::TranscriptUpdate {
            room_id,
            text,
            sender_role,
        } => in_room(state, &room_id, |room| {
            room.publish_transcript(&me, &text, sender_role, now())
        }),
        ClientMessage::StartSession { room_id } => {
            in_room(state, &room_id, |room| room.start_session(&me))
        }
        ClientMessage::EndSession { room_id } => {
            in_room(state, &room_id, |room| room.end_session(&me, now()))?;
            conn.rooms.remove(&room_id);
            Ok(())
        }
        ClientMessage::Ping => {
            let _ = conn.tx.send(ServerMessage::Pong);
            Ok(())
        }
    }
}

fn in_room(
    state: &AppState,
    room_id: &str,
    op: impl FnOnce(&mut Room) -> RelayResult<Effects>,
) -> RelayResult<()> {
    let effects = state.registry.with_room(room_id, op)?;
    state.apply_effects(room_id, effects);
    Ok(())
}
