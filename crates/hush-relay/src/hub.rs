//! Relay hub: the single owner of all connection and room state.
//!
//! Transports never touch rooms directly. They push [`HubEvent`]s into the hub queue and
//! receive serialized [`ServerMessage`]s through their outbox. Events are handled one at a
//! time, so every inbound message runs to completion (fan-out included) before the next.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use hush_common::{unix_millis, CallType, ClientMessage, ProtocolError, ServerMessage};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::rooms::{ConnectionId, MemberId, RoomId, RoomStore};

/// Serialized frames waiting to be written to one connection.
pub type Outbox = mpsc::Sender<String>;

pub const NOT_IN_GROUP: &str = "Not in a group";
pub const INVALID_FORMAT: &str = "Invalid message format";

#[derive(Debug)]
pub enum HubEvent {
    Connected { conn: ConnectionId, outbox: Outbox },
    Message { conn: ConnectionId, text: String },
    Closed { conn: ConnectionId },
}

/// Live counters published by the hub for health and metrics endpoints.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    connections: Arc<AtomicUsize>,
    rooms: Arc<AtomicUsize>,
}

impl RelayStats {
    pub fn active_connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn active_rooms(&self) -> usize {
        self.rooms.load(Ordering::Relaxed)
    }

    fn record(&self, connections: usize, rooms: usize) {
        self.connections.store(connections, Ordering::Relaxed);
        self.rooms.store(rooms, Ordering::Relaxed);
    }
}

/// Cloneable entry point into a running hub.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<HubEvent>,
    next_conn: Arc<AtomicU64>,
    stats: RelayStats,
}

impl RelayHandle {
    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_conn.fetch_add(1, Ordering::Relaxed))
    }

    /// Queue an event. Returns `false` once the hub has stopped.
    pub async fn send(&self, event: HubEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }
}

/// Start a hub task and return a handle to it.
pub fn spawn_hub(queue_capacity: usize) -> (RelayHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(queue_capacity.max(1));
    let stats = RelayStats::default();
    let hub = RelayHub::new(stats.clone());
    let task = tokio::spawn(hub.run(rx));

    let handle = RelayHandle {
        tx,
        next_conn: Arc::new(AtomicU64::new(1)),
        stats,
    };
    (handle, task)
}

struct Connection {
    member: MemberId,
    outbox: Outbox,
}

pub struct RelayHub {
    connections: HashMap<ConnectionId, Connection>,
    rooms: RoomStore,
    stats: RelayStats,
}

impl RelayHub {
    pub fn new(stats: RelayStats) -> Self {
        Self {
            connections: HashMap::new(),
            rooms: RoomStore::new(),
            stats,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<HubEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle_event(event);
        }
        info!("relay hub stopped");
    }

    pub fn handle_event(&mut self, event: HubEvent) {
        match event {
            HubEvent::Connected { conn, outbox } => self.on_connected(conn, outbox),
            HubEvent::Message { conn, text } => self.on_text(conn, &text),
            HubEvent::Closed { conn } => self.on_closed(conn),
        }
        self.stats
            .record(self.connections.len(), self.rooms.room_count());
    }

    pub fn rooms(&self) -> &RoomStore {
        &self.rooms
    }

    fn on_connected(&mut self, conn: ConnectionId, outbox: Outbox) {
        let member = MemberId::generate();
        self.connections.insert(conn, Connection { member, outbox });
        debug!(%conn, %member, "connection registered");
        self.reply(
            conn,
            &ServerMessage::Welcome {
                member_id: member.to_string(),
            },
        );
    }

    fn on_closed(&mut self, conn: ConnectionId) {
        if let Some(room) = self.rooms.leave(conn) {
            debug!(%conn, %room, "connection closed, removed from room");
        }
        self.connections.remove(&conn);
    }

    fn on_text(&mut self, conn: ConnectionId, text: &str) {
        if !self.connections.contains_key(&conn) {
            debug!(%conn, "message from unregistered connection dropped");
            return;
        }

        match ClientMessage::parse(text) {
            Ok(msg) => self.dispatch(conn, msg),
            Err(ProtocolError::UnknownType(kind)) => {
                debug!(%conn, %kind, "unknown message type");
                self.reply(
                    conn,
                    &ServerMessage::error(format!("Unknown message type: {kind}")),
                );
            }
            Err(err) => {
                debug!(%conn, %err, "malformed message");
                self.reply(conn, &ServerMessage::error(INVALID_FORMAT));
            }
        }
    }

    /// Handle one parsed client message.
    pub fn dispatch(&mut self, conn: ConnectionId, msg: ClientMessage) {
        match msg {
            ClientMessage::CreateGroup => self.create_room(conn),
            ClientMessage::JoinGroup { group_id } => self.join_room(conn, &group_id),
            ClientMessage::LeaveGroup => self.leave_room(conn),
            ClientMessage::ChatMessage {
                content, timestamp, ..
            } => self.relay_chat(conn, content, timestamp),
            ClientMessage::StartCall { call_type } => self.start_call(conn, call_type),
            ClientMessage::EncryptedSignaling { data } => self.relay_signaling(conn, data),
        }
    }

    fn create_room(&mut self, conn: ConnectionId) {
        let outcome = self.rooms.create(conn);
        if let Some(left) = &outcome.left {
            debug!(%conn, room = %left, "left previous room on create");
        }
        info!(%conn, room = %outcome.room, "room created");
        self.reply(
            conn,
            &ServerMessage::GroupCreated {
                group_id: outcome.room.to_string(),
            },
        );
    }

    fn join_room(&mut self, conn: ConnectionId, group_id: &str) {
        let room = match RoomId::parse(group_id) {
            Ok(room) => room,
            Err(err) => {
                self.reply(conn, &ServerMessage::error(format!("Invalid group id: {err}")));
                return;
            }
        };

        let outcome = self.rooms.join(conn, room);
        if let Some(left) = &outcome.left {
            debug!(%conn, room = %left, "left previous room on join");
        }
        debug!(
            %conn,
            room = %outcome.room,
            members = self.rooms.member_count(&outcome.room),
            "joined room"
        );
        self.reply(
            conn,
            &ServerMessage::JoinedGroup {
                group_id: outcome.room.to_string(),
            },
        );
    }

    fn leave_room(&mut self, conn: ConnectionId) {
        if let Some(room) = self.rooms.leave(conn) {
            debug!(%conn, %room, "left room");
            self.reply(
                conn,
                &ServerMessage::LeftGroup {
                    group_id: room.to_string(),
                },
            );
        }
    }

    fn relay_chat(&mut self, conn: ConnectionId, content: String, timestamp: Option<i64>) {
        let Some((room, member)) = self.room_and_member(conn) else {
            self.reply(conn, &ServerMessage::error(NOT_IN_GROUP));
            return;
        };

        let msg = ServerMessage::ChatMessage {
            content,
            sender: member.to_string(),
            timestamp: timestamp.unwrap_or_else(unix_millis),
        };
        let delivered = self.broadcast(&room, &msg, Some(conn));
        debug!(%conn, %room, delivered, "chat relayed");
    }

    fn start_call(&mut self, conn: ConnectionId, call_type: CallType) {
        if self.rooms.room_of(conn).is_none() {
            self.reply(conn, &ServerMessage::error(NOT_IN_GROUP));
            return;
        }
        debug!(%conn, %call_type, "call allowed");
        self.reply(conn, &ServerMessage::CallAllowed { call_type });
    }

    fn relay_signaling(&mut self, conn: ConnectionId, data: String) {
        let Some((room, member)) = self.room_and_member(conn) else {
            self.reply(conn, &ServerMessage::error(NOT_IN_GROUP));
            return;
        };

        let msg = ServerMessage::EncryptedSignaling {
            data,
            sender: member.to_string(),
        };
        let delivered = self.broadcast(&room, &msg, Some(conn));
        debug!(%conn, %room, delivered, "signaling relayed");
    }

    fn room_and_member(&self, conn: ConnectionId) -> Option<(RoomId, MemberId)> {
        let room = self.rooms.room_of(conn)?.clone();
        let member = self.connections.get(&conn)?.member;
        Some((room, member))
    }

    /// Deliver `msg` to every open member of `room` except `exclude`.
    ///
    /// Best effort: closed or backed-up outboxes are skipped. Returns how many
    /// connections accepted the frame.
    pub fn broadcast(
        &self,
        room: &RoomId,
        msg: &ServerMessage,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let text = match msg.to_json() {
            Ok(text) => text,
            Err(err) => {
                warn!(%room, %err, "failed to encode broadcast");
                return 0;
            }
        };

        self.rooms
            .members(room)
            .filter(|member| Some(*member) != exclude)
            .filter(|member| self.deliver(*member, text.clone()))
            .count()
    }

    fn reply(&self, conn: ConnectionId, msg: &ServerMessage) -> bool {
        match msg.to_json() {
            Ok(text) => self.deliver(conn, text),
            Err(err) => {
                warn!(%conn, %err, "failed to encode reply");
                false
            }
        }
    }

    fn deliver(&self, conn: ConnectionId, text: String) -> bool {
        let Some(connection) = self.connections.get(&conn) else {
            return false;
        };
        if connection.outbox.is_closed() {
            return false;
        }

        match connection.outbox.try_send(text) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(%conn, "outbox full, dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}
