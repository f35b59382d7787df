//! Room membership store.
//!
//! Rooms live in an arena keyed by [`RoomId`]; connections are referred to only by
//! [`ConnectionId`] tokens. A connection is a member of at most one room, and a room is
//! dropped as soon as its last member leaves.

use rand::{rngs::OsRng, RngCore};
use std::collections::{HashMap, HashSet};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Bytes of randomness in a generated room id (128 bits).
const ROOM_ID_BYTES: usize = 16;

/// Relay-internal token for one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Public handle stamped on messages a connection sends. Carries no authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemberId(Uuid);

impl MemberId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomIdError {
    #[error("group id must not be empty")]
    Empty,

    #[error("group id exceeds {0} characters")]
    TooLong(usize),

    #[error("group id contains control characters")]
    ControlCharacter,
}

/// Opaque room identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(String);

impl RoomId {
    pub const MAX_LEN: usize = 128;

    /// Fresh 128-bit random id, hex encoded.
    pub fn generate() -> Self {
        let mut bytes = [0u8; ROOM_ID_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Accept a client-supplied id. Any non-empty printable string is a valid room.
    pub fn parse(s: &str) -> Result<Self, RoomIdError> {
        if s.is_empty() {
            return Err(RoomIdError::Empty);
        }
        if s.chars().count() > Self::MAX_LEN {
            return Err(RoomIdError::TooLong(Self::MAX_LEN));
        }
        if s.chars().any(char::is_control) {
            return Err(RoomIdError::ControlCharacter);
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of placing a connection into a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub room: RoomId,
    /// Room the connection was implicitly removed from, if it was elsewhere.
    pub left: Option<RoomId>,
}

#[derive(Debug, Default)]
struct Room {
    members: HashSet<ConnectionId>,
}

#[derive(Debug, Default)]
pub struct RoomStore {
    rooms: HashMap<RoomId, Room>,
    memberships: HashMap<ConnectionId, RoomId>,
}

impl RoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new room with `conn` as its first member.
    pub fn create(&mut self, conn: ConnectionId) -> JoinOutcome {
        let room = loop {
            let candidate = RoomId::generate();
            if !self.rooms.contains_key(&candidate) {
                break candidate;
            }
        };
        self.join(conn, room)
    }

    /// Add `conn` to `room`, creating the room if needed and leaving any other room first.
    pub fn join(&mut self, conn: ConnectionId, room: RoomId) -> JoinOutcome {
        if self.memberships.get(&conn) == Some(&room) {
            return JoinOutcome { room, left: None };
        }

        let left = self.leave(conn);
        self.rooms
            .entry(room.clone())
            .or_default()
            .members
            .insert(conn);
        self.memberships.insert(conn, room.clone());

        JoinOutcome { room, left }
    }

    /// Remove `conn` from its room. Returns the room it left, or `None` if it was in none.
    pub fn leave(&mut self, conn: ConnectionId) -> Option<RoomId> {
        let room_id = self.memberships.remove(&conn)?;

        if let Some(room) = self.rooms.get_mut(&room_id) {
            room.members.remove(&conn);
            if room.members.is_empty() {
                self.rooms.remove(&room_id);
            }
        }

        Some(room_id)
    }

    pub fn room_of(&self, conn: ConnectionId) -> Option<&RoomId> {
        self.memberships.get(&conn)
    }

    /// Current members of `room`, in no particular order.
    pub fn members(&self, room: &RoomId) -> impl Iterator<Item = ConnectionId> + '_ {
        self.rooms
            .get(room)
            .into_iter()
            .flat_map(|room| room.members.iter().copied())
    }

    pub fn member_count(&self, room: &RoomId) -> usize {
        self.rooms.get(room).map_or(0, |room| room.members.len())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(s: &str) -> RoomId {
        RoomId::parse(s).unwrap()
    }

    #[test]
    fn test_generated_ids_are_128_bit_hex() {
        let id = RoomId::generate();
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(RoomId::generate(), id);
    }

    #[test]
    fn test_parse_rejects_bad_ids() {
        assert_eq!(RoomId::parse(""), Err(RoomIdError::Empty));
        assert_eq!(
            RoomId::parse(&"a".repeat(129)),
            Err(RoomIdError::TooLong(128))
        );
        assert_eq!(RoomId::parse("ab\ncd"), Err(RoomIdError::ControlCharacter));
        assert!(RoomId::parse("abc123").is_ok());
    }

    #[test]
    fn test_create_adds_creator() {
        let mut store = RoomStore::new();
        let outcome = store.create(ConnectionId(1));
        assert_eq!(outcome.left, None);
        assert_eq!(store.room_of(ConnectionId(1)), Some(&outcome.room));
        assert_eq!(store.member_count(&outcome.room), 1);
    }

    #[test]
    fn test_join_creates_room_implicitly() {
        let mut store = RoomStore::new();
        assert_eq!(store.room_count(), 0);
        store.join(ConnectionId(1), room("abc123"));
        store.join(ConnectionId(2), room("abc123"));
        assert_eq!(store.member_count(&room("abc123")), 2);
        assert_eq!(store.room_count(), 1);
    }

    #[test]
    fn test_join_other_room_leaves_previous() {
        let mut store = RoomStore::new();
        store.join(ConnectionId(1), room("first"));
        store.join(ConnectionId(2), room("first"));

        let outcome = store.join(ConnectionId(1), room("second"));
        assert_eq!(outcome.left, Some(room("first")));
        assert_eq!(store.member_count(&room("first")), 1);
        assert_eq!(store.member_count(&room("second")), 1);
    }

    #[test]
    fn test_rejoin_same_room_is_noop() {
        let mut store = RoomStore::new();
        store.join(ConnectionId(1), room("same"));
        let outcome = store.join(ConnectionId(1), room("same"));
        assert_eq!(outcome.left, None);
        assert_eq!(store.member_count(&room("same")), 1);
    }

    #[test]
    fn test_last_leave_removes_room() {
        let mut store = RoomStore::new();
        store.join(ConnectionId(1), room("gone"));
        assert_eq!(store.leave(ConnectionId(1)), Some(room("gone")));
        assert_eq!(store.member_count(&room("gone")), 0);
        assert_eq!(store.room_count(), 0);
    }

    #[test]
    fn test_leave_is_idempotent() {
        let mut store = RoomStore::new();
        assert_eq!(store.leave(ConnectionId(9)), None);

        store.join(ConnectionId(9), room("r"));
        assert!(store.leave(ConnectionId(9)).is_some());
        assert_eq!(store.leave(ConnectionId(9)), None);
        assert_eq!(store.room_count(), 0);
    }

    #[test]
    fn test_members_of_unknown_room_is_empty() {
        let store = RoomStore::new();
        assert_eq!(store.members(&room("nobody")).count(), 0);
    }
}
