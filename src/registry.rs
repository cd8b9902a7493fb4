//! Room membership registry.
//!
//! Rooms are named, ephemeral groups of connections used to scope message
//! delivery. A room is created implicitly on first join and ceases to exist
//! when its member set drains; absence from the registry means "does not
//! exist", so the send path never needs an existence check.
//!
//! The registry keeps a forward index (room to members) and a reverse index
//! (connection to joined rooms) under one lock, so disconnect cleanup does not
//! scan every room. Both indexes are always updated together.
//!
//! Authentication gating for join/leave lives in [`crate::server`], where
//! connection lifecycle state is visible.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use tracing::{debug, trace};

use crate::types::ConnectionId;

#[derive(Default)]
struct RegistryInner {
    rooms: HashMap<String, HashSet<ConnectionId>>,
    memberships: HashMap<ConnectionId, HashSet<String>>,
}

/// Tracks which connections are members of which rooms.
///
/// All operations take `&self`; the registry is shared behind an `Arc` and is
/// safe for concurrent reads (relay fan-out) and writes (join/leave/cleanup)
/// from independent connection tasks.
#[derive(Default)]
pub struct RoomRegistry {
    inner: RwLock<RegistryInner>,
}

impl RoomRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the connection to the room's member set, creating the room on
    /// first join.
    ///
    /// Idempotent: joining a room twice has no additional effect. Returns
    /// `true` if the membership is new.
    pub fn join(&self, connection_id: ConnectionId, room: &str) -> bool {
        let mut inner = self.inner.write().unwrap();
        let added = inner
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(connection_id);
        if added {
            inner
                .memberships
                .entry(connection_id)
                .or_default()
                .insert(room.to_string());
            debug!(connection = %connection_id, room, "joined room");
        } else {
            trace!(connection = %connection_id, room, "already a member");
        }
        added
    }

    /// Removes the connection from the room's member set.
    ///
    /// Idempotent: leaving a room never joined is a no-op, not an error.
    /// Returns `true` if a membership was removed. The room is dropped when
    /// its member set drains.
    pub fn leave(&self, connection_id: ConnectionId, room: &str) -> bool {
        let mut inner = self.inner.write().unwrap();

        let removed = match inner.rooms.get_mut(room) {
            Some(members) => members.remove(&connection_id),
            None => false,
        };
        if !removed {
            trace!(connection = %connection_id, room, "not a member, leave ignored");
            return false;
        }

        if inner.rooms.get(room).is_some_and(HashSet::is_empty) {
            inner.rooms.remove(room);
            debug!(room, "room drained");
        }
        if let Some(joined) = inner.memberships.get_mut(&connection_id) {
            joined.remove(room);
            if joined.is_empty() {
                inner.memberships.remove(&connection_id);
            }
        }
        debug!(connection = %connection_id, room, "left room");
        true
    }

    /// Returns the member set of a room.
    ///
    /// An unknown room yields an empty set; room absence is not an error.
    pub fn members(&self, room: &str) -> HashSet<ConnectionId> {
        self.inner
            .read()
            .unwrap()
            .rooms
            .get(room)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the rooms the connection has joined.
    pub fn rooms_of(&self, connection_id: ConnectionId) -> HashSet<String> {
        self.inner
            .read()
            .unwrap()
            .memberships
            .get(&connection_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Removes the connection from every room it had joined. Disconnect
    /// cleanup path; returns the number of rooms left.
    pub fn remove_connection(&self, connection_id: ConnectionId) -> usize {
        let mut inner = self.inner.write().unwrap();

        let Some(joined) = inner.memberships.remove(&connection_id) else {
            return 0;
        };

        for room in &joined {
            if let Some(members) = inner.rooms.get_mut(room) {
                members.remove(&connection_id);
                if members.is_empty() {
                    inner.rooms.remove(room);
                    debug!(room = %room, "room drained");
                }
            }
        }

        debug!(
            connection = %connection_id,
            rooms_left = joined.len(),
            "membership cleaned up"
        );
        joined.len()
    }

    /// Number of rooms that currently exist.
    pub fn room_count(&self) -> usize {
        self.inner.read().unwrap().rooms.len()
    }
}
