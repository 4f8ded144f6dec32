//! Live room membership and best-effort broadcast
//!
//! A room is the set of transport connections currently associated with a
//! call id. Rooms are purely in-memory; they are reconstructed from active
//! connections as peers join and vanish when their last member leaves. The
//! registry owns the mapping exclusively; connection tasks never mutate a
//! room except through it.

use std::collections::HashMap;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::messages::{Role, WireMessage};

/// Connection identifier, unique per process
pub type ConnId = u64;

/// A member of a room: the connection's role tag and its outbound queue.
///
/// The queue is bounded: a slow or stalled member gets messages dropped
/// rather than stalling the broadcaster, and a closed queue marks the
/// member as disconnected.
#[derive(Clone)]
pub struct RoomMember {
    pub conn_id: ConnId,
    pub role: Role,
    tx: mpsc::Sender<String>,
}

impl RoomMember {
    pub fn new(conn_id: ConnId, role: Role, tx: mpsc::Sender<String>) -> Self {
        Self { conn_id, role, tx }
    }

    /// Queue a serialized message. Returns false only when the member's
    /// connection is gone; a full queue counts as delivered (dropped).
    fn send(&self, json: String) -> bool {
        match self.tx.try_send(json) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Dropping message to slow connection {}", self.conn_id);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// The live connection set for one call
#[derive(Default)]
pub struct Room {
    members: HashMap<ConnId, RoomMember>,
}

impl Room {
    pub fn add_member(&mut self, member: RoomMember) {
        self.members.insert(member.conn_id, member);
    }

    pub fn remove_member(&mut self, conn_id: ConnId) -> Option<RoomMember> {
        self.members.remove(&conn_id)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Registry of all live rooms, keyed by call id
#[derive(Default)]
pub struct RoomRegistry {
    rooms: DashMap<String, Room>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to the room, creating the room if needed
    pub fn join(&self, call_id: &str, member: RoomMember) {
        let conn_id = member.conn_id;
        self.rooms
            .entry(call_id.to_string())
            .or_default()
            .add_member(member);
        debug!("Connection {} joined room {}", conn_id, call_id);
    }

    /// Remove a connection from the room (idempotent); drops the room
    /// entry once it is empty so ended calls do not accumulate.
    /// Returns true if the connection was actually a member.
    pub fn leave(&self, call_id: &str, conn_id: ConnId) -> bool {
        let Some(mut room) = self.rooms.get_mut(call_id) else {
            return false;
        };
        let removed = room.remove_member(conn_id).is_some();

        if room.is_empty() {
            drop(room);
            self.rooms.remove_if(call_id, |_, r| r.is_empty());
            debug!("Room {} removed (empty)", call_id);
        }
        removed
    }

    /// Deliver a message to every member except `exclude` (the sender).
    ///
    /// Best-effort: one member's failure never aborts delivery to the
    /// others and never surfaces to the caller. Members whose queue is
    /// closed are returned so the caller can detach them through the
    /// normal disconnect path.
    pub fn broadcast(
        &self,
        call_id: &str,
        message: &WireMessage,
        exclude: Option<ConnId>,
    ) -> Vec<ConnId> {
        let json = match message.to_json() {
            Ok(j) => j,
            Err(e) => {
                warn!("Failed to serialize broadcast for room {}: {}", call_id, e);
                return Vec::new();
            }
        };

        let mut dead = Vec::new();
        if let Some(room) = self.rooms.get(call_id) {
            for member in room.members.values() {
                if Some(member.conn_id) == exclude {
                    continue;
                }
                if !member.send(json.clone()) {
                    debug!(
                        "Broadcast to connection {} in room {} failed (disconnected)",
                        member.conn_id, call_id
                    );
                    dead.push(member.conn_id);
                }
            }
        }
        dead
    }

    /// Number of live rooms (for monitoring)
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Number of connections across all rooms (for monitoring)
    pub fn member_count(&self) -> usize {
        self.rooms.iter().map(|r| r.member_count()).sum()
    }
}
