use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::engine::duel::{DuelId, PlayerId, StateVersion};

use super::protocol::ServerMessage;

const LOG_TARGET: &str = "server::rooms";

pub type ConnectionId = u64;
pub type Outbound = mpsc::Sender<ServerMessage>;

struct Connection {
    id: ConnectionId,
    sender: Outbound,
}

/// A duel with at least one participant connected to this process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Room {
    pub duel_id: DuelId,
    pub participants: [PlayerId; 2],
    /// Newest version delivered to the room.
    pub last_version: StateVersion,
}

impl Room {
    pub fn contains(&self, player_id: PlayerId) -> bool {
        self.participants.contains(&player_id)
    }
}

/// Process-local sockets and the duel rooms they belong to.
#[derive(Default)]
pub struct RoomRegistry {
    connections: DashMap<PlayerId, Vec<Connection>>,
    rooms: DashMap<DuelId, Room>,
    next_id: AtomicU64,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, player_id: PlayerId, sender: Outbound) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections
            .entry(player_id)
            .or_default()
            .push(Connection { id, sender });
        debug!(target = LOG_TARGET, player_id, connection_id = id, "socket registered");
        id
    }

    /// Returns `true` when this was the player's last socket on this process.
    pub fn unregister(&self, player_id: PlayerId, connection_id: ConnectionId) -> bool {
        let mut last = false;
        if let Some(mut sockets) = self.connections.get_mut(&player_id) {
            sockets.retain(|conn| conn.id != connection_id);
            last = sockets.is_empty();
        }
        if last {
            self.connections
                .remove_if(&player_id, |_, sockets| sockets.is_empty());
        }
        debug!(target = LOG_TARGET, player_id, connection_id, last, "socket unregistered");
        last
    }

    pub fn is_connected(&self, player_id: PlayerId) -> bool {
        self.connections
            .get(&player_id)
            .is_some_and(|sockets| !sockets.is_empty())
    }

    pub fn any_connected(&self, players: &[PlayerId]) -> bool {
        players.iter().any(|player| self.is_connected(*player))
    }

    /// Queues `message` on every socket of the player; full or closed sockets are skipped.
    pub fn send_to_player(&self, player_id: PlayerId, message: &ServerMessage) -> usize {
        let Some(sockets) = self.connections.get(&player_id) else {
            return 0;
        };
        sockets
            .iter()
            .filter(|conn| match conn.sender.try_send(message.clone()) {
                Ok(()) => true,
                Err(err) => {
                    debug!(
                        target = LOG_TARGET,
                        player_id,
                        connection_id = conn.id,
                        error = %err,
                        "dropping outbound message"
                    );
                    false
                }
            })
            .count()
    }

    /// Opens the room; `false` when it already exists.
    pub fn join(&self, duel_id: DuelId, participants: [PlayerId; 2], version: StateVersion) -> bool {
        let mut created = false;
        self.rooms.entry(duel_id).or_insert_with(|| {
            created = true;
            Room {
                duel_id,
                participants,
                last_version: version,
            }
        });
        if created {
            debug!(target = LOG_TARGET, duel_id = %duel_id, "room opened");
        }
        created
    }

    pub fn room(&self, duel_id: DuelId) -> Option<Room> {
        self.rooms.get(&duel_id).map(|room| *room)
    }

    /// Records `version` as delivered; `false` if the room already saw it or something newer.
    pub fn advance(&self, duel_id: DuelId, version: StateVersion) -> bool {
        match self.rooms.get_mut(&duel_id) {
            Some(mut room) if room.last_version < version => {
                room.last_version = version;
                true
            }
            _ => false,
        }
    }

    pub fn leave(&self, duel_id: DuelId) -> Option<Room> {
        let room = self.rooms.remove(&duel_id).map(|(_, room)| room);
        if room.is_some() {
            debug!(target = LOG_TARGET, duel_id = %duel_id, "room closed");
        }
        room
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
