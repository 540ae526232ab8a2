//! Room registry and fan-out with backpressure.
//!
//! The hub is a single-owner task: the `room → user → connection`
//! registry lives inside [`Hub::run`] and is only reachable through
//! requests sent on a [`HubHandle`]. Registration, unregistration and
//! broadcasts are therefore totally ordered with respect to each other.
//!
//! ```text
//! Connection ──register/unregister──┐
//!                                   │      ┌───────────────┐
//! MessageRouter ──broadcast/direct──┼────► │  Hub (actor)  │
//!                                   │      │ rooms: R→U→C  │
//! observers ──members/stats─────────┘      └───────┬───────┘
//!                                                  │ try_send
//!                                   ┌──────────────┼──────────────┐
//!                                   ▼              ▼              ▼
//!                              outbound q     outbound q     outbound q
//! ```
//!
//! The hub holds the only sender of every outbound queue, so removing a
//! connection from the registry is what closes its queue. A recipient
//! whose queue is full or closed at broadcast time is evicted instead of
//! blocking the rest of the room.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Utf8Bytes;
use uuid::Uuid;

use crate::protocol::{RoomId, UserId};

/// A serialized envelope, shared cheaply between all recipients.
pub type Frame = Utf8Bytes;

/// Fan-out traffic class. Delivery is identical for both; they are
/// counted separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Editor deltas.
    Editor,
    /// Chat, WebRTC signaling and voice notifications.
    Signal,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Pending requests buffered before senders wait on the hub.
    pub command_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self { command_capacity: 1024 }
    }
}

/// Hub statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub rooms: usize,
    pub connections: usize,
    pub editor_broadcasts: u64,
    pub signal_broadcasts: u64,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub evictions: u64,
}

/// The hub's view of a registered connection.
///
/// Owns the sending half of the connection's outbound queue; dropping the
/// handle closes the queue.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub conn_id: Uuid,
    pub room_id: RoomId,
    pub user_id: UserId,
    outbound: mpsc::Sender<Frame>,
}

impl ConnectionHandle {
    pub fn new(conn_id: Uuid, room_id: RoomId, user_id: UserId, outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            conn_id,
            room_id,
            user_id,
            outbound,
        }
    }
}

enum HubCommand {
    Register(ConnectionHandle),
    Unregister {
        room_id: RoomId,
        user_id: UserId,
        conn_id: Uuid,
    },
    Broadcast {
        room_id: RoomId,
        sender: UserId,
        category: Category,
        frame: Frame,
    },
    Direct {
        room_id: RoomId,
        user_id: UserId,
        conn_id: Uuid,
        frame: Frame,
    },
    Members {
        room_id: RoomId,
        reply: oneshot::Sender<Vec<UserId>>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
}

/// Cloneable request side of a running [`Hub`].
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    /// Install a connection as `rooms[room_id][user_id]`.
    ///
    /// A connection already occupying that slot is evicted and its queue
    /// closed.
    pub async fn register(&self, conn: ConnectionHandle) {
        self.submit(HubCommand::Register(conn)).await;
    }

    /// Remove the connection `conn_id` if it still occupies its slot.
    ///
    /// Safe to call more than once, and from both loops of a connection.
    pub async fn unregister(&self, room_id: RoomId, user_id: UserId, conn_id: Uuid) {
        self.submit(HubCommand::Unregister {
            room_id,
            user_id,
            conn_id,
        })
        .await;
    }

    /// Fan `frame` out to every connection in the room except `sender`'s.
    pub async fn broadcast(&self, room_id: RoomId, sender: UserId, category: Category, frame: Frame) {
        self.submit(HubCommand::Broadcast {
            room_id,
            sender,
            category,
            frame,
        })
        .await;
    }

    /// Deliver `frame` to one specific connection.
    pub async fn send_direct(&self, room_id: RoomId, user_id: UserId, conn_id: Uuid, frame: Frame) {
        self.submit(HubCommand::Direct {
            room_id,
            user_id,
            conn_id,
            frame,
        })
        .await;
    }

    /// Users currently registered in the room, ascending.
    pub async fn room_members(&self, room_id: RoomId) -> Vec<UserId> {
        let (reply, rx) = oneshot::channel();
        self.submit(HubCommand::Members { room_id, reply }).await;
        rx.await.unwrap_or_default()
    }

    /// Current hub statistics.
    pub async fn stats(&self) -> HubStats {
        let (reply, rx) = oneshot::channel();
        self.submit(HubCommand::Stats { reply }).await;
        rx.await.unwrap_or_default()
    }

    async fn submit(&self, command: HubCommand) {
        if self.commands.send(command).await.is_err() {
            log::warn!("Hub is not running; request dropped");
        }
    }
}

/// The registry owner. Construct with [`Hub::new`] and drive with
/// [`Hub::run`], or use [`Hub::spawn`].
pub struct Hub {
    rooms: HashMap<RoomId, HashMap<UserId, ConnectionHandle>>,
    commands: mpsc::Receiver<HubCommand>,
    stats: HubStats,
}

impl Hub {
    /// Create a hub and the handle used to reach it.
    pub fn new(config: &HubConfig) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(config.command_capacity.max(1));
        let hub = Self {
            rooms: HashMap::new(),
            commands: rx,
            stats: HubStats::default(),
        };
        (hub, HubHandle { commands: tx })
    }

    /// Create a hub and run it on the current tokio runtime.
    pub fn spawn(config: &HubConfig) -> HubHandle {
        let (hub, handle) = Self::new(config);
        tokio::spawn(hub.run());
        handle
    }

    /// Process requests until every [`HubHandle`] has been dropped.
    pub async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            self.dispatch(command);
        }
        log::debug!("Hub stopped: all handles dropped");
    }

    fn dispatch(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register(conn) => self.register(conn),
            HubCommand::Unregister {
                room_id,
                user_id,
                conn_id,
            } => self.unregister(room_id, user_id, conn_id),
            HubCommand::Broadcast {
                room_id,
                sender,
                category,
                frame,
            } => self.broadcast(room_id, sender, category, frame),
            HubCommand::Direct {
                room_id,
                user_id,
                conn_id,
                frame,
            } => self.send_direct(room_id, user_id, conn_id, frame),
            HubCommand::Members { room_id, reply } => {
                let mut members: Vec<UserId> = self
                    .rooms
                    .get(&room_id)
                    .map(|room| room.keys().copied().collect())
                    .unwrap_or_default();
                members.sort_unstable();
                let _ = reply.send(members);
            }
            HubCommand::Stats { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn register(&mut self, conn: ConnectionHandle) {
        let (room_id, user_id, conn_id) = (conn.room_id, conn.user_id, conn.conn_id);
        let room = self.rooms.entry(room_id).or_default();

        if let Some(prior) = room.insert(user_id, conn) {
            // Dropping the prior handle closes its queue; its loops wind
            // down and their unregister no longer matches this slot.
            log::info!(
                "User {user_id} reconnected to room {room_id}; closing connection {}",
                prior.conn_id
            );
            self.stats.evictions += 1;
        }

        log::info!("User {user_id} joined room {room_id} (connection {conn_id})");
    }

    fn unregister(&mut self, room_id: RoomId, user_id: UserId, conn_id: Uuid) {
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return;
        };

        if room.get(&user_id).is_some_and(|c| c.conn_id == conn_id) {
            room.remove(&user_id);
            log::info!("User {user_id} left room {room_id}");
        }

        if room.is_empty() {
            self.rooms.remove(&room_id);
            log::debug!("Room {room_id} removed (empty)");
        }
    }

    fn broadcast(&mut self, room_id: RoomId, sender: UserId, category: Category, frame: Frame) {
        match category {
            Category::Editor => self.stats.editor_broadcasts += 1,
            Category::Signal => self.stats.signal_broadcasts += 1,
        }

        let Some(room) = self.rooms.get_mut(&room_id) else {
            log::trace!("Broadcast to empty room {room_id} dropped");
            return;
        };

        let mut dead = Vec::new();
        for (user_id, conn) in room.iter() {
            if *user_id == sender {
                continue;
            }
            match conn.outbound.try_send(frame.clone()) {
                Ok(()) => self.stats.messages_delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!("User {user_id} in room {room_id} is not keeping up; evicting");
                    dead.push(*user_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    log::debug!("User {user_id} in room {room_id} already closed; evicting");
                    dead.push(*user_id);
                }
            }
        }

        for user_id in dead {
            room.remove(&user_id);
            self.stats.messages_dropped += 1;
            self.stats.evictions += 1;
        }

        if room.is_empty() {
            self.rooms.remove(&room_id);
        }
    }

    fn send_direct(&mut self, room_id: RoomId, user_id: UserId, conn_id: Uuid, frame: Frame) {
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return;
        };
        let Some(conn) = room.get(&user_id).filter(|c| c.conn_id == conn_id) else {
            log::debug!("Direct message for stale connection {conn_id} dropped");
            return;
        };

        if conn.outbound.try_send(frame).is_ok() {
            self.stats.messages_delivered += 1;
            return;
        }

        log::warn!("Direct message to user {user_id} in room {room_id} failed; evicting");
        room.remove(&user_id);
        self.stats.messages_dropped += 1;
        self.stats.evictions += 1;
        if room.is_empty() {
            self.rooms.remove(&room_id);
        }
    }

    fn snapshot(&self) -> HubStats {
        HubStats {
            rooms: self.rooms.len(),
            connections: self.rooms.values().map(HashMap::len).sum(),
            ..self.stats.clone()
        }
    }
}
