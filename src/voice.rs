//! Ephemeral per-room voice-chat presence.
//!
//! ```text
//! VoicePresenceManager
//!   chats: RwLock<HashMap<RoomId, Arc<VoiceChat>>>     (create / delete only)
//!            │
//!            ▼
//!   VoiceChat { started_at, seats: RwLock<HashMap<UserId, Seat>> }
//!                                        (join / leave / update / read)
//! ```
//!
//! A room's `VoiceChat` exists while it has at least one participant: it
//! is created by the first join and removed by the leave that empties it.
//! Activity in one room's chat never takes another room's lock, and only
//! creating or deleting a chat takes the map write lock.
//!
//! A seat remembers the connection that joined it, so teardown of a
//! replaced connection cannot remove the seat of the user's newer one.
//!
//! Every operation tolerates missing state. Leaving or updating a room or
//! user that is not tracked is a silent no-op.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::protocol::{RoomId, UserId, VoiceStateUpdate};

/// A user currently present in a room's voice chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceParticipant {
    pub user_id: UserId,
    pub muted: bool,
    pub deafened: bool,
    pub speaking: bool,
    pub audio_level: f64,
    pub joined_at: DateTime<Utc>,
}

impl VoiceParticipant {
    fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            muted: false,
            deafened: false,
            speaking: false,
            audio_level: 0.0,
            joined_at: Utc::now(),
        }
    }
}

/// Point-in-time copy of a room's voice chat.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoiceChatSnapshot {
    pub room_id: RoomId,
    pub active: bool,
    pub started_at: DateTime<Utc>,
    pub participants: Vec<VoiceParticipant>,
}

struct Seat {
    /// Connection that joined, if any.
    conn_id: Option<Uuid>,
    participant: VoiceParticipant,
}

struct VoiceChat {
    started_at: DateTime<Utc>,
    seats: RwLock<HashMap<UserId, Seat>>,
}

impl VoiceChat {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            seats: RwLock::new(HashMap::new()),
        }
    }

    async fn participants(&self) -> Vec<VoiceParticipant> {
        let mut participants: Vec<VoiceParticipant> = self
            .seats
            .read()
            .await
            .values()
            .map(|seat| seat.participant.clone())
            .collect();
        participants.sort_by_key(|p| p.user_id);
        participants
    }
}

/// Tracks voice-chat membership and audio state for every room.
#[derive(Default)]
pub struct VoicePresenceManager {
    chats: RwLock<HashMap<RoomId, Arc<VoiceChat>>>,
}

impl VoicePresenceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `user_id` to the room's voice chat, starting the chat if needed.
    ///
    /// Re-joining resets the participant to the default audio state.
    /// Returns the participant as stored.
    pub async fn join(&self, room_id: RoomId, user_id: UserId) -> VoiceParticipant {
        self.seat(room_id, user_id, None).await
    }

    /// Like [`join`](Self::join), recording `conn_id` as the seat's owner.
    pub async fn join_via(&self, room_id: RoomId, user_id: UserId, conn_id: Uuid) -> VoiceParticipant {
        self.seat(room_id, user_id, Some(conn_id)).await
    }

    async fn seat(&self, room_id: RoomId, user_id: UserId, conn_id: Option<Uuid>) -> VoiceParticipant {
        let participant = VoiceParticipant::new(user_id);
        let seat = Seat {
            conn_id,
            participant: participant.clone(),
        };

        // The map read guard is held across the insert so a concurrent
        // leave cannot delete the chat out from under us.
        {
            let chats = self.chats.read().await;
            if let Some(chat) = chats.get(&room_id) {
                chat.seats.write().await.insert(user_id, seat);
                log::info!("User {user_id} joined voice chat in room {room_id}");
                return participant;
            }
        }

        let mut chats = self.chats.write().await;
        let chat = chats.entry(room_id).or_insert_with(|| {
            log::info!("Voice chat started in room {room_id}");
            Arc::new(VoiceChat::new())
        });
        chat.seats.write().await.insert(user_id, seat);
        log::info!("User {user_id} joined voice chat in room {room_id}");

        participant
    }

    /// Remove `user_id` from the room's voice chat, ending the chat when it
    /// becomes empty.
    ///
    /// Returns `true` if the user was a participant.
    pub async fn leave(&self, room_id: RoomId, user_id: UserId) -> bool {
        self.vacate(room_id, user_id, |_| true).await
    }

    /// Remove `user_id` only if connection `conn_id` joined the seat.
    ///
    /// Returns `true` if a seat was removed.
    pub async fn leave_via(&self, room_id: RoomId, user_id: UserId, conn_id: Uuid) -> bool {
        self.vacate(room_id, user_id, |seat| seat.conn_id == Some(conn_id))
            .await
    }

    async fn vacate<F>(&self, room_id: RoomId, user_id: UserId, owned: F) -> bool
    where
        F: Fn(&Seat) -> bool,
    {
        let now_empty = {
            let chats = self.chats.read().await;
            let Some(chat) = chats.get(&room_id) else {
                return false;
            };
            let mut seats = chat.seats.write().await;
            if !seats.get(&user_id).is_some_and(|seat| owned(seat)) {
                return false;
            }
            seats.remove(&user_id);
            log::info!("User {user_id} left voice chat in room {room_id}");
            seats.is_empty()
        };

        if now_empty {
            let mut chats = self.chats.write().await;
            // A join may have landed between releasing the read lock and
            // taking the write lock.
            if let Some(chat) = chats.get(&room_id) {
                if chat.seats.read().await.is_empty() {
                    chats.remove(&room_id);
                    log::info!("Voice chat ended in room {room_id}");
                }
            }
        }

        true
    }

    /// Overwrite a participant's audio state.
    ///
    /// Returns the updated participant, or `None` when the room has no
    /// voice chat or the user is not in it.
    pub async fn update_state(
        &self,
        room_id: RoomId,
        user_id: UserId,
        update: &VoiceStateUpdate,
    ) -> Option<VoiceParticipant> {
        let chats = self.chats.read().await;
        let chat = chats.get(&room_id)?;
        let mut seats = chat.seats.write().await;
        let participant = &mut seats.get_mut(&user_id)?.participant;

        participant.muted = update.muted;
        participant.deafened = update.deafened;
        participant.speaking = update.speaking;
        participant.audio_level = update.audio_level;

        log::trace!("Voice state of user {user_id} in room {room_id}: {update:?}");
        Some(participant.clone())
    }

    /// Copy of the room's current participants, ordered by user id.
    ///
    /// Empty when the room has no voice chat.
    pub async fn participants(&self, room_id: RoomId) -> Vec<VoiceParticipant> {
        let chats = self.chats.read().await;
        match chats.get(&room_id) {
            Some(chat) => chat.participants().await,
            None => Vec::new(),
        }
    }

    /// Snapshot of the room's voice chat, if one is running.
    pub async fn voice_chat(&self, room_id: RoomId) -> Option<VoiceChatSnapshot> {
        let chats = self.chats.read().await;
        let chat = chats.get(&room_id)?;
        Some(VoiceChatSnapshot {
            room_id,
            active: true,
            started_at: chat.started_at,
            participants: chat.participants().await,
        })
    }

    /// Whether the room currently has a voice chat.
    pub async fn has_voice_chat(&self, room_id: RoomId) -> bool {
        self.chats.read().await.contains_key(&room_id)
    }

    /// Number of rooms with a running voice chat.
    pub async fn active_chats(&self) -> usize {
        self.chats.read().await.len()
    }
}
