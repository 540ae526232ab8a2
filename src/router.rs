//! Classification and dispatch of inbound envelopes.
//!
//! | type | action |
//! |------|--------|
//! | `editor` | editor broadcast to room minus sender |
//! | `chat`, `webrtc-*` | signal broadcast to room minus sender |
//! | `voice-join` / `voice-leave` / `voice-state-update` | voice manager, then notify room minus sender |
//! | `voice-participants` | voice manager snapshot, replied to the requesting connection only |
//!
//! Anything else is reported as a [`ProtocolError`]; the caller logs it
//! and keeps the connection open.

use std::sync::Arc;

use uuid::Uuid;

use crate::hub::{Category, Frame, HubHandle};
use crate::protocol::{Envelope, Event, ProtocolError, RoomId, UserId, VoiceMember};
use crate::voice::VoicePresenceManager;

/// The connection an envelope arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origin {
    pub conn_id: Uuid,
    pub room_id: RoomId,
    pub user_id: UserId,
}

/// What the router did with an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Fanned out to the room through the hub.
    Broadcast(Category),
    /// Applied to voice presence; the room was notified if state changed.
    Voice,
    /// Answered directly to the originating connection.
    Reply,
}

/// Fan-out category for relayed events, `None` for voice control.
pub fn category(event: &Event) -> Option<Category> {
    match event {
        Event::Editor(_) => Some(Category::Editor),
        Event::Chat(_)
        | Event::WebrtcOffer(_)
        | Event::WebrtcAnswer(_)
        | Event::WebrtcCandidate(_) => Some(Category::Signal),
        _ => None,
    }
}

/// Routes decoded envelopes to the hub or the voice presence manager.
#[derive(Clone)]
pub struct MessageRouter {
    hub: HubHandle,
    voice: Arc<VoicePresenceManager>,
}

impl MessageRouter {
    pub fn new(hub: HubHandle, voice: Arc<VoicePresenceManager>) -> Self {
        Self { hub, voice }
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    pub fn voice(&self) -> &Arc<VoicePresenceManager> {
        &self.voice
    }

    /// Decode a raw frame, stamp it with the origin's identity and route it.
    pub async fn route_frame(&self, origin: &Origin, raw: &[u8]) -> Result<Route, ProtocolError> {
        let mut envelope = Envelope::decode(raw)?;
        envelope.stamp(origin.room_id, origin.user_id);
        self.route(origin, envelope).await
    }

    /// Route an already stamped envelope.
    pub async fn route(&self, origin: &Origin, envelope: Envelope) -> Result<Route, ProtocolError> {
        if let Some(class) = category(&envelope.event) {
            log::trace!(
                "Relaying {} from user {} in room {}",
                envelope.event.kind(),
                origin.user_id,
                origin.room_id
            );
            let frame = Frame::from(envelope.encode()?);
            self.hub
                .broadcast(origin.room_id, origin.user_id, class, frame)
                .await;
            return Ok(Route::Broadcast(class));
        }

        match envelope.event {
            Event::VoiceJoin(_) => {
                let participant = self
                    .voice
                    .join_via(origin.room_id, origin.user_id, origin.conn_id)
                    .await;
                self.notify_room(origin, Event::VoiceUserJoined(participant)).await?;
                Ok(Route::Voice)
            }
            Event::VoiceLeave(_) => {
                if self.voice.leave(origin.room_id, origin.user_id).await {
                    let left = VoiceMember { user_id: origin.user_id };
                    self.notify_room(origin, Event::VoiceUserLeft(left)).await?;
                }
                Ok(Route::Voice)
            }
            Event::VoiceStateUpdate(mut update) => {
                update.user_id = origin.user_id;
                let applied = self
                    .voice
                    .update_state(origin.room_id, origin.user_id, &update)
                    .await;
                if applied.is_some() {
                    self.notify_room(origin, Event::VoiceStateUpdated(update)).await?;
                }
                Ok(Route::Voice)
            }
            Event::VoiceParticipants => {
                let participants = self.voice.participants(origin.room_id).await;
                let reply = Envelope::new(
                    origin.room_id,
                    origin.user_id,
                    Event::VoiceParticipantsList(participants),
                );
                let frame = Frame::from(reply.encode()?);
                self.hub
                    .send_direct(origin.room_id, origin.user_id, origin.conn_id, frame)
                    .await;
                Ok(Route::Reply)
            }
            other => Err(ProtocolError::UnknownType(other.kind().to_string())),
        }
    }

    /// Voice cleanup for a connection that has gone away.
    ///
    /// Only a seat joined through this connection is released; a newer
    /// connection of the same user keeps its voice presence.
    pub async fn disconnect(&self, origin: &Origin) {
        if self
            .voice
            .leave_via(origin.room_id, origin.user_id, origin.conn_id)
            .await
        {
            let left = VoiceMember { user_id: origin.user_id };
            if let Err(e) = self.notify_room(origin, Event::VoiceUserLeft(left)).await {
                log::error!("Failed to announce voice leave for user {}: {e}", origin.user_id);
            }
        }
    }

    async fn notify_room(&self, origin: &Origin, event: Event) -> Result<(), ProtocolError> {
        let frame = Frame::from(Envelope::new(origin.room_id, origin.user_id, event).encode()?);
        self.hub
            .broadcast(origin.room_id, origin.user_id, Category::Signal, frame)
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{ConnectionHandle, Hub, HubConfig};
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    struct Peer {
        origin: Origin,
        rx: mpsc::Receiver<Frame>,
    }

    impl Peer {
        fn next(&mut self) -> Option<Value> {
            self.rx
                .try_recv()
                .ok()
                .map(|frame| serde_json::from_str(frame.as_str()).unwrap())
        }
    }

    async fn setup(users: &[UserId]) -> (MessageRouter, Vec<Peer>) {
        let hub = Hub::spawn(&HubConfig::default());
        let router = MessageRouter::new(hub.clone(), Arc::new(VoicePresenceManager::new()));
        let mut peers = Vec::new();
        for &user_id in users {
            let (tx, rx) = mpsc::channel(16);
            let origin = Origin {
                conn_id: Uuid::new_v4(),
                room_id: 7,
                user_id,
            };
            hub.register(ConnectionHandle::new(origin.conn_id, 7, user_id, tx)).await;
            peers.push(Peer { origin, rx });
        }
        (router, peers)
    }

    async fn send(router: &MessageRouter, from: &Peer, message: Value) -> Result<Route, ProtocolError> {
        let route = router.route_frame(&from.origin, message.to_string().as_bytes()).await;
        // Round-trip through the hub so every queued delivery has happened.
        router.hub().stats().await;
        route
    }

    #[tokio::test]
    async fn test_editor_reaches_peer_only() {
        let (router, mut peers) = setup(&[1, 2]).await;

        let route = send(&router, &peers[0], json!({"type": "editor", "data": {"content": "x"}})).await;
        assert_eq!(route, Ok(Route::Broadcast(Category::Editor)));

        let received = peers[1].next().unwrap();
        assert_eq!(received["user_id"], 1);
        assert_eq!(received["room_id"], 7);
        assert_eq!(received["type"], "editor");
        assert_eq!(received["data"]["content"], "x");
        assert!(peers[1].next().is_none());
        assert!(peers[0].next().is_none());
    }

    #[tokio::test]
    async fn test_client_identity_is_overwritten() {
        let (router, mut peers) = setup(&[1, 2]).await;

        send(
            &router,
            &peers[0],
            json!({"room_id": 500, "user_id": 2, "timestamp": 0, "type": "chat", "data": "hi"}),
        )
        .await
        .unwrap();

        let received = peers[1].next().unwrap();
        assert_eq!(received["user_id"], 1);
        assert_eq!(received["room_id"], 7);
        assert_ne!(received["timestamp"], 0);
    }

    #[tokio::test]
    async fn test_signaling_uses_signal_category() {
        let (router, mut peers) = setup(&[1, 2]).await;

        for message in [
            json!({"type": "chat", "data": {"text": "hello"}}),
            json!({"type": "webrtc-offer", "data": {"sdp": "v=0", "target_user": 2}}),
            json!({"type": "webrtc-answer", "data": {"sdp": "v=0", "target_user": 2}}),
            json!({"type": "webrtc-candidate", "data": {"candidate": "c", "target_user": 2}}),
        ] {
            let route = send(&router, &peers[0], message.clone()).await;
            assert_eq!(route, Ok(Route::Broadcast(Category::Signal)));
            assert_eq!(peers[1].next().unwrap()["type"], message["type"]);
        }
    }

    #[tokio::test]
    async fn test_voice_join_notifies_room() {
        let (router, mut peers) = setup(&[1, 2]).await;

        let route = send(&router, &peers[0], json!({"type": "voice-join", "data": {"user_id": 1}})).await;
        assert_eq!(route, Ok(Route::Voice));

        let participants = router.voice().participants(7).await;
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0].user_id, 1);
        assert!(!participants[0].muted);

        let joined = peers[1].next().unwrap();
        assert_eq!(joined["type"], "voice-user-joined");
        assert_eq!(joined["data"]["user_id"], 1);
        assert_eq!(joined["data"]["muted"], false);
        assert!(peers[0].next().is_none());
    }

    #[tokio::test]
    async fn test_voice_state_update_notifies_room() {
        let (router, mut peers) = setup(&[1, 2]).await;
        send(&router, &peers[0], json!({"type": "voice-join"})).await.unwrap();
        peers[1].next();

        send(&router, &peers[0], json!({"type": "voice-state-update", "data": {"muted": true}}))
            .await
            .unwrap();

        assert!(router.voice().participants(7).await[0].muted);
        let updated = peers[1].next().unwrap();
        assert_eq!(updated["type"], "voice-state-updated");
        assert_eq!(updated["data"]["user_id"], 1);
        assert_eq!(updated["data"]["muted"], true);
    }

    #[tokio::test]
    async fn test_voice_state_update_without_join_is_silent() {
        let (router, mut peers) = setup(&[1, 2]).await;

        let route = send(&router, &peers[0], json!({"type": "voice-state-update", "data": {"muted": true}})).await;
        assert_eq!(route, Ok(Route::Voice));
        assert!(peers[1].next().is_none());
        assert!(!router.voice().has_voice_chat(7).await);
    }

    #[tokio::test]
    async fn test_voice_leave_notifies_only_when_present() {
        let (router, mut peers) = setup(&[1, 2]).await;

        send(&router, &peers[0], json!({"type": "voice-leave"})).await.unwrap();
        assert!(peers[1].next().is_none());

        send(&router, &peers[0], json!({"type": "voice-join"})).await.unwrap();
        peers[1].next();
        send(&router, &peers[0], json!({"type": "voice-leave"})).await.unwrap();

        let left = peers[1].next().unwrap();
        assert_eq!(left["type"], "voice-user-left");
        assert_eq!(left["data"], json!({"user_id": 1}));
        assert!(!router.voice().has_voice_chat(7).await);
    }

    #[tokio::test]
    async fn test_participants_reply_goes_to_requester() {
        let (router, mut peers) = setup(&[1, 2]).await;
        send(&router, &peers[1], json!({"type": "voice-join"})).await.unwrap();
        peers[0].next();

        let route = send(&router, &peers[0], json!({"type": "voice-participants"})).await;
        assert_eq!(route, Ok(Route::Reply));

        let reply = peers[0].next().unwrap();
        assert_eq!(reply["type"], "voice-participants-list");
        assert_eq!(reply["user_id"], 1);
        let list = reply["data"].as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["user_id"], 2);
        assert!(peers[1].next().is_none());
    }

    #[tokio::test]
    async fn test_participants_reply_empty_room() {
        let (router, mut peers) = setup(&[1]).await;
        send(&router, &peers[0], json!({"type": "voice-participants"})).await.unwrap();

        let reply = peers[0].next().unwrap();
        assert_eq!(reply["data"], json!([]));
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_are_dropped() {
        let (router, mut peers) = setup(&[1, 2]).await;

        let unknown = send(&router, &peers[0], json!({"type": "teleport", "data": {}})).await;
        assert_eq!(unknown, Err(ProtocolError::UnknownType("teleport".into())));

        let malformed = router.route_frame(&peers[0].origin, b"{not json").await;
        assert!(matches!(malformed, Err(ProtocolError::Malformed(_))));

        router.hub().stats().await;
        assert!(peers[1].next().is_none());
        assert_eq!(router.hub().room_members(7).await, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_disconnect_leaves_voice_and_notifies() {
        let (router, mut peers) = setup(&[1, 2]).await;
        send(&router, &peers[0], json!({"type": "voice-join"})).await.unwrap();
        peers[1].next();

        router.disconnect(&peers[0].origin).await;
        router.hub().stats().await;

        assert!(!router.voice().has_voice_chat(7).await);
        assert_eq!(peers[1].next().unwrap()["type"], "voice-user-left");

        router.disconnect(&peers[0].origin).await;
        router.hub().stats().await;
        assert!(peers[1].next().is_none());
    }

    #[tokio::test]
    async fn test_stale_disconnect_keeps_newer_voice_seat() {
        let (router, mut peers) = setup(&[1, 2]).await;
        send(&router, &peers[0], json!({"type": "voice-join"})).await.unwrap();
        peers[1].next();

        // User 1 reconnects and joins voice again before the old
        // connection's teardown runs.
        let (tx, _rx) = mpsc::channel(16);
        let replacement = Origin {
            conn_id: Uuid::new_v4(),
            ..peers[0].origin
        };
        router
            .hub()
            .register(ConnectionHandle::new(replacement.conn_id, 7, 1, tx))
            .await;
        router
            .route_frame(&replacement, json!({"type": "voice-join"}).to_string().as_bytes())
            .await
            .unwrap();
        router.hub().stats().await;
        peers[1].next();

        router.disconnect(&peers[0].origin).await;
        router.hub().stats().await;

        assert_eq!(router.voice().participants(7).await.len(), 1);
        assert!(peers[1].next().is_none());
    }

    #[test]
    fn test_category_classification() {
        assert_eq!(category(&Event::Chat(Value::Null)), Some(Category::Signal));
        assert_eq!(category(&Event::VoiceParticipants), None);
        assert_eq!(category(&Event::VoiceJoin(VoiceMember::default())), None);
    }
}
