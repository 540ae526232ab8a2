//! JSON wire protocol for room-scoped real-time events.
//!
//! Wire format (one envelope per WebSocket frame):
//! ```text
//! ┌──────────┬──────────┬──────────┬───────────┬──────────────────┐
//! │ room_id  │ user_id  │ type     │ timestamp │ data             │
//! │ integer  │ integer  │ string   │ unix secs │ depends on type  │
//! └──────────┴──────────┴──────────┴───────────┴──────────────────┘
//! ```
//!
//! `room_id`, `user_id` and `timestamp` are always stamped by the server;
//! whatever a client puts there is overwritten before routing.
//!
//! Client-originated kinds: `editor`, `chat`, `webrtc-offer`,
//! `webrtc-answer`, `webrtc-candidate`, `voice-join`, `voice-leave`,
//! `voice-state-update`, `voice-participants`.
//!
//! Server-emitted kinds: `voice-user-joined`, `voice-user-left`,
//! `voice-state-updated`, `voice-participants-list`.

use serde::de::DeserializeOwned;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::voice::VoiceParticipant;

/// Opaque room identifier.
pub type RoomId = i64;

/// Opaque user identifier.
pub type UserId = i64;

/// Line/column position inside the shared editor buffer.
///
/// Signed: the hub relays positions without interpreting them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPos {
    pub line: i64,
    pub column: i64,
}

/// Editor delta: replace the range `from..to` with `content`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditorChange {
    pub content: String,
    #[serde(default)]
    pub from: CursorPos,
    #[serde(default)]
    pub to: CursorPos,
}

/// WebRTC offer or answer addressed to one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdpSignal {
    pub sdp: String,
    pub target_user: UserId,
}

/// Trickled ICE candidate addressed to one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub target_user: UserId,
}

/// `{user_id}` payload used by voice join/leave requests and the
/// `voice-user-left` notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceMember {
    #[serde(default)]
    pub user_id: UserId,
}

/// Audio state reported by a voice participant.
///
/// Every field is optional on the wire; missing fields decode as
/// unmuted / silent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceStateUpdate {
    pub user_id: UserId,
    pub muted: bool,
    pub deafened: bool,
    pub speaking: bool,
    pub audio_level: f64,
}

/// Typed envelope payload, keyed by the wire `type` tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Editor(EditorChange),
    /// Chat payloads are opaque to the hub.
    Chat(Value),
    WebrtcOffer(SdpSignal),
    WebrtcAnswer(SdpSignal),
    WebrtcCandidate(IceCandidate),
    VoiceJoin(VoiceMember),
    VoiceLeave(VoiceMember),
    VoiceStateUpdate(VoiceStateUpdate),
    VoiceParticipants,
    VoiceUserJoined(VoiceParticipant),
    VoiceUserLeft(VoiceMember),
    VoiceStateUpdated(VoiceStateUpdate),
    VoiceParticipantsList(Vec<VoiceParticipant>),
}

impl Event {
    /// Decode a client-originated event from its wire tag and raw payload.
    ///
    /// Server-emitted kinds are rejected as unknown: clients may not forge
    /// presence notifications.
    pub fn from_parts(kind: &str, data: Value) -> Result<Self, ProtocolError> {
        let event = match kind {
            "editor" => Event::Editor(payload(kind, data)?),
            "chat" => Event::Chat(data),
            "webrtc-offer" => Event::WebrtcOffer(payload(kind, data)?),
            "webrtc-answer" => Event::WebrtcAnswer(payload(kind, data)?),
            "webrtc-candidate" => Event::WebrtcCandidate(payload(kind, data)?),
            // The acting user is always the connection's own user, so the
            // join/leave body carries nothing we need.
            "voice-join" => Event::VoiceJoin(serde_json::from_value(data).unwrap_or_default()),
            "voice-leave" => Event::VoiceLeave(serde_json::from_value(data).unwrap_or_default()),
            "voice-state-update" => Event::VoiceStateUpdate(payload_or_default(kind, data)?),
            "voice-participants" => Event::VoiceParticipants,
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        };
        Ok(event)
    }

    /// Wire tag for this event.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Editor(_) => "editor",
            Event::Chat(_) => "chat",
            Event::WebrtcOffer(_) => "webrtc-offer",
            Event::WebrtcAnswer(_) => "webrtc-answer",
            Event::WebrtcCandidate(_) => "webrtc-candidate",
            Event::VoiceJoin(_) => "voice-join",
            Event::VoiceLeave(_) => "voice-leave",
            Event::VoiceStateUpdate(_) => "voice-state-update",
            Event::VoiceParticipants => "voice-participants",
            Event::VoiceUserJoined(_) => "voice-user-joined",
            Event::VoiceUserLeft(_) => "voice-user-left",
            Event::VoiceStateUpdated(_) => "voice-state-updated",
            Event::VoiceParticipantsList(_) => "voice-participants-list",
        }
    }
}

fn payload<T: DeserializeOwned>(kind: &str, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|e| ProtocolError::InvalidPayload {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

fn payload_or_default<T: DeserializeOwned + Default>(
    kind: &str,
    data: Value,
) -> Result<T, ProtocolError> {
    if data.is_null() {
        return Ok(T::default());
    }
    payload(kind, data)
}

/// Envelope as it arrives from a client, before the payload is typed.
#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    room_id: RoomId,
    #[serde(default)]
    user_id: UserId,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    timestamp: i64,
    #[serde(default)]
    data: Value,
}

/// Top-level wire message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub room_id: RoomId,
    pub user_id: UserId,
    /// Unix seconds.
    pub timestamp: i64,
    pub event: Event,
}

impl Envelope {
    /// Create a server-originated envelope stamped with the current time.
    pub fn new(room_id: RoomId, user_id: UserId, event: Event) -> Self {
        Self {
            room_id,
            user_id,
            timestamp: chrono::Utc::now().timestamp(),
            event,
        }
    }

    /// Decode a client frame.
    ///
    /// Fails with [`ProtocolError::Malformed`] for undecodable JSON,
    /// [`ProtocolError::UnknownType`] for an unrecognised tag and
    /// [`ProtocolError::InvalidPayload`] when `data` does not match the
    /// tag's schema.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope = serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let event = Event::from_parts(&raw.kind, raw.data)?;
        Ok(Self {
            room_id: raw.room_id,
            user_id: raw.user_id,
            timestamp: raw.timestamp,
            event,
        })
    }

    /// Overwrite the client-supplied identity and time with server values.
    pub fn stamp(&mut self, room_id: RoomId, user_id: UserId) {
        self.room_id = room_id;
        self.user_id = user_id;
        self.timestamp = chrono::Utc::now().timestamp();
    }

    /// Serialize to the JSON wire format.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(5))?;
        map.serialize_entry("room_id", &self.room_id)?;
        map.serialize_entry("user_id", &self.user_id)?;
        map.serialize_entry("type", self.event.kind())?;
        map.serialize_entry("timestamp", &self.timestamp)?;
        map.serialize_entry("data", &EventData(&self.event))?;
        map.end()
    }
}

/// Serializes only the payload of an event (the `data` field).
struct EventData<'a>(&'a Event);

impl Serialize for EventData<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            Event::Editor(p) => p.serialize(serializer),
            Event::Chat(p) => p.serialize(serializer),
            Event::WebrtcOffer(p) | Event::WebrtcAnswer(p) => p.serialize(serializer),
            Event::WebrtcCandidate(p) => p.serialize(serializer),
            Event::VoiceJoin(p) | Event::VoiceLeave(p) | Event::VoiceUserLeft(p) => {
                p.serialize(serializer)
            }
            Event::VoiceStateUpdate(p) | Event::VoiceStateUpdated(p) => p.serialize(serializer),
            Event::VoiceParticipants => serializer.serialize_none(),
            Event::VoiceUserJoined(p) => p.serialize(serializer),
            Event::VoiceParticipantsList(p) => p.serialize(serializer),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(String),
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("Invalid {kind} payload: {reason}")]
    InvalidPayload { kind: String, reason: String },
    #[error("Serialization error: {0}")]
    SerializationError(String),
}
