//! # collab-hub: Real-time presence and fan-out for collaborative rooms
//!
//! Relays editor changes, chat, WebRTC signaling and voice presence
//! between the members of a room over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   WebSocket (JSON)  ┌──────────────────────────┐
//! │ Browser     │ ◄─────────────────► │ Connection               │
//! │ (per user)  │                     │ read loop │ write loop   │
//! └─────────────┘                     └─────┬───────────▲────────┘
//!                                           │           │ outbound queue
//!                                           ▼           │
//!                                    ┌─────────────┐    │
//!                                    │MessageRouter│    │
//!                                    └──┬───────┬──┘    │
//!                                       │       │       │
//!                            ┌──────────▼──┐ ┌──▼───────┴──┐
//!                            │ VoicePresence│ │ Hub (actor) │
//!                            │ Manager      │ │ room fan-out│
//!                            └──────────────┘ └─────────────┘
//! ```
//!
//! The hub owns every room registry and is mutated only through its
//! command channel. Voice presence is a separately locked structure so
//! participant queries never wait on the hub.
//!
//! ## Modules
//!
//! - [`protocol`]: JSON envelope and typed events
//! - [`hub`]: Room registry and broadcast actor
//! - [`connection`]: Per-socket read/write loops with keepalive
//! - [`router`]: Dispatch of decoded events
//! - [`voice`]: Voice chat presence
//! - [`server`]: WebSocket acceptor and identity admission
//! - [`config`]: Environment-driven configuration
//! - [`execute`]: Remote code execution proxy

pub mod protocol;
pub mod hub;
pub mod connection;
pub mod router;
pub mod voice;
pub mod server;
pub mod config;
pub mod execute;

// Re-exports for convenience
pub use protocol::{Envelope, Event, ProtocolError, RoomId, UserId};
pub use hub::{Category, Hub, HubConfig, HubHandle, HubStats};
pub use connection::{Connection, ConnectionConfig, Identity};
pub use router::{MessageRouter, Origin, Route};
pub use voice::{VoiceChatSnapshot, VoiceParticipant, VoicePresenceManager};
pub use server::{AdmissionError, HubServer, IdentityResolver, QueryIdentityResolver, ServerStats};
pub use config::{ConfigError, ServerConfig};
pub use execute::{
    CodeExecutor, ExecStatus, ExecuteError, ExecuteRequest, ExecuteResponse, ExecutorConfig,
    Language,
};
