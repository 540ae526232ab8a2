//! WebSocket acceptor: admits authenticated connections to the hub.
//!
//! Architecture:
//! ```text
//! TCP accept ─► WebSocket upgrade ─► IdentityResolver ─► Connection::run
//!                     │                    │                   │
//!                     │              401 on failure      register with Hub,
//!                     │                                  spawn read/write loops
//!                     ▼
//!               ServerStats
//! ```
//!
//! Who a connection belongs to is decided before the hub ever sees it:
//! the [`IdentityResolver`] turns the upgrade request into an
//! [`Identity`] and the hub trusts that binding.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

use crate::config::ServerConfig;
use crate::connection::{Connection, Identity};
use crate::hub::Hub;
use crate::router::MessageRouter;
use crate::voice::VoicePresenceManager;

/// Why an upgrade request was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("Missing {0}")]
    Missing(&'static str),
    #[error("Invalid {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

/// Resolves the `(room, user)` binding of an upgrade request.
///
/// Implementations sit in front of the real session layer; the hub
/// performs no authorization of its own.
pub trait IdentityResolver: Send + Sync + 'static {
    fn resolve(&self, request: &Request) -> Result<Identity, AdmissionError>;
}

/// Reads `room_id` and `user_id` from the request query string.
///
/// Only suitable behind a proxy that has already authenticated the user.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryIdentityResolver;

impl IdentityResolver for QueryIdentityResolver {
    fn resolve(&self, request: &Request) -> Result<Identity, AdmissionError> {
        let query = request.uri().query().unwrap_or_default();
        Ok(Identity {
            room_id: parse_id(query, "room_id")?,
            user_id: parse_id(query, "user_id")?,
        })
    }
}

fn parse_id(query: &str, name: &'static str) -> Result<i64, AdmissionError> {
    let raw = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
        .ok_or(AdmissionError::Missing(name))?;
    raw.parse().map_err(|_| AdmissionError::Invalid {
        name,
        value: raw.to_string(),
    })
}

/// Server statistics. `rejected_connections` counts identity refusals
/// only; handshakes that fail for other reasons are not counted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
}

/// The collaboration server.
pub struct HubServer {
    config: ServerConfig,
    router: MessageRouter,
    resolver: Arc<dyn IdentityResolver>,
    stats: Arc<AtomicServerStats>,
}

impl HubServer {
    /// Create a server admitting identities from the query string.
    ///
    /// Spawns the hub, so it must be called inside a tokio runtime.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_resolver(config, QueryIdentityResolver)
    }

    /// Create a server with a custom identity resolver.
    pub fn with_resolver(config: ServerConfig, resolver: impl IdentityResolver) -> Self {
        let hub = Hub::spawn(&config.hub);
        let router = MessageRouter::new(hub, Arc::new(VoicePresenceManager::new()));
        Self {
            config,
            router,
            resolver: Arc::new(resolver),
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        log::info!("Collaboration hub listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("Accept failed: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let router = self.router.clone();
            let resolver = self.resolver.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                Self::handle_connection(stream, addr, router, resolver, stats, config).await;
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        router: MessageRouter,
        resolver: Arc<dyn IdentityResolver>,
        stats: Arc<AtomicServerStats>,
        config: ServerConfig,
    ) {
        let mut identity = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            match resolver.resolve(request) {
                Ok(resolved) => {
                    identity = Some(resolved);
                    Ok(response)
                }
                Err(e) => {
                    log::warn!("Rejected upgrade from {addr}: {e}");
                    stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
                    let mut rejection = ErrorResponse::new(Some(e.to_string()));
                    *rejection.status_mut() = StatusCode::UNAUTHORIZED;
                    Err(rejection)
                }
            }
        };

        let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                log::debug!("WebSocket handshake with {addr} failed: {e}");
                return;
            }
        };
        let Some(identity) = identity else {
            return;
        };

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "Admitted user {} to room {} from {addr}",
            identity.user_id,
            identity.room_id
        );

        Connection::new(identity, ws).run(router, &config.connection).await;

        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.stats.rejected_connections.load(Ordering::Relaxed),
        }
    }

    /// Router shared by every admitted connection.
    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}
