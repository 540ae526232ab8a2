//! One live WebSocket link bound to a single `(room, user)` pair.
//!
//! ```text
//!                ┌──────────── read loop ────────────┐
//! socket ──────► │ decode, stamp, MessageRouter      │ ──► Hub / voice
//!                │ pong → extend deadline            │
//!                └───────────────────────────────────┘
//!                ┌──────────── write loop ───────────┐
//! socket ◄────── │ outbound queue → text frame       │ ◄── Hub fan-out
//!                │ ticker (9/10 pong_wait) → ping    │
//!                └───────────────────────────────────┘
//! ```
//!
//! Shutdown propagates through closure, not signals: when either loop
//! ends it unregisters from the hub; the hub drops the outbound sender,
//! which ends the write loop; the write loop dropping its side of the
//! `closed` oneshot ends the read loop.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::hub::{ConnectionHandle, Frame, HubHandle};
use crate::protocol::{RoomId, UserId};
use crate::router::{MessageRouter, Origin};

/// Identity resolved for a connection before it is admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub room_id: RoomId,
    pub user_id: UserId,
}

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long to wait for a pong before presuming the peer dead.
    pub pong_wait: Duration,
    /// Frames buffered for a recipient before it counts as a slow consumer.
    pub outbound_capacity: usize,
}

impl ConnectionConfig {
    /// Interval between keepalive pings: 9/10 of `pong_wait`.
    pub fn ping_period(&self) -> Duration {
        self.pong_wait * 9 / 10
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            pong_wait: Duration::from_secs(60),
            outbound_capacity: 256,
        }
    }
}

/// An admitted WebSocket connection.
pub struct Connection<S> {
    conn_id: Uuid,
    identity: Identity,
    ws: WebSocketStream<S>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(identity: Identity, ws: WebSocketStream<S>) -> Self {
        Self {
            conn_id: Uuid::new_v4(),
            identity,
            ws,
        }
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Register with the hub and drive both loops until the connection ends.
    pub async fn run(self, router: MessageRouter, config: &ConnectionConfig) {
        let origin = Origin {
            conn_id: self.conn_id,
            room_id: self.identity.room_id,
            user_id: self.identity.user_id,
        };

        let (tx, rx) = mpsc::channel(config.outbound_capacity.max(1));
        router
            .hub()
            .register(ConnectionHandle::new(origin.conn_id, origin.room_id, origin.user_id, tx))
            .await;

        let (sink, stream) = self.ws.split();
        let (closed_tx, closed_rx) = oneshot::channel::<()>();

        let writer = tokio::spawn(write_loop(
            sink,
            rx,
            origin,
            router.hub().clone(),
            config.ping_period(),
            closed_tx,
        ));
        let reader = tokio::spawn(read_loop(stream, origin, router, config.pong_wait, closed_rx));

        let (read_result, write_result) = tokio::join!(reader, writer);
        if let Err(e) = read_result {
            log::error!("Read task for connection {} failed: {e}", origin.conn_id);
        }
        if let Err(e) = write_result {
            log::error!("Write task for connection {} failed: {e}", origin.conn_id);
        }

        log::debug!(
            "Connection {} for user {} in room {} finished",
            origin.conn_id,
            origin.user_id,
            origin.room_id
        );
    }
}

async fn read_loop<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    origin: Origin,
    router: MessageRouter,
    pong_wait: Duration,
    mut closed: oneshot::Receiver<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut deadline = Instant::now() + pong_wait;

    loop {
        let next = tokio::select! {
            _ = &mut closed => {
                log::debug!("Write side of connection {} closed", origin.conn_id);
                break;
            }
            next = tokio::time::timeout_at(deadline, stream.next()) => next,
        };

        let message = match next {
            Err(_) => {
                log::info!(
                    "No pong from user {} in room {} within {pong_wait:?}",
                    origin.user_id,
                    origin.room_id
                );
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                log::warn!("Read error from user {}: {e}", origin.user_id);
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => dispatch(&router, &origin, text.as_str().as_bytes()).await,
            Message::Binary(data) => dispatch(&router, &origin, &data).await,
            Message::Pong(_) => deadline = Instant::now() + pong_wait,
            Message::Close(_) => {
                log::info!("User {} closed connection to room {}", origin.user_id, origin.room_id);
                break;
            }
            // Pings are answered by the WebSocket layer.
            Message::Ping(_) | Message::Frame(_) => {}
        }
    }

    router.disconnect(&origin).await;
    router
        .hub()
        .unregister(origin.room_id, origin.user_id, origin.conn_id)
        .await;
}

async fn dispatch(router: &MessageRouter, origin: &Origin, raw: &[u8]) {
    match router.route_frame(origin, raw).await {
        Ok(route) => log::trace!("Frame from user {} routed: {route:?}", origin.user_id),
        Err(e) => log::warn!("Dropped frame from user {} in room {}: {e}", origin.user_id, origin.room_id),
    }
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound: mpsc::Receiver<Frame>,
    origin: Origin,
    hub: HubHandle,
    ping_period: Duration,
    _closed: oneshot::Sender<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ping_period = ping_period.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + ping_period, ping_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    // Queue closed by the hub.
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    log::warn!("Write error to user {}: {e}", origin.user_id);
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = sink.send(Message::Ping(Default::default())).await {
                    log::warn!("Ping to user {} failed: {e}", origin.user_id);
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
    hub.unregister(origin.room_id, origin.user_id, origin.conn_id)
        .await;
}
