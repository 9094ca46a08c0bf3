use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::router::{Frame, RoomRouter};
use super::SessionId;
use crate::config::RelayConfig;
use crate::error::Result;

type SharedRouter = Arc<Mutex<RoomRouter>>;

/// WebSocket front end of the relay.
///
/// Each accepted connection gets a writer task fed through a bounded channel
/// and a reader loop that hands text frames to the shared [`RoomRouter`].
/// The router lock is never held across an await.
pub struct RelayServer {
    listener: TcpListener,
    router: SharedRouter,
    outbound_buffer: usize,
}

impl RelayServer {
    pub async fn bind(config: &RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind_address).await?;
        Ok(Self {
            listener,
            router: Arc::new(Mutex::new(RoomRouter::new())),
            outbound_buffer: config.outbound_buffer,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!(target: "echo_room.relay", addr = ?self.listener.local_addr().ok(), "Relay listening");

        let mut next_session_id: SessionId = 1;
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!(target: "echo_room.relay", "Relay shutting down");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(target: "echo_room.relay", error = %e, "Accept failed, continuing");
                            continue;
                        }
                    };
                    let session_id = next_session_id;
                    next_session_id += 1;

                    tokio::spawn(handle_connection(
                        stream,
                        peer_addr,
                        session_id,
                        self.router.clone(),
                        self.outbound_buffer,
                        shutdown.child_token(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Runs `f` under the router lock, recovering it if poisoned.
fn with_router<T>(router: &SharedRouter, f: impl FnOnce(&mut RoomRouter) -> T) -> T {
    match router.lock() {
        Ok(mut guard) => f(&mut guard),
        Err(poisoned) => f(&mut poisoned.into_inner()),
    }
}

#[instrument(skip_all, name = "echo_room.relay.session", fields(session_id = session_id, peer = %peer_addr))]
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    session_id: SessionId,
    router: SharedRouter,
    outbound_buffer: usize,
    cancel_token: CancellationToken,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(target: "echo_room.relay", error = %e, "WebSocket handshake failed");
            return;
        }
    };
    let (mut write, mut read) = ws_stream.split();
    info!(target: "echo_room.relay", session_id, "Session connected");

    let (tx, mut rx) = mpsc::channel::<Frame>(outbound_buffer);
    with_router(&router, |r| r.register(session_id, tx));

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write.send(Message::Text(frame.to_string())).await.is_err() {
                break;
            }
        }
        let _ = write.close().await;
    });

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    with_router(&router, |r| r.handle_text(session_id, &text));
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(target: "echo_room.relay", session_id, error = %e, "Read failed");
                    break;
                }
            },
        }
    }

    // Dropping the router's sender lets the writer drain and exit.
    with_router(&router, |r| r.handle_close(session_id));
    let _ = writer.await;
    info!(target: "echo_room.relay", session_id, "Session disconnected");
}
