use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::protocol::{ClientMessage, ServerMessage};
use crate::error::{Error, Result};

/// Buffer between the caller and the socket writer/reader tasks.
const CHANNEL_BUFFER: usize = 100;

/// Facts the signaling channel reports to the room client, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(ServerMessage),
    Closed { reason: Option<String> },
}

/// Frames queued for the socket writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ClientMessage),
    Close,
}

/// Cloneable sending half of the signaling channel.
#[derive(Debug, Clone)]
pub struct SignalingSender {
    tx: mpsc::Sender<Outbound>,
}

impl SignalingSender {
    /// Creates a sender whose frames land on the returned receiver instead of
    /// a socket. The relay-less room client tests drive it this way.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }

    pub async fn send(&self, msg: ClientMessage) -> Result<()> {
        self.tx
            .send(Outbound::Message(msg))
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// Asks the writer to send a close frame and stop.
    pub async fn close(&self) -> Result<()> {
        self.tx
            .send(Outbound::Close)
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// WebSocket connection to the relay.
///
/// A writer task serializes [`ClientMessage`]s and a reader task parses
/// [`ServerMessage`]s. Frames that fail the shape check are dropped here and
/// never reach the room client. The reader always finishes with exactly one
/// [`TransportEvent::Closed`].
pub struct SignalingClient {
    tx: SignalingSender,
    rx: mpsc::Receiver<TransportEvent>,
}

impl SignalingClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();
        info!(target: "echo_room.signaling", url = %url, "Signaling channel open");

        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Outbound>(CHANNEL_BUFFER);

        // Handle outgoing messages
        tokio::spawn(async move {
            while let Some(outbound) = outgoing_rx.recv().await {
                match outbound {
                    Outbound::Message(msg) => {
                        let json = match msg.to_json() {
                            Ok(json) => json,
                            Err(e) => {
                                warn!(target: "echo_room.signaling", error = %e, "Failed to serialize message");
                                continue;
                            }
                        };
                        if write.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            let _ = write.close().await;
        });

        // Handle incoming messages
        tokio::spawn(async move {
            let mut reason = None;
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match ServerMessage::parse(&text) {
                        Ok(msg) => {
                            if tx.send(TransportEvent::Message(msg)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            debug!(target: "echo_room.signaling", error = %e, "Dropping malformed frame");
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        reason = frame.map(|f| f.reason.to_string());
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        reason = Some(e.to_string());
                        break;
                    }
                }
            }
            info!(target: "echo_room.signaling", reason = ?reason, "Signaling channel closed");
            let _ = tx.send(TransportEvent::Closed { reason }).await;
        });

        Ok(Self {
            tx: SignalingSender { tx: outgoing_tx },
            rx,
        })
    }

    pub fn split(self) -> (SignalingSender, mpsc::Receiver<TransportEvent>) {
        (self.tx, self.rx)
    }
}
