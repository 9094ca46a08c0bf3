use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

use crate::config::ConfigError;
use crate::mesh::MeshError;

/// Crate-wide error type.
///
/// Peer-level failures stay inside [`MeshError`] and never reach the room
/// session; only transport, configuration and serialization failures are
/// room-level.
#[derive(Debug, Error)]
pub enum Error {
    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Mesh error: {0}")]
    Mesh(#[from] MeshError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The signaling channel is closed or was never opened.
    #[error("Signaling channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, Error>;
