//! Small-room peer-to-peer audio: a signaling relay and the client-side room
//! session that drives a full mesh of WebRTC links.
//!
//! ```text
//!  echo-room (client)                         echo-relay (server)
//!  ┌────────────────────────────┐  ws/json   ┌──────────────────────┐
//!  │ RoomClient ── RoomState    │◄──────────►│ RoomRouter           │
//!  │     │                      │            │   └─ RoomDirectory   │
//!  │ MeshCoordinator            │            └──────────────────────┘
//!  │     └─ PeerSession × N ── PeerLink (webrtc) ◄── media ──► peers
//!  └────────────────────────────┘
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod mesh;
pub mod relay;
pub mod room;
pub mod signaling;

pub use client::{RoomClient, RoomCommand, SessionEnd};
pub use config::{ClientConfig, RelayConfig};
pub use connection::{ConnectionStatus, RoomMonitor};
pub use error::{Error, Result};
pub use room::RoomState;
