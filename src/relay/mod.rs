//! Signaling relay: room membership authority and message router.
//!
//! The relay never sees media. It admits up to five identities per room,
//! tells newcomers who is already there, and forwards offer/answer/ICE
//! messages between members of the same room.

use thiserror::Error;

use crate::signaling::ErrorCode;

pub mod directory;
pub mod router;
pub mod server;

pub use directory::{Departure, Joined, RoomDirectory, RoomSnapshot, SessionMembership};
pub use router::RoomRouter;
pub use server::RelayServer;

/// Relay-assigned connection identifier.
pub type SessionId = u64;

/// Request failures the relay reports back to the sending session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("Room ID and User ID are required.")]
    InvalidJoin,

    #[error("Room is full (max {capacity} participants).")]
    RoomFull { capacity: usize },

    #[error("Join a room before {action}.")]
    NotInRoom { action: &'static str },

    #[error("targetUserId is required.")]
    TargetRequired,

    #[error("Target user is not connected.")]
    TargetNotFound,
}

impl RelayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RelayError::InvalidJoin => ErrorCode::InvalidJoin,
            RelayError::RoomFull { .. } => ErrorCode::RoomFull,
            RelayError::NotInRoom { .. } => ErrorCode::NotInRoom,
            RelayError::TargetRequired => ErrorCode::TargetRequired,
            RelayError::TargetNotFound => ErrorCode::TargetNotFound,
        }
    }
}
