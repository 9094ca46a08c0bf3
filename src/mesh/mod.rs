//! Mesh coordinator: one negotiation session per remote participant.
//!
//! # Architecture
//!
//! ```text
//! MeshCoordinator (owned by the room client, driven sequentially)
//! ├── HashMap<user_id, PeerHandle>
//! │   └── PeerSession task (one per remote peer)
//! │       ├── mailbox of PeerCommands (processed strictly in order)
//! │       └── PeerLink from the PeerBackend (emits LinkEvents)
//! └── MeshEvent channel back to the room client
//! ```
//!
//! Sessions for different peers negotiate in parallel. Within one session a
//! negotiation step always completes (or is cancelled) before the next
//! starts.

use std::fmt;
use thiserror::Error;

use crate::signaling::{SignalKind, SignalPayload};

pub mod coordinator;
pub mod link;
pub mod session;
pub mod webrtc;

#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::MeshCoordinator;
pub use link::{LinkEvent, LinkState, PeerBackend, PeerLink, RemoteAudio};
pub use session::{NegotiationPhase, NegotiationRole};
pub use self::webrtc::{LocalAudio, WebRtcBackend, OPUS_SILENCE_FRAME};

/// Peer-level failures. None of these ever affect other peers or the room's
/// membership view.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MeshError {
    /// A signal arrived for a peer with no session that it could create.
    #[error("{kind} from unknown peer {peer_id}")]
    UnknownPeer { peer_id: String, kind: SignalKind },

    /// An answer arrived while no offer of ours was outstanding.
    #[error("answer from {peer_id} without a pending offer")]
    UnexpectedAnswer { peer_id: String },

    /// An offer arrived while our own offer was outstanding.
    #[error("offer from {peer_id} while awaiting its answer")]
    UnexpectedOffer { peer_id: String },

    /// The signal carried no description or candidate.
    #[error("{kind} from {peer_id} is missing its payload")]
    MissingPayload { peer_id: String, kind: SignalKind },

    /// The underlying peer connection failed.
    #[error("peer link error: {0}")]
    Link(String),
}

impl From<::webrtc::Error> for MeshError {
    fn from(err: ::webrtc::Error) -> Self {
        MeshError::Link(err.to_string())
    }
}

/// Connectivity of one peer session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Liveness {
    #[default]
    Pending,
    Connected,
    Disconnected,
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Liveness::Pending => write!(f, "pending"),
            Liveness::Connected => write!(f, "connected"),
            Liveness::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Identifies one session among all sessions ever created for the same
/// peer. Generations start at 1; 0 marks events not tied to any session.
pub type SessionGeneration = u64;

/// Everything the mesh reports to its owner.
///
/// Every event names the session generation that produced it, so the owner
/// can discard events still queued from a session that has since been
/// replaced (see [`MeshCoordinator::is_current`]).
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    /// Outbound signaling message; `payload.target_user_id == peer_id`.
    Signal {
        peer_id: String,
        session: SessionGeneration,
        kind: SignalKind,
        payload: SignalPayload,
    },
    /// Inbound audio, delivered once the session is connected.
    RemoteStream {
        peer_id: String,
        session: SessionGeneration,
        stream: RemoteAudio,
    },
    /// A liveness transition. Reported once per actual change.
    Liveness {
        peer_id: String,
        session: SessionGeneration,
        liveness: Liveness,
    },
    /// A negotiation protocol violation, isolated to `peer_id`.
    ProtocolViolation {
        peer_id: String,
        session: SessionGeneration,
        error: MeshError,
    },
}

impl MeshEvent {
    pub fn peer_id(&self) -> &str {
        match self {
            MeshEvent::Signal { peer_id, .. }
            | MeshEvent::RemoteStream { peer_id, .. }
            | MeshEvent::Liveness { peer_id, .. }
            | MeshEvent::ProtocolViolation { peer_id, .. } => peer_id,
        }
    }

    pub fn session(&self) -> SessionGeneration {
        match self {
            MeshEvent::Signal { session, .. }
            | MeshEvent::RemoteStream { session, .. }
            | MeshEvent::Liveness { session, .. }
            | MeshEvent::ProtocolViolation { session, .. } => *session,
        }
    }
}
