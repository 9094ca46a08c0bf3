//! Seam between the mesh and a concrete peer-connection implementation.
//!
//! A [`PeerBackend`] opens one [`PeerLink`] per remote peer. Links report
//! asynchronous facts (local ICE candidates, connection state, inbound
//! tracks) as [`LinkEvent`]s on a channel handed to them at creation, instead
//! of through registered callbacks.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::track::track_remote::TrackRemote;

use super::{Liveness, MeshError};
use crate::signaling::{IceCandidate, SessionDescription};

/// Connection state of one link, as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    pub fn liveness(self) -> Liveness {
        match self {
            LinkState::New | LinkState::Connecting => Liveness::Pending,
            LinkState::Connected => Liveness::Connected,
            LinkState::Disconnected | LinkState::Failed | LinkState::Closed => {
                Liveness::Disconnected
            }
        }
    }
}

/// Inbound audio from one peer.
#[derive(Clone)]
pub struct RemoteAudio {
    pub stream_id: String,
    pub track_id: String,
    track: Option<Arc<TrackRemote>>,
}

impl RemoteAudio {
    pub fn new(stream_id: impl Into<String>, track_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            track_id: track_id.into(),
            track: None,
        }
    }

    pub fn from_track(track: Arc<TrackRemote>) -> Self {
        Self {
            stream_id: track.stream_id(),
            track_id: track.id(),
            track: Some(track),
        }
    }

    /// The underlying RTP track, when the stream came from a real peer
    /// connection.
    pub fn track(&self) -> Option<&Arc<TrackRemote>> {
        self.track.as_ref()
    }
}

impl fmt::Debug for RemoteAudio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteAudio")
            .field("stream_id", &self.stream_id)
            .field("track_id", &self.track_id)
            .field("has_track", &self.track.is_some())
            .finish()
    }
}

impl PartialEq for RemoteAudio {
    fn eq(&self, other: &Self) -> bool {
        self.stream_id == other.stream_id && self.track_id == other.track_id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    LocalCandidate(IceCandidate),
    StateChanged(LinkState),
    Track(RemoteAudio),
}

/// One direct connection to a remote peer.
///
/// Calls for one link are never issued concurrently; the owning session
/// awaits each before starting the next.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, MeshError>;

    async fn create_answer(&self) -> Result<SessionDescription, MeshError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MeshError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MeshError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MeshError>;

    /// Releases the link. Must be safe to call on a link that never
    /// finished negotiating.
    async fn close(&self) -> Result<(), MeshError>;
}

/// Factory for links plus the local media they all publish.
#[async_trait]
pub trait PeerBackend: Send + Sync {
    async fn open_link(
        &self,
        peer_id: &str,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, MeshError>;

    /// Mutes or unmutes the outbound audio shared by every link, current and
    /// future. Never triggers renegotiation.
    fn set_muted(&self, muted: bool);
}
