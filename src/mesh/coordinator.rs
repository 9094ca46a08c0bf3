use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::link::PeerBackend;
use super::session::{NegotiationRole, PeerCommand, PeerHandle, PeerSession};
use super::{MeshError, MeshEvent, SessionGeneration};
use crate::signaling::{SignalKind, SignalPayload};

/// Owns one [`PeerSession`] per remote participant.
///
/// All methods except [`dispose`](Self::dispose) are synchronous: they only
/// spawn, cancel or enqueue. Results come back on the [`MeshEvent`] channel
/// returned by [`new`](Self::new).
pub struct MeshCoordinator {
    backend: Arc<dyn PeerBackend>,
    events: mpsc::UnboundedSender<MeshEvent>,
    sessions: HashMap<String, PeerHandle>,
    /// Peers removed since they were last added. Their late signals are
    /// dropped instead of opening a fresh answerer session.
    removed: HashSet<String>,
    retiring: Vec<JoinHandle<()>>,
    cancel_token: CancellationToken,
    muted: bool,
    last_generation: SessionGeneration,
}

impl MeshCoordinator {
    pub fn new(backend: Arc<dyn PeerBackend>) -> (Self, mpsc::UnboundedReceiver<MeshEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let coordinator = Self {
            backend,
            events,
            sessions: HashMap::new(),
            removed: HashSet::new(),
            retiring: Vec::new(),
            cancel_token: CancellationToken::new(),
            muted: false,
            last_generation: 0,
        };
        (coordinator, receiver)
    }

    /// Ensures a session exists for `peer_id`.
    ///
    /// Returns false if a live session was already present; its role is left
    /// untouched. An initiator session starts its offer right away.
    pub fn add_peer(&mut self, peer_id: &str, is_initiator: bool) -> bool {
        self.removed.remove(peer_id);
        self.reap(peer_id);

        if self.sessions.contains_key(peer_id) {
            debug!(target: "echo_room.mesh", peer_id = %peer_id, "Peer session already exists");
            return false;
        }

        let role = if is_initiator {
            NegotiationRole::Offerer
        } else {
            NegotiationRole::Answerer
        };
        let handle = self.spawn_session(peer_id, role);
        if is_initiator {
            handle.send(PeerCommand::StartOffer);
        }
        self.sessions.insert(peer_id.to_string(), handle);
        true
    }

    /// Routes an inbound signal from `from` to its session.
    ///
    /// An offer from a peer with no session opens an answerer session.
    /// Malformed or unroutable signals are reported as protocol violations;
    /// signals from removed peers are dropped.
    pub fn handle_signal(&mut self, from: &str, kind: SignalKind, payload: &SignalPayload) {
        let command = match kind {
            SignalKind::Offer => payload.sdp.clone().map(PeerCommand::RemoteOffer),
            SignalKind::Answer => payload.sdp.clone().map(PeerCommand::RemoteAnswer),
            SignalKind::IceCandidate => payload.candidate.clone().map(PeerCommand::RemoteCandidate),
        };
        let Some(command) = command else {
            self.report(
                from,
                MeshError::MissingPayload {
                    peer_id: from.to_string(),
                    kind,
                },
            );
            return;
        };

        if self.removed.contains(from) {
            debug!(target: "echo_room.mesh", peer_id = %from, kind = %kind, "Dropping signal from removed peer");
            return;
        }

        self.reap(from);

        if !self.sessions.contains_key(from) {
            if kind != SignalKind::Offer {
                self.report(
                    from,
                    MeshError::UnknownPeer {
                        peer_id: from.to_string(),
                        kind,
                    },
                );
                return;
            }
            let handle = self.spawn_session(from, NegotiationRole::Answerer);
            self.sessions.insert(from.to_string(), handle);
        }

        if let Some(handle) = self.sessions.get(from) {
            if !handle.send(command) {
                debug!(target: "echo_room.mesh", peer_id = %from, "Peer session mailbox closed");
            }
        }
    }

    /// Releases the session for `peer_id` whatever its phase.
    ///
    /// In-flight negotiation is cancelled without waiting for it. The peer is
    /// tombstoned until the next [`add_peer`](Self::add_peer); unknown ids are
    /// a no-op.
    pub fn remove_peer(&mut self, peer_id: &str) {
        if let Some(handle) = self.sessions.remove(peer_id) {
            info!(target: "echo_room.mesh", peer_id = %peer_id, "Removing peer session");
            self.removed.insert(peer_id.to_string());
            self.retiring.push(handle.shutdown());
        }
        self.retiring.retain(|task| !task.is_finished());
    }

    /// Gates the shared outbound audio for every current and future session.
    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        self.backend.set_muted(muted);
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Removes every session and waits until each one has released its link.
    /// Safe to call any number of times.
    pub async fn dispose(&mut self) {
        let peer_ids: Vec<String> = self.sessions.keys().cloned().collect();
        for peer_id in &peer_ids {
            self.remove_peer(peer_id);
        }

        let retiring = std::mem::take(&mut self.retiring);
        if !retiring.is_empty() {
            debug!(target: "echo_room.mesh", count = retiring.len(), "Awaiting peer session shutdown");
        }
        for result in futures::future::join_all(retiring).await {
            if let Err(e) = result {
                warn!(target: "echo_room.mesh", error = %e, "Peer session task ended abnormally");
            }
        }
    }

    /// Whether a live session exists for `peer_id`.
    pub fn has_session(&self, peer_id: &str) -> bool {
        self.sessions
            .get(peer_id)
            .is_some_and(|handle| !handle.is_closed())
    }

    /// Whether `generation` is the session currently registered for
    /// `peer_id`. Events from any other generation are leftovers of a removed
    /// or replaced session.
    pub fn is_current(&self, peer_id: &str, generation: SessionGeneration) -> bool {
        self.sessions
            .get(peer_id)
            .is_some_and(|handle| handle.generation() == generation)
    }

    /// Generation of the session registered for `peer_id`, live or not.
    pub fn generation(&self, peer_id: &str) -> Option<SessionGeneration> {
        self.sessions.get(peer_id).map(PeerHandle::generation)
    }

    pub fn role(&self, peer_id: &str) -> Option<NegotiationRole> {
        self.sessions
            .get(peer_id)
            .filter(|handle| !handle.is_closed())
            .map(PeerHandle::role)
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|handle| !handle.is_closed())
            .count()
    }

    fn spawn_session(&mut self, peer_id: &str, role: NegotiationRole) -> PeerHandle {
        self.last_generation += 1;
        let generation = self.last_generation;
        info!(
            target: "echo_room.mesh",
            peer_id = %peer_id,
            generation,
            role = ?role,
            "Creating peer session"
        );
        PeerSession::spawn(
            peer_id.to_string(),
            generation,
            role,
            self.backend.clone(),
            self.events.clone(),
            self.cancel_token.child_token(),
        )
    }

    /// Drops a session that ended on its own, so it counts as absent.
    fn reap(&mut self, peer_id: &str) {
        if self.sessions.get(peer_id).is_some_and(PeerHandle::is_closed) {
            if let Some(handle) = self.sessions.remove(peer_id) {
                self.retiring.push(handle.shutdown());
            }
        }
    }

    fn report(&self, peer_id: &str, error: MeshError) {
        warn!(target: "echo_room.mesh", peer_id = %peer_id, error = %error, "Signaling protocol violation");
        let session = self
            .sessions
            .get(peer_id)
            .map_or(0, PeerHandle::generation);
        let event = MeshEvent::ProtocolViolation {
            peer_id: peer_id.to_string(),
            session,
            error,
        };
        if self.events.send(event).is_err() {
            debug!(target: "echo_room.mesh", peer_id = %peer_id, "Mesh event receiver dropped");
        }
    }
}

impl Drop for MeshCoordinator {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
