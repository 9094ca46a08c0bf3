//! `PeerSession` - per-remote-peer negotiation actor.
//!
//! Each session:
//! - Owns exactly one [`PeerLink`] opened from the shared [`PeerBackend`]
//! - Processes its mailbox strictly in order, one negotiation step at a time
//! - Queues remote ICE candidates until a remote description is applied
//! - Reports liveness transitions and the inbound stream as [`MeshEvent`]s
//!
//! # Lifecycle
//!
//! 1. Spawned by the coordinator when a remote participant appears
//! 2. Runs until cancelled, its mailbox closes, or a protocol violation
//! 3. Closes its link on the way out, whatever phase it was in

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::link::{LinkEvent, PeerBackend, PeerLink, RemoteAudio};
use super::{Liveness, MeshError, MeshEvent, SessionGeneration};
use crate::signaling::{IceCandidate, SessionDescription, SignalKind, SignalPayload};

/// Which side of the offer/answer exchange this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Offerer,
    Answerer,
}

/// Description exchange phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NegotiationPhase {
    #[default]
    Idle,
    /// Our offer is applied locally and sent; waiting for the answer.
    HaveLocalOffer,
    /// Both descriptions are applied.
    Stable,
}

#[derive(Debug)]
pub(crate) enum PeerCommand {
    StartOffer,
    RemoteOffer(SessionDescription),
    RemoteAnswer(SessionDescription),
    RemoteCandidate(IceCandidate),
}

/// Coordinator-side handle to a running session.
#[derive(Debug)]
pub(crate) struct PeerHandle {
    sender: mpsc::UnboundedSender<PeerCommand>,
    cancel_token: CancellationToken,
    role: NegotiationRole,
    generation: SessionGeneration,
    task: JoinHandle<()>,
}

impl PeerHandle {
    pub(crate) fn role(&self) -> NegotiationRole {
        self.role
    }

    pub(crate) fn generation(&self) -> SessionGeneration {
        self.generation
    }

    /// Queues a command. Returns false if the session is already gone.
    pub(crate) fn send(&self, command: PeerCommand) -> bool {
        self.sender.send(command).is_ok()
    }

    /// A cancelled or finished session no longer counts as present.
    pub(crate) fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled() || self.task.is_finished()
    }

    /// Cancels in-flight negotiation and hands back the task to await.
    pub(crate) fn shutdown(self) -> JoinHandle<()> {
        self.cancel_token.cancel();
        self.task
    }
}

pub(crate) struct PeerSession {
    peer_id: String,
    generation: SessionGeneration,
    role: NegotiationRole,
    phase: NegotiationPhase,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    liveness: Liveness,
    stream: Option<RemoteAudio>,
    stream_delivered: bool,
    events: mpsc::UnboundedSender<MeshEvent>,
    cancel_token: CancellationToken,
}

impl PeerSession {
    pub(crate) fn spawn(
        peer_id: String,
        generation: SessionGeneration,
        role: NegotiationRole,
        backend: Arc<dyn PeerBackend>,
        events: mpsc::UnboundedSender<MeshEvent>,
        cancel_token: CancellationToken,
    ) -> PeerHandle {
        let (sender, receiver) = mpsc::unbounded_channel();

        let session = Self {
            peer_id,
            generation,
            role,
            phase: NegotiationPhase::Idle,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            liveness: Liveness::Pending,
            stream: None,
            stream_delivered: false,
            events,
            cancel_token: cancel_token.clone(),
        };

        let task = tokio::spawn(session.run(backend, receiver));

        PeerHandle {
            sender,
            cancel_token,
            role,
            generation,
            task,
        }
    }

    #[instrument(
        skip_all,
        name = "echo_room.mesh.peer",
        fields(peer_id = %self.peer_id, generation = self.generation, role = ?self.role)
    )]
    async fn run(
        mut self,
        backend: Arc<dyn PeerBackend>,
        mut commands: mpsc::UnboundedReceiver<PeerCommand>,
    ) {
        let (link_tx, mut link_rx) = mpsc::unbounded_channel();
        let cancel_token = self.cancel_token.clone();

        let link = tokio::select! {
            biased;
            () = self.cancel_token.cancelled() => return,
            opened = backend.open_link(&self.peer_id, link_tx) => match opened {
                Ok(link) => link,
                Err(e) => {
                    self.fail(e);
                    return;
                }
            },
        };

        debug!(target: "echo_room.mesh", peer_id = %self.peer_id, "PeerSession started");

        loop {
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    debug!(target: "echo_room.mesh", peer_id = %self.peer_id, "PeerSession cancelled");
                    break;
                }

                Some(event) = link_rx.recv() => self.handle_link_event(event),

                command = commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    // A removal must not wait for a stalled step to settle.
                    let outcome = tokio::select! {
                        biased;
                        () = cancel_token.cancelled() => break,
                        outcome = self.handle_command(link.as_ref(), command) => outcome,
                    };
                    if let Err(e) = outcome {
                        self.fail(e);
                        break;
                    }
                }
            }
        }

        if let Err(e) = link.close().await {
            debug!(target: "echo_room.mesh", peer_id = %self.peer_id, error = %e, "Link close failed");
        }

        info!(
            target: "echo_room.mesh",
            peer_id = %self.peer_id,
            phase = ?self.phase,
            "PeerSession stopped"
        );
    }

    async fn handle_command(
        &mut self,
        link: &dyn PeerLink,
        command: PeerCommand,
    ) -> Result<(), MeshError> {
        match command {
            PeerCommand::StartOffer => {
                if self.phase != NegotiationPhase::Idle {
                    debug!(target: "echo_room.mesh", peer_id = %self.peer_id, "Offer already made");
                    return Ok(());
                }
                let offer = link.create_offer().await?;
                link.set_local_description(offer.clone()).await?;
                self.phase = NegotiationPhase::HaveLocalOffer;
                self.emit_signal(
                    SignalKind::Offer,
                    SignalPayload::description(&self.peer_id, offer),
                );
            }

            PeerCommand::RemoteOffer(offer) => {
                if self.phase == NegotiationPhase::HaveLocalOffer {
                    return Err(MeshError::UnexpectedOffer {
                        peer_id: self.peer_id.clone(),
                    });
                }
                link.set_remote_description(offer).await?;
                self.flush_candidates(link).await;
                let answer = link.create_answer().await?;
                link.set_local_description(answer.clone()).await?;
                self.phase = NegotiationPhase::Stable;
                self.emit_signal(
                    SignalKind::Answer,
                    SignalPayload::description(&self.peer_id, answer),
                );
            }

            PeerCommand::RemoteAnswer(answer) => {
                if self.role != NegotiationRole::Offerer
                    || self.phase != NegotiationPhase::HaveLocalOffer
                {
                    return Err(MeshError::UnexpectedAnswer {
                        peer_id: self.peer_id.clone(),
                    });
                }
                link.set_remote_description(answer).await?;
                self.phase = NegotiationPhase::Stable;
                self.flush_candidates(link).await;
            }

            PeerCommand::RemoteCandidate(candidate) => {
                if self.remote_description_set {
                    self.apply_candidate(link, candidate).await;
                } else {
                    self.pending_candidates.push(candidate);
                }
            }
        }
        Ok(())
    }

    /// Marks the remote description applied and drains queued candidates in
    /// arrival order.
    async fn flush_candidates(&mut self, link: &dyn PeerLink) {
        self.remote_description_set = true;
        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            debug!(
                target: "echo_room.mesh",
                peer_id = %self.peer_id,
                count = pending.len(),
                "Flushing queued ICE candidates"
            );
        }
        for candidate in pending {
            self.apply_candidate(link, candidate).await;
        }
    }

    /// A rejected candidate only loses that one path.
    async fn apply_candidate(&self, link: &dyn PeerLink, candidate: IceCandidate) {
        if let Err(e) = link.add_ice_candidate(candidate).await {
            warn!(target: "echo_room.mesh", peer_id = %self.peer_id, error = %e, "Failed to add ICE candidate");
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::LocalCandidate(candidate) => {
                self.emit_signal(
                    SignalKind::IceCandidate,
                    SignalPayload::candidate(&self.peer_id, candidate),
                );
            }
            LinkEvent::StateChanged(state) => self.set_liveness(state.liveness()),
            LinkEvent::Track(stream) => {
                debug!(target: "echo_room.mesh", peer_id = %self.peer_id, stream = ?stream, "Remote track arrived");
                self.stream = Some(stream);
                self.stream_delivered = false;
                self.deliver_stream();
            }
        }
    }

    fn set_liveness(&mut self, next: Liveness) {
        if self.liveness == next {
            return;
        }
        info!(
            target: "echo_room.mesh",
            peer_id = %self.peer_id,
            from = %self.liveness,
            to = %next,
            "Peer liveness changed"
        );
        self.liveness = next;
        self.emit(MeshEvent::Liveness {
            peer_id: self.peer_id.clone(),
            session: self.generation,
            liveness: next,
        });
        self.deliver_stream();
    }

    fn deliver_stream(&mut self) {
        if self.liveness != Liveness::Connected || self.stream_delivered {
            return;
        }
        if let Some(stream) = self.stream.clone() {
            self.stream_delivered = true;
            self.emit(MeshEvent::RemoteStream {
                peer_id: self.peer_id.clone(),
                session: self.generation,
                stream,
            });
        }
    }

    /// Reports `error` and ends this session only.
    fn fail(&mut self, error: MeshError) {
        warn!(target: "echo_room.mesh", peer_id = %self.peer_id, error = %error, "Peer session failed");
        self.emit(MeshEvent::ProtocolViolation {
            peer_id: self.peer_id.clone(),
            session: self.generation,
            error,
        });
        self.set_liveness(Liveness::Disconnected);
        self.cancel_token.cancel();
    }

    fn emit_signal(&self, kind: SignalKind, payload: SignalPayload) {
        self.emit(MeshEvent::Signal {
            peer_id: self.peer_id.clone(),
            session: self.generation,
            kind,
            payload,
        });
    }

    fn emit(&self, event: MeshEvent) {
        if self.events.send(event).is_err() {
            debug!(target: "echo_room.mesh", peer_id = %self.peer_id, "Mesh event receiver dropped");
        }
    }
}
