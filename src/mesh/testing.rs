//! Scripted in-memory [`PeerBackend`] for tests.
//!
//! Links record every call. A link reports `Connected` and a remote track as
//! soon as both its local and remote descriptions are applied, which is what
//! a successful ICE exchange looks like from the mesh's side.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::link::{LinkEvent, LinkState, PeerBackend, PeerLink, RemoteAudio};
use super::MeshError;
use crate::signaling::{IceCandidate, SdpType, SessionDescription};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LinkCall {
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    AddCandidate(String),
    Close,
}

type CallLog = Arc<Mutex<HashMap<String, Vec<LinkCall>>>>;

#[derive(Clone)]
pub(crate) struct ScriptedBackend {
    local_id: String,
    calls: CallLog,
    opened: Arc<Mutex<HashMap<String, usize>>>,
    muted: Arc<AtomicBool>,
    stall_offers: bool,
    local_candidates: Vec<String>,
}

impl ScriptedBackend {
    pub(crate) fn new(local_id: &str) -> Self {
        Self {
            local_id: local_id.to_string(),
            calls: Arc::default(),
            opened: Arc::default(),
            muted: Arc::default(),
            stall_offers: false,
            local_candidates: Vec::new(),
        }
    }

    /// Offers never complete, leaving sessions mid-negotiation.
    pub(crate) fn stalling_offers(mut self) -> Self {
        self.stall_offers = true;
        self
    }

    /// Candidates every link reports once its local description is set.
    pub(crate) fn with_local_candidates(mut self, candidates: &[&str]) -> Self {
        self.local_candidates = candidates.iter().map(|c| (*c).to_string()).collect();
        self
    }

    pub(crate) fn calls(&self, peer_id: &str) -> Vec<LinkCall> {
        self.calls
            .lock()
            .map(|calls| calls.get(peer_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub(crate) fn opened(&self, peer_id: &str) -> usize {
        self.opened
            .lock()
            .map(|opened| opened.get(peer_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub(crate) fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerBackend for ScriptedBackend {
    async fn open_link(
        &self,
        peer_id: &str,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, MeshError> {
        if let Ok(mut opened) = self.opened.lock() {
            *opened.entry(peer_id.to_string()).or_default() += 1;
        }
        let _ = events.send(LinkEvent::StateChanged(LinkState::New));
        Ok(Arc::new(ScriptedLink {
            local_id: self.local_id.clone(),
            peer_id: peer_id.to_string(),
            calls: self.calls.clone(),
            events,
            stall_offers: self.stall_offers,
            local_candidates: self.local_candidates.clone(),
            local_set: AtomicBool::new(false),
            remote_set: AtomicBool::new(false),
        }))
    }

    fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }
}

struct ScriptedLink {
    local_id: String,
    peer_id: String,
    calls: CallLog,
    events: mpsc::UnboundedSender<LinkEvent>,
    stall_offers: bool,
    local_candidates: Vec<String>,
    local_set: AtomicBool,
    remote_set: AtomicBool,
}

impl ScriptedLink {
    fn record(&self, call: LinkCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.entry(self.peer_id.clone()).or_default().push(call);
        }
    }

    fn maybe_connect(&self) {
        if self.local_set.load(Ordering::SeqCst) && self.remote_set.load(Ordering::SeqCst) {
            let _ = self
                .events
                .send(LinkEvent::StateChanged(LinkState::Connected));
            let _ = self.events.send(LinkEvent::Track(RemoteAudio::new(
                format!("stream-{}", self.peer_id),
                "audio",
            )));
        }
    }
}

#[async_trait]
impl PeerLink for ScriptedLink {
    async fn create_offer(&self) -> Result<SessionDescription, MeshError> {
        self.record(LinkCall::CreateOffer);
        if self.stall_offers {
            std::future::pending::<()>().await;
        }
        Ok(SessionDescription::offer(format!(
            "offer {}->{}",
            self.local_id, self.peer_id
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MeshError> {
        self.record(LinkCall::CreateAnswer);
        Ok(SessionDescription::answer(format!(
            "answer {}->{}",
            self.local_id, self.peer_id
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MeshError> {
        self.record(LinkCall::SetLocal(desc.sdp_type));
        self.local_set.store(true, Ordering::SeqCst);
        for candidate in &self.local_candidates {
            let _ = self
                .events
                .send(LinkEvent::LocalCandidate(IceCandidate::new(candidate.clone())));
        }
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MeshError> {
        self.record(LinkCall::SetRemote(desc.sdp_type));
        self.remote_set.store(true, Ordering::SeqCst);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MeshError> {
        self.record(LinkCall::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<(), MeshError> {
        self.record(LinkCall::Close);
        Ok(())
    }
}
