//! Client-side room state machine.
//!
//! [`RoomState`] is an immutable value: every `apply_*` reducer consumes the
//! current state and returns the next one. Reducers never fail. Events that
//! name a participant this client does not know about are ignored, because
//! membership events from the relay and liveness events from the mesh race
//! each other and a late event must not revive a departed participant.

use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

use crate::connection::ConnectionStatus;
use crate::signaling::{Participant, MAX_ROOM_CAPACITY};

/// One participant as this client sees it: relay-provided identity and mute
/// state merged with the mesh's liveness for that peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomParticipant {
    pub user_id: String,
    pub display_name: String,
    pub muted: bool,
    pub is_self: bool,
    /// Self is always connected; remote peers once their link is up.
    pub connected: bool,
    /// An inbound audio stream is attached for this peer.
    pub receiving_audio: bool,
}

impl RoomParticipant {
    fn from_wire(participant: &Participant, self_user_id: &str) -> Self {
        let is_self = participant.user_id == self_user_id;
        Self {
            user_id: participant.user_id.clone(),
            display_name: participant.display_name.clone(),
            muted: participant.muted,
            is_self,
            connected: is_self,
            receiving_audio: false,
        }
    }
}

/// Everything that can happen to a room, as a single reducible value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomAction {
    SetConnectionStatus(ConnectionStatus),
    SetError(Option<String>),
    Snapshot {
        room_id: String,
        self_user_id: String,
        participants: Vec<Participant>,
    },
    UserJoined(Participant),
    UserLeft(String),
    UserMuted { user_id: String, muted: bool },
    PeerLiveness { user_id: String, connected: bool },
    RemoteStream { user_id: String, attached: bool },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomState {
    pub connection_status: ConnectionStatus,
    pub room_id: String,
    pub self_user_id: String,
    /// Single replaceable room-level error slot.
    pub error: Option<String>,
    participants: BTreeMap<String, RoomParticipant>,
}

impl RoomState {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn reduce(self, action: RoomAction) -> Self {
        match action {
            RoomAction::SetConnectionStatus(status) => self.apply_connection_status(status),
            RoomAction::SetError(message) => self.apply_error(message),
            RoomAction::Snapshot {
                room_id,
                self_user_id,
                participants,
            } => self.apply_snapshot(room_id, self_user_id, &participants),
            RoomAction::UserJoined(participant) => self.apply_joined(&participant),
            RoomAction::UserLeft(user_id) => self.apply_left(&user_id),
            RoomAction::UserMuted { user_id, muted } => self.apply_mute_changed(&user_id, muted),
            RoomAction::PeerLiveness { user_id, connected } => {
                self.apply_peer_liveness(&user_id, connected)
            }
            RoomAction::RemoteStream { user_id, attached } => {
                self.apply_remote_stream(&user_id, attached)
            }
        }
    }

    /// Replaces membership wholesale.
    ///
    /// Self is marked connected, everyone else not yet connected. Self is
    /// admitted first so an oversized snapshot can never squeeze it out.
    #[must_use]
    pub fn apply_snapshot(
        mut self,
        room_id: impl Into<String>,
        self_user_id: impl Into<String>,
        participants: &[Participant],
    ) -> Self {
        let room_id = room_id.into();
        let self_user_id = self_user_id.into();

        let own = participants.iter().filter(|p| p.user_id == self_user_id);
        let others = participants.iter().filter(|p| p.user_id != self_user_id);

        let mut next = BTreeMap::new();
        for participant in own.chain(others) {
            if next.len() >= MAX_ROOM_CAPACITY && !next.contains_key(&participant.user_id) {
                warn!(
                    target: "echo_room.room",
                    room_id = %room_id,
                    user_id = %participant.user_id,
                    "Snapshot exceeds room capacity, ignoring participant"
                );
                continue;
            }
            next.insert(
                participant.user_id.clone(),
                RoomParticipant::from_wire(participant, &self_user_id),
            );
        }

        self.room_id = room_id;
        self.self_user_id = self_user_id;
        self.participants = next;
        self
    }

    /// Inserts or overwrites a participant. Never marks a remote peer
    /// connected; that is the mesh's job.
    #[must_use]
    pub fn apply_joined(mut self, participant: &Participant) -> Self {
        if !self.participants.contains_key(&participant.user_id)
            && self.participants.len() >= MAX_ROOM_CAPACITY
        {
            warn!(
                target: "echo_room.room",
                room_id = %self.room_id,
                user_id = %participant.user_id,
                "Room already at capacity, ignoring join"
            );
            return self;
        }
        let entry = RoomParticipant::from_wire(participant, &self.self_user_id);
        self.participants.insert(participant.user_id.clone(), entry);
        self
    }

    #[must_use]
    pub fn apply_left(mut self, user_id: &str) -> Self {
        if self.participants.remove(user_id).is_none() {
            debug!(target: "echo_room.room", user_id = %user_id, "Leave for unknown participant");
        }
        self
    }

    #[must_use]
    pub fn apply_mute_changed(mut self, user_id: &str, muted: bool) -> Self {
        if let Some(participant) = self.participants.get_mut(user_id) {
            participant.muted = muted;
        }
        self
    }

    #[must_use]
    pub fn apply_peer_liveness(mut self, user_id: &str, connected: bool) -> Self {
        match self.participants.get_mut(user_id) {
            // Self is connected to itself by definition.
            Some(participant) if !participant.is_self => participant.connected = connected,
            _ => {}
        }
        self
    }

    #[must_use]
    pub fn apply_remote_stream(mut self, user_id: &str, attached: bool) -> Self {
        match self.participants.get_mut(user_id) {
            Some(participant) if !participant.is_self => participant.receiving_audio = attached,
            _ => {}
        }
        self
    }

    /// Applies a transport status change, ignoring illegal transitions.
    #[must_use]
    pub fn apply_connection_status(mut self, status: ConnectionStatus) -> Self {
        if self.connection_status.can_transition_to(status) {
            self.connection_status = status;
        } else {
            debug!(
                target: "echo_room.room",
                from = %self.connection_status,
                to = %status,
                "Ignoring illegal connection status transition"
            );
        }
        self
    }

    #[must_use]
    pub fn apply_error(mut self, message: Option<String>) -> Self {
        self.error = message;
        self
    }

    pub fn participant(&self, user_id: &str) -> Option<&RoomParticipant> {
        self.participants.get(user_id)
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.participants.contains_key(user_id)
    }

    pub fn participants(&self) -> impl Iterator<Item = &RoomParticipant> {
        self.participants.values()
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Ids of everyone but self.
    pub fn remote_user_ids(&self) -> impl Iterator<Item = &str> {
        self.participants
            .values()
            .filter(|p| !p.is_self)
            .map(|p| p.user_id.as_str())
    }

    /// Presentation projection: self first, then remote peers by display
    /// name.
    pub fn view(&self) -> Vec<ParticipantView> {
        let mut view: Vec<ParticipantView> =
            self.participants.values().map(ParticipantView::from).collect();
        view.sort_by(|a, b| {
            b.is_self
                .cmp(&a.is_self)
                .then_with(|| a.display_name.cmp(&b.display_name))
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        view
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    You,
    Connecting,
    Connected,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerStatus::You => write!(f, "(you)"),
            PeerStatus::Connecting => write!(f, "connecting"),
            PeerStatus::Connected => write!(f, "connected"),
        }
    }
}

/// Read-only row of the room view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantView {
    pub user_id: String,
    pub display_name: String,
    pub muted: bool,
    pub is_self: bool,
    pub status: PeerStatus,
    pub receiving_audio: bool,
}

impl From<&RoomParticipant> for ParticipantView {
    fn from(participant: &RoomParticipant) -> Self {
        let status = match (participant.is_self, participant.connected) {
            (true, _) => PeerStatus::You,
            (false, true) => PeerStatus::Connected,
            (false, false) => PeerStatus::Connecting,
        };
        Self {
            user_id: participant.user_id.clone(),
            display_name: participant.display_name.clone(),
            muted: participant.muted,
            is_self: participant.is_self,
            status,
            receiving_audio: participant.receiving_audio,
        }
    }
}

impl fmt::Display for ParticipantView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.display_name,
            self.status,
            if self.muted { "muted" } else { "speaking" }
        )
    }
}
