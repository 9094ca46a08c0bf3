use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use super::directory::{Departure, RoomDirectory};
use super::{RelayError, SessionId};
use crate::signaling::protocol::{
    RoomSnapshotPayload, UserJoinedPayload, UserLeftPayload, UserMutedPayload,
};
use crate::signaling::{
    ClientMessage, ErrorCode, ParseError, ServerMessage, SignalKind, SignalPayload,
};

/// Serialized frame shared between every recipient of a broadcast.
pub type Frame = Arc<str>;

/// Routes client messages between the sessions of each room.
///
/// Every method is synchronous. Frames are handed to each session's writer
/// with `try_send`, so one slow socket never stalls the others. A session
/// whose buffer overflows has already lost a frame it cannot recover from, so
/// it is evicted: its writer is released and the room sees it leave.
pub struct RoomRouter {
    directory: RoomDirectory,
    sessions: HashMap<SessionId, mpsc::Sender<Frame>>,
    overflowed: Vec<SessionId>,
}

impl RoomRouter {
    pub fn new() -> Self {
        Self {
            directory: RoomDirectory::new(),
            sessions: HashMap::new(),
            overflowed: Vec::new(),
        }
    }

    pub fn register(&mut self, session_id: SessionId, outbound: mpsc::Sender<Frame>) {
        debug!(target: "echo_room.relay", session_id, "Session registered");
        self.sessions.insert(session_id, outbound);
    }

    /// Handles one inbound text frame from `session_id`.
    ///
    /// Frames from unregistered or evicted sessions are ignored.
    pub fn handle_text(&mut self, session_id: SessionId, text: &str) {
        if !self.sessions.contains_key(&session_id) {
            debug!(target: "echo_room.relay", session_id, "Ignoring frame from unregistered session");
            return;
        }
        self.dispatch(session_id, text);
        self.evict_overflowed();
    }

    fn dispatch(&mut self, session_id: SessionId, text: &str) {
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                let (code, message) = match e {
                    ParseError::InvalidJson => {
                        (ErrorCode::InvalidJson, "Malformed message payload.".to_string())
                    }
                    ParseError::MissingType => {
                        (ErrorCode::InvalidType, "Message type is required.".to_string())
                    }
                    ParseError::UnsupportedType(kind) => (
                        ErrorCode::UnsupportedType,
                        format!("Unsupported message type: {kind}"),
                    ),
                    other => (ErrorCode::InvalidJson, other.to_string()),
                };
                debug!(target: "echo_room.relay", session_id, code = %code, "Rejected frame");
                self.send(session_id, &ServerMessage::error(code, message));
                return;
            }
        };

        let result = match message {
            ClientMessage::JoinRoom(payload) => self.handle_join(
                session_id,
                &payload.room_id,
                &payload.user_id,
                &payload.display_name,
            ),
            ClientMessage::LeaveRoom(_) => {
                self.leave_and_broadcast(session_id);
                Ok(())
            }
            ClientMessage::SignalOffer(payload) => {
                self.handle_signal(session_id, SignalKind::Offer, payload)
            }
            ClientMessage::SignalAnswer(payload) => {
                self.handle_signal(session_id, SignalKind::Answer, payload)
            }
            ClientMessage::SignalIce(payload) => {
                self.handle_signal(session_id, SignalKind::IceCandidate, payload)
            }
            ClientMessage::MuteState(payload) => self.handle_mute(session_id, payload.muted),
        };

        if let Err(e) = result {
            debug!(target: "echo_room.relay", session_id, error = %e, "Request rejected");
            self.send(session_id, &ServerMessage::error(e.code(), e.to_string()));
        }
    }

    /// Connection closed: vacate its seat and forget it.
    pub fn handle_close(&mut self, session_id: SessionId) {
        self.leave_and_broadcast(session_id);
        self.sessions.remove(&session_id);
        self.evict_overflowed();
        debug!(target: "echo_room.relay", session_id, "Session closed");
    }

    pub fn directory(&self) -> &RoomDirectory {
        &self.directory
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn handle_join(
        &mut self,
        session_id: SessionId,
        room_id: &str,
        user_id: &str,
        display_name: &str,
    ) -> Result<(), RelayError> {
        let joined = self
            .directory
            .join(room_id, session_id, user_id, display_name)?;

        for departure in &joined.departures {
            self.announce_departure(departure, session_id);
        }

        info!(
            target: "echo_room.relay",
            session_id,
            room_id = %joined.member.room_id,
            user_id = %joined.member.participant.user_id,
            participants = joined.snapshot.participants.len(),
            "Participant joined"
        );

        let room_id = joined.member.room_id.clone();
        self.send(
            session_id,
            &ServerMessage::RoomSnapshot(RoomSnapshotPayload {
                room_id: room_id.clone(),
                self_user_id: joined.member.participant.user_id.clone(),
                participants: joined.snapshot.participants,
            }),
        );
        self.broadcast_except(
            &room_id,
            session_id,
            &ServerMessage::UserJoined(UserJoinedPayload {
                room_id: room_id.clone(),
                user: joined.member.participant,
            }),
        );
        Ok(())
    }

    fn handle_signal(
        &mut self,
        session_id: SessionId,
        kind: SignalKind,
        payload: SignalPayload,
    ) -> Result<(), RelayError> {
        let sender = self
            .directory
            .find_by_session(session_id)
            .cloned()
            .ok_or(RelayError::NotInRoom {
                action: "signaling",
            })?;

        let target_user_id = payload.target_user_id.trim();
        if target_user_id.is_empty() {
            return Err(RelayError::TargetRequired);
        }

        let target = self
            .directory
            .find_by_user(&sender.room_id, target_user_id)
            .map(|m| m.session_id)
            .filter(|id| self.sessions.contains_key(id))
            .ok_or(RelayError::TargetNotFound)?;

        let forwarded = SignalPayload {
            target_user_id: target_user_id.to_string(),
            from_user_id: Some(sender.participant.user_id.clone()),
            sdp: payload.sdp,
            candidate: payload.candidate,
        };
        debug!(
            target: "echo_room.relay",
            from = %sender.participant.user_id,
            to = %target_user_id,
            kind = %kind,
            "Relaying signal"
        );
        self.send(target, &ServerMessage::signal(kind, forwarded));
        Ok(())
    }

    fn handle_mute(&mut self, session_id: SessionId, muted: bool) -> Result<(), RelayError> {
        let member = self
            .directory
            .set_muted(session_id, muted)
            .ok_or(RelayError::NotInRoom {
                action: "updating mute state",
            })?;

        self.broadcast_except(
            &member.room_id,
            session_id,
            &ServerMessage::UserMuted(UserMutedPayload {
                room_id: member.room_id.clone(),
                user_id: member.participant.user_id,
                muted,
            }),
        );
        Ok(())
    }

    fn leave_and_broadcast(&mut self, session_id: SessionId) {
        if let Some(departure) = self.directory.leave_by_session(session_id) {
            self.announce_departure(&departure, session_id);
        }
    }

    fn announce_departure(&mut self, departure: &Departure, acting_session: SessionId) {
        info!(
            target: "echo_room.relay",
            session_id = departure.session_id,
            room_id = %departure.room_id,
            user_id = %departure.participant.user_id,
            "Participant left"
        );
        self.broadcast_except(
            &departure.room_id,
            acting_session,
            &ServerMessage::UserLeft(UserLeftPayload {
                room_id: departure.room_id.clone(),
                user_id: departure.participant.user_id.clone(),
            }),
        );
    }

    fn broadcast_except(&mut self, room_id: &str, excluded: SessionId, message: &ServerMessage) {
        let Some(frame) = encode(message) else {
            return;
        };
        for session_id in self.directory.room_sessions(room_id) {
            if session_id != excluded {
                self.deliver(session_id, frame.clone());
            }
        }
    }

    fn send(&mut self, session_id: SessionId, message: &ServerMessage) {
        if let Some(frame) = encode(message) {
            self.deliver(session_id, frame);
        }
    }

    fn deliver(&mut self, session_id: SessionId, frame: Frame) {
        let Some(outbound) = self.sessions.get(&session_id) else {
            return;
        };
        match outbound.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(target: "echo_room.relay", session_id, "Outbound buffer full, evicting session");
                if !self.overflowed.contains(&session_id) {
                    self.overflowed.push(session_id);
                }
            }
            Err(TrySendError::Closed(_)) => {
                debug!(target: "echo_room.relay", session_id, "Outbound channel closed");
            }
        }
    }
}

impl RoomRouter {
    /// Drops every session that overflowed and announces its departure.
    /// Announcing can overflow further sessions, which are evicted in turn.
    fn evict_overflowed(&mut self) {
        while let Some(session_id) = self.overflowed.pop() {
            if self.sessions.remove(&session_id).is_some() {
                info!(target: "echo_room.relay", session_id, "Evicted slow session");
                self.leave_and_broadcast(session_id);
            }
        }
    }
}

impl Default for RoomRouter {
    fn default() -> Self {
        Self::new()
    }
}

fn encode(message: &ServerMessage) -> Option<Frame> {
    match message.to_json() {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            warn!(target: "echo_room.relay", error = %e, kind = message.message_type(), "Failed to serialize frame");
            None
        }
    }
}
