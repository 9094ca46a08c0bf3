use std::collections::HashMap;

use super::{RelayError, SessionId};
use crate::signaling::protocol::{ANONYMOUS_DISPLAY_NAME, MAX_ROOM_CAPACITY};
use crate::signaling::Participant;

/// One session's seat in a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMembership {
    pub room_id: String,
    pub session_id: SessionId,
    pub participant: Participant,
}

/// Participants of one room in join order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub participants: Vec<Participant>,
}

/// A seat vacated as a side effect of a join, or by a leave.
pub type Departure = SessionMembership;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Joined {
    pub snapshot: RoomSnapshot,
    pub member: SessionMembership,
    /// Seats vacated by this join, in the order they should be announced:
    /// the session's previous seat, then an older session of the same
    /// identity that this one replaces.
    pub departures: Vec<Departure>,
}

/// Authoritative room membership.
///
/// Identities are unique per room: a second session joining with the same
/// user id takes over the seat of the first.
#[derive(Debug, Default)]
pub struct RoomDirectory {
    rooms: HashMap<String, Vec<SessionMembership>>,
    session_rooms: HashMap<SessionId, String>,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(
        &mut self,
        room_id: &str,
        session_id: SessionId,
        user_id: &str,
        display_name: &str,
    ) -> Result<Joined, RelayError> {
        let room_id = room_id.trim();
        let user_id = user_id.trim();
        if room_id.is_empty() || user_id.is_empty() {
            return Err(RelayError::InvalidJoin);
        }

        let occupied = self.rooms.get(room_id).map_or(0, |members| {
            members
                .iter()
                .filter(|m| m.session_id != session_id && m.participant.user_id != user_id)
                .count()
        });
        if occupied >= MAX_ROOM_CAPACITY {
            return Err(RelayError::RoomFull {
                capacity: MAX_ROOM_CAPACITY,
            });
        }

        let mut departures = Vec::new();
        if let Some(previous) = self.leave_by_session(session_id) {
            departures.push(previous);
        }
        if let Some(replaced) = self.find_by_user(room_id, user_id).map(|m| m.session_id) {
            if let Some(previous) = self.leave_by_session(replaced) {
                departures.push(previous);
            }
        }

        let display_name = match display_name.trim() {
            "" => ANONYMOUS_DISPLAY_NAME,
            name => name,
        };
        let member = SessionMembership {
            room_id: room_id.to_string(),
            session_id,
            participant: Participant::new(user_id, display_name),
        };

        self.rooms
            .entry(room_id.to_string())
            .or_default()
            .push(member.clone());
        self.session_rooms.insert(session_id, room_id.to_string());

        let snapshot = self.snapshot(room_id).unwrap_or_else(|| RoomSnapshot {
            room_id: room_id.to_string(),
            participants: vec![member.participant.clone()],
        });

        Ok(Joined {
            snapshot,
            member,
            departures,
        })
    }

    /// Vacates the seat held by `session_id`. Empty rooms are dropped.
    pub fn leave_by_session(&mut self, session_id: SessionId) -> Option<Departure> {
        let room_id = self.session_rooms.remove(&session_id)?;
        let members = self.rooms.get_mut(&room_id)?;
        let index = members.iter().position(|m| m.session_id == session_id)?;
        let departed = members.remove(index);
        if members.is_empty() {
            self.rooms.remove(&room_id);
        }
        Some(departed)
    }

    pub fn snapshot(&self, room_id: &str) -> Option<RoomSnapshot> {
        self.rooms.get(room_id).map(|members| RoomSnapshot {
            room_id: room_id.to_string(),
            participants: members.iter().map(|m| m.participant.clone()).collect(),
        })
    }

    pub fn find_by_session(&self, session_id: SessionId) -> Option<&SessionMembership> {
        let room_id = self.session_rooms.get(&session_id)?;
        self.rooms
            .get(room_id)?
            .iter()
            .find(|m| m.session_id == session_id)
    }

    pub fn find_by_user(&self, room_id: &str, user_id: &str) -> Option<&SessionMembership> {
        self.rooms
            .get(room_id)?
            .iter()
            .find(|m| m.participant.user_id == user_id)
    }

    /// Sessions seated in `room_id`, in join order.
    pub fn room_sessions(&self, room_id: &str) -> Vec<SessionId> {
        self.rooms
            .get(room_id)
            .map(|members| members.iter().map(|m| m.session_id).collect())
            .unwrap_or_default()
    }

    /// Records the mute flag so later snapshots carry it.
    pub fn set_muted(&mut self, session_id: SessionId, muted: bool) -> Option<SessionMembership> {
        let room_id = self.session_rooms.get(&session_id)?;
        let member = self
            .rooms
            .get_mut(room_id)?
            .iter_mut()
            .find(|m| m.session_id == session_id)?;
        member.participant.muted = muted;
        Some(member.clone())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn ids(snapshot: &RoomSnapshot) -> Vec<&str> {
        snapshot
            .participants
            .iter()
            .map(|p| p.user_id.as_str())
            .collect()
    }

    #[test]
    fn test_join_returns_snapshot_in_join_order() {
        let mut dir = RoomDirectory::new();
        dir.join("r1", 1, "a", "Alice").unwrap();
        let joined = dir.join("r1", 2, "b", "Bob").unwrap();

        assert_eq!(ids(&joined.snapshot), vec!["a", "b"]);
        assert_eq!(joined.member.participant.display_name, "Bob");
        assert!(joined.departures.is_empty());
    }

    #[test]
    fn test_blank_ids_rejected() {
        let mut dir = RoomDirectory::new();
        assert_eq!(dir.join(" ", 1, "a", "A"), Err(RelayError::InvalidJoin));
        assert_eq!(dir.join("r1", 1, "", "A"), Err(RelayError::InvalidJoin));
        assert_eq!(dir.room_count(), 0);
    }

    #[test]
    fn test_blank_display_name_becomes_anonymous() {
        let mut dir = RoomDirectory::new();
        let joined = dir.join("r1", 1, "a", "   ").unwrap();
        assert_eq!(joined.member.participant.display_name, "Anonymous");
    }

    #[test]
    fn test_sixth_identity_rejected_without_side_effects() {
        let mut dir = RoomDirectory::new();
        for (i, user) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            dir.join("r1", i as SessionId + 1, user, user).unwrap();
        }
        dir.join("r2", 6, "f", "F").unwrap();

        let err = dir.join("r1", 6, "f", "F").unwrap_err();
        assert_eq!(err, RelayError::RoomFull { capacity: 5 });
        assert_eq!(dir.snapshot("r1").unwrap().participants.len(), 5);
        // The rejected session keeps its previous seat.
        assert_eq!(dir.find_by_session(6).unwrap().room_id, "r2");
    }

    #[test]
    fn test_same_identity_replaces_old_session_even_when_full() {
        let mut dir = RoomDirectory::new();
        for (i, user) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            dir.join("r1", i as SessionId + 1, user, user).unwrap();
        }

        let joined = dir.join("r1", 10, "c", "Carol").unwrap();

        assert_eq!(joined.departures.len(), 1);
        assert_eq!(joined.departures[0].session_id, 3);
        assert_eq!(ids(&joined.snapshot), vec!["a", "b", "d", "e", "c"]);
        assert!(dir.find_by_session(3).is_none());
        assert_eq!(dir.find_by_user("r1", "c").unwrap().session_id, 10);
    }

    #[test]
    fn test_joining_another_room_leaves_the_first() {
        let mut dir = RoomDirectory::new();
        dir.join("r1", 1, "a", "A").unwrap();
        dir.join("r1", 2, "b", "B").unwrap();

        let joined = dir.join("r2", 1, "a", "A").unwrap();

        assert_eq!(joined.departures.len(), 1);
        assert_eq!(joined.departures[0].room_id, "r1");
        assert_eq!(ids(&dir.snapshot("r1").unwrap()), vec!["b"]);
        assert_eq!(ids(&dir.snapshot("r2").unwrap()), vec!["a"]);
    }

    #[test]
    fn test_leave_drops_empty_room() {
        let mut dir = RoomDirectory::new();
        dir.join("r1", 1, "a", "A").unwrap();

        let departed = dir.leave_by_session(1).unwrap();
        assert_eq!(departed.participant.user_id, "a");
        assert_eq!(dir.room_count(), 0);
        assert!(dir.snapshot("r1").is_none());
        assert!(dir.leave_by_session(1).is_none());
    }

    #[test]
    fn test_mute_recorded_in_later_snapshots() {
        let mut dir = RoomDirectory::new();
        dir.join("r1", 1, "a", "A").unwrap();

        let updated = dir.set_muted(1, true).unwrap();
        assert!(updated.participant.muted);

        let joined = dir.join("r1", 2, "b", "B").unwrap();
        assert!(joined.snapshot.participants[0].muted);
        assert!(dir.set_muted(99, true).is_none());
    }

    #[test]
    fn test_room_sessions_in_join_order() {
        let mut dir = RoomDirectory::new();
        dir.join("r1", 7, "a", "A").unwrap();
        dir.join("r1", 3, "b", "B").unwrap();
        assert_eq!(dir.room_sessions("r1"), vec![7, 3]);
        assert!(dir.room_sessions("nope").is_empty());
    }
}
