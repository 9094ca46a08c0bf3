pub mod state;

pub use state::{ParticipantView, PeerStatus, RoomAction, RoomParticipant, RoomState};
