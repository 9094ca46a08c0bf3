//! Signaling: the wire protocol and the WebSocket transport that carries it.

pub mod client;
pub mod protocol;

pub use client::{Outbound, SignalingClient, SignalingSender, TransportEvent};
pub use protocol::{
    ClientMessage, ErrorCode, ErrorPayload, IceCandidate, Participant, ParseError,
    ServerMessage, SessionDescription, SdpType, SignalKind, SignalPayload, MAX_ROOM_CAPACITY,
};
