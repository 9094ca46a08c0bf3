//! Wire protocol spoken between room clients and the relay.
//!
//! Every frame is a JSON text envelope `{"type": ..., "payload": {...}}`.
//! Field names are camelCase on the wire. Payload fields that the relay
//! validates itself default to empty values so a sloppy client gets a
//! protocol error back instead of a dropped frame.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Hard cap on distinct identities per room.
pub const MAX_ROOM_CAPACITY: usize = 5;

/// Display name the relay assigns when a joiner sends a blank one.
pub const ANONYMOUS_DISPLAY_NAME: &str = "Anonymous";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub muted: bool,
}

impl Participant {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            muted: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description as exchanged in `signal_offer` / `signal_answer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

/// The three negotiation message kinds relayed between peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    /// Envelope `type` used for this kind on the wire.
    pub fn message_type(self) -> &'static str {
        match self {
            SignalKind::Offer => "signal_offer",
            SignalKind::Answer => "signal_answer",
            SignalKind::IceCandidate => "signal_ice",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::Offer => write!(f, "offer"),
            SignalKind::Answer => write!(f, "answer"),
            SignalKind::IceCandidate => write!(f, "ice-candidate"),
        }
    }
}

/// Payload shared by `signal_offer`, `signal_answer` and `signal_ice`.
///
/// `from_user_id` is only meaningful server→client; the relay overwrites
/// whatever a client puts there.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalPayload {
    #[serde(default)]
    pub target_user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
}

impl SignalPayload {
    pub fn description(target_user_id: impl Into<String>, sdp: SessionDescription) -> Self {
        Self {
            target_user_id: target_user_id.into(),
            sdp: Some(sdp),
            ..Self::default()
        }
    }

    pub fn candidate(target_user_id: impl Into<String>, candidate: IceCandidate) -> Self {
        Self {
            target_user_id: target_user_id.into(),
            candidate: Some(candidate),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomPayload {
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRoomPayload {
    #[serde(default)]
    pub room_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuteStatePayload {
    #[serde(default)]
    pub muted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshotPayload {
    pub room_id: String,
    pub self_user_id: String,
    pub participants: Vec<Participant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserJoinedPayload {
    pub room_id: String,
    pub user: Participant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLeftPayload {
    pub room_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMutedPayload {
    pub room_id: String,
    pub user_id: String,
    pub muted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// Error codes the relay puts in `error` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidJson,
    InvalidType,
    UnsupportedType,
    InvalidJoin,
    RoomFull,
    NotInRoom,
    TargetRequired,
    TargetNotFound,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidJson => "INVALID_JSON",
            ErrorCode::InvalidType => "INVALID_TYPE",
            ErrorCode::UnsupportedType => "UNSUPPORTED_TYPE",
            ErrorCode::InvalidJoin => "INVALID_JOIN",
            ErrorCode::RoomFull => "ROOM_FULL",
            ErrorCode::NotInRoom => "NOT_IN_ROOM",
            ErrorCode::TargetRequired => "TARGET_REQUIRED",
            ErrorCode::TargetNotFound => "TARGET_NOT_FOUND",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "INVALID_JSON" => ErrorCode::InvalidJson,
            "INVALID_TYPE" => ErrorCode::InvalidType,
            "UNSUPPORTED_TYPE" => ErrorCode::UnsupportedType,
            "INVALID_JOIN" => ErrorCode::InvalidJoin,
            "ROOM_FULL" => ErrorCode::RoomFull,
            "NOT_IN_ROOM" => ErrorCode::NotInRoom,
            "TARGET_REQUIRED" => ErrorCode::TargetRequired,
            "TARGET_NOT_FOUND" => ErrorCode::TargetNotFound,
            _ => return None,
        })
    }

    /// Whether the failed request could succeed if simply repeated.
    ///
    /// A full room stays full for the same room id.
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorCode::RoomFull | ErrorCode::InvalidJoin)
    }

    /// Whether the failure concerns the room as a whole rather than one
    /// request about one peer. Only these belong in the room's error slot.
    pub fn is_room_level(self) -> bool {
        matches!(self, ErrorCode::RoomFull | ErrorCode::InvalidJoin)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_str().to_string(),
            message: message.into(),
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(&self.code)
    }
}

/// Messages sent by a room client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    JoinRoom(JoinRoomPayload),
    LeaveRoom(LeaveRoomPayload),
    SignalOffer(SignalPayload),
    SignalAnswer(SignalPayload),
    SignalIce(SignalPayload),
    MuteState(MuteStatePayload),
}

/// Messages pushed by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    RoomSnapshot(RoomSnapshotPayload),
    UserJoined(UserJoinedPayload),
    UserLeft(UserLeftPayload),
    SignalOffer(SignalPayload),
    SignalAnswer(SignalPayload),
    SignalIce(SignalPayload),
    UserMuted(UserMutedPayload),
    Error(ErrorPayload),
}

const CLIENT_MESSAGE_TYPES: &[&str] = &[
    "join_room",
    "leave_room",
    "signal_offer",
    "signal_answer",
    "signal_ice",
    "mute_state",
];

const SERVER_MESSAGE_TYPES: &[&str] = &[
    "room_snapshot",
    "user_joined",
    "user_left",
    "signal_offer",
    "signal_answer",
    "signal_ice",
    "user_muted",
    "error",
];

/// Why an inbound frame could not be turned into a message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("frame is not a JSON object")]
    InvalidJson,

    #[error("message type is missing")]
    MissingType,

    #[error("unsupported message type: {0}")]
    UnsupportedType(String),

    #[error("payload is missing")]
    MissingPayload,

    #[error("invalid payload for {kind}: {reason}")]
    InvalidPayload { kind: String, reason: String },
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type", default)]
    kind: Option<Value>,
    #[serde(default)]
    payload: Option<Value>,
}

/// Splits a frame into its type string and (possibly absent) payload.
fn split_envelope(text: &str) -> Result<(String, Option<Value>), ParseError> {
    let raw: RawEnvelope = serde_json::from_str(text).map_err(|_| ParseError::InvalidJson)?;
    match raw.kind {
        Some(Value::String(kind)) if !kind.trim().is_empty() => Ok((kind, raw.payload)),
        _ => Err(ParseError::MissingType),
    }
}

fn decode<T: DeserializeOwned>(kind: String, payload: Value) -> Result<T, ParseError> {
    let mut envelope = Map::with_capacity(2);
    envelope.insert("type".to_string(), Value::String(kind.clone()));
    envelope.insert("payload".to_string(), payload);
    serde_json::from_value(Value::Object(envelope)).map_err(|e| ParseError::InvalidPayload {
        kind,
        reason: e.to_string(),
    })
}

impl ClientMessage {
    /// Lenient parse used by the relay: a missing payload is treated as `{}`
    /// so field validation can answer with a precise error code.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let (kind, payload) = split_envelope(text)?;
        if !CLIENT_MESSAGE_TYPES.contains(&kind.as_str()) {
            return Err(ParseError::UnsupportedType(kind));
        }
        let payload = match payload {
            Some(Value::Null) | None => Value::Object(Map::new()),
            Some(value) => value,
        };
        decode(kind, payload)
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom(_) => "join_room",
            ClientMessage::LeaveRoom(_) => "leave_room",
            ClientMessage::SignalOffer(_) => SignalKind::Offer.message_type(),
            ClientMessage::SignalAnswer(_) => SignalKind::Answer.message_type(),
            ClientMessage::SignalIce(_) => SignalKind::IceCandidate.message_type(),
            ClientMessage::MuteState(_) => "mute_state",
        }
    }

    /// Builds the client frame carrying a signal of `kind`.
    pub fn signal(kind: SignalKind, payload: SignalPayload) -> Self {
        match kind {
            SignalKind::Offer => ClientMessage::SignalOffer(payload),
            SignalKind::Answer => ClientMessage::SignalAnswer(payload),
            SignalKind::IceCandidate => ClientMessage::SignalIce(payload),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl ServerMessage {
    /// Strict shape check used by clients.
    ///
    /// `type` must be a recognized string, `payload` must be present and
    /// decode. The wire format is not versioned, so unknown fields are
    /// ignored.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let (kind, payload) = split_envelope(text)?;
        if !SERVER_MESSAGE_TYPES.contains(&kind.as_str()) {
            return Err(ParseError::UnsupportedType(kind));
        }
        match payload {
            Some(Value::Null) | None => Err(ParseError::MissingPayload),
            Some(payload) => decode(kind, payload),
        }
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            ServerMessage::RoomSnapshot(_) => "room_snapshot",
            ServerMessage::UserJoined(_) => "user_joined",
            ServerMessage::UserLeft(_) => "user_left",
            ServerMessage::SignalOffer(_) => SignalKind::Offer.message_type(),
            ServerMessage::SignalAnswer(_) => SignalKind::Answer.message_type(),
            ServerMessage::SignalIce(_) => SignalKind::IceCandidate.message_type(),
            ServerMessage::UserMuted(_) => "user_muted",
            ServerMessage::Error(_) => "error",
        }
    }

    pub fn signal(kind: SignalKind, payload: SignalPayload) -> Self {
        match kind {
            SignalKind::Offer => ServerMessage::SignalOffer(payload),
            SignalKind::Answer => ServerMessage::SignalAnswer(payload),
            SignalKind::IceCandidate => ServerMessage::SignalIce(payload),
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ErrorPayload::new(code, message))
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_join_room_wire_shape() {
        let msg = ClientMessage::JoinRoom(JoinRoomPayload {
            room_id: "r1".to_string(),
            user_id: "u-a".to_string(),
            display_name: "Ada".to_string(),
        });

        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "join_room");
        assert_eq!(value["payload"]["roomId"], "r1");
        assert_eq!(value["payload"]["userId"], "u-a");
        assert_eq!(value["payload"]["displayName"], "Ada");
    }

    #[test]
    fn test_signal_payload_omits_absent_fields() {
        let msg = ClientMessage::signal(
            SignalKind::Offer,
            SignalPayload::description("u-b", SessionDescription::offer("v=0")),
        );

        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "signal_offer");
        assert_eq!(value["payload"]["targetUserId"], "u-b");
        assert_eq!(value["payload"]["sdp"]["type"], "offer");
        assert!(value["payload"].get("candidate").is_none());
        assert!(value["payload"].get("fromUserId").is_none());
    }

    #[test]
    fn test_ice_candidate_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        };
        let value = serde_json::to_value(&candidate).unwrap();
        assert_eq!(value["sdpMid"], "0");
        assert_eq!(value["sdpMLineIndex"], 0);
        assert!(value.get("usernameFragment").is_none());
    }

    #[test]
    fn test_server_parse_snapshot() {
        let text = r#"{"type":"room_snapshot","payload":{"roomId":"r1","selfUserId":"u-a",
            "participants":[{"userId":"u-a","displayName":"Ada","muted":false}]}}"#;

        let msg = ServerMessage::parse(text).unwrap();
        match msg {
            ServerMessage::RoomSnapshot(snapshot) => {
                assert_eq!(snapshot.room_id, "r1");
                assert_eq!(snapshot.self_user_id, "u-a");
                assert_eq!(snapshot.participants.len(), 1);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_server_parse_tolerates_unknown_fields() {
        let text = r#"{"type":"user_left","payload":{"roomId":"r1","userId":"u-b","reason":"x"},"v":2}"#;
        assert!(matches!(
            ServerMessage::parse(text),
            Ok(ServerMessage::UserLeft(_))
        ));
    }

    #[test]
    fn test_server_parse_rejects_bad_shapes() {
        assert_eq!(ServerMessage::parse("not json"), Err(ParseError::InvalidJson));
        assert_eq!(
            ServerMessage::parse(r#"{"payload":{}}"#),
            Err(ParseError::MissingType)
        );
        assert_eq!(
            ServerMessage::parse(r#"{"type":7,"payload":{}}"#),
            Err(ParseError::MissingType)
        );
        assert_eq!(
            ServerMessage::parse(r#"{"type":"user_left"}"#),
            Err(ParseError::MissingPayload)
        );
        assert_eq!(
            ServerMessage::parse(r#"{"type":"ai_reply","payload":{"text":"hi"}}"#),
            Err(ParseError::UnsupportedType("ai_reply".to_string()))
        );
        assert!(matches!(
            ServerMessage::parse(r#"{"type":"user_left","payload":{"roomId":1}}"#),
            Err(ParseError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_client_parse_defaults_missing_payload() {
        let msg = ClientMessage::parse(r#"{"type":"join_room"}"#).unwrap();
        assert_eq!(msg, ClientMessage::JoinRoom(JoinRoomPayload::default()));

        let msg = ClientMessage::parse(r#"{"type":"mute_state","payload":{}}"#).unwrap();
        assert_eq!(msg, ClientMessage::MuteState(MuteStatePayload { muted: false }));
    }

    #[test]
    fn test_client_parse_unsupported_type() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"room_snapshot","payload":{}}"#),
            Err(ParseError::UnsupportedType("room_snapshot".to_string()))
        );
    }

    #[test]
    fn test_error_code_mapping() {
        let payload = ErrorPayload::new(ErrorCode::RoomFull, "Room is full");
        assert_eq!(payload.code, "ROOM_FULL");
        assert_eq!(payload.error_code(), Some(ErrorCode::RoomFull));
        assert!(!ErrorCode::RoomFull.is_retryable());
        assert!(ErrorCode::TargetNotFound.is_retryable());
        assert!(ErrorCode::RoomFull.is_room_level());
        assert!(ErrorCode::InvalidJoin.is_room_level());
        assert!(!ErrorCode::TargetNotFound.is_room_level());
        assert!(!ErrorCode::NotInRoom.is_room_level());
        assert_eq!(ErrorCode::from_code("SOMETHING_NEW"), None);
    }
}
