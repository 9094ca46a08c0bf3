use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::room::RoomState;

/// Status of the signaling channel as seen by the room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionStatus {
    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Status only moves forward, except that `Connected` and `Disconnected`
    /// may cycle and a caller-driven reconnect may take `Disconnected` back to
    /// `Connecting`. Staying put is always allowed.
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::{Connected, Connecting, Disconnected, Idle};

        self == next
            || matches!(
                (self, next),
                (Idle, Connecting)
                    | (Connecting, Connected)
                    | (Connecting, Disconnected)
                    | (Connected, Disconnected)
                    | (Disconnected, Connected)
                    | (Disconnected, Connecting)
            )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Idle => write!(f, "idle"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Publishes every new [`RoomState`] to observers.
///
/// Presentation layers subscribe and render whatever the latest value is;
/// intermediate states may be skipped.
#[derive(Clone)]
pub struct RoomMonitor {
    status: Arc<watch::Sender<RoomState>>,
    receiver: watch::Receiver<RoomState>,
}

impl RoomMonitor {
    pub fn new() -> Self {
        let (status, receiver) = watch::channel(RoomState::default());
        Self {
            status: Arc::new(status),
            receiver,
        }
    }

    /// Publishes `state` if it differs from the current value.
    pub fn publish(&self, state: &RoomState) {
        self.status.send_if_modified(|current| {
            if current == state {
                false
            } else {
                *current = state.clone();
                true
            }
        });
    }

    pub fn current(&self) -> RoomState {
        self.receiver.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RoomState> {
        self.receiver.clone()
    }
}

impl Default for RoomMonitor {
    fn default() -> Self {
        Self::new()
    }
}
