//! Room client driver.
//!
//! [`RoomClient`] is the single place where relay messages, mesh events and
//! local commands meet. It consumes them one at a time, so membership changes
//! and signaling for the same peer are always applied in arrival order.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::config::ClientConfig;
use crate::connection::{ConnectionStatus, RoomMonitor};
use crate::error::Result;
use crate::mesh::{Liveness, MeshCoordinator, MeshEvent, PeerBackend, RemoteAudio};
use crate::room::RoomState;
use crate::signaling::protocol::{JoinRoomPayload, LeaveRoomPayload, MuteStatePayload};
use crate::signaling::{
    ClientMessage, ErrorCode, ServerMessage, SignalKind, SignalPayload, SignalingClient,
    SignalingSender, TransportEvent,
};

/// Local requests from the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomCommand {
    SetMuted(bool),
    ToggleMute,
    Leave,
}

/// Why [`RoomClient::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The user left; do not reconnect.
    Left,
    /// The signaling channel dropped.
    TransportClosed { reason: Option<String> },
}

pub struct RoomClient {
    room_id: String,
    user_id: String,
    display_name: String,
    state: RoomState,
    monitor: RoomMonitor,
    mesh: MeshCoordinator,
    mesh_events: mpsc::UnboundedReceiver<MeshEvent>,
    signaling: Option<SignalingSender>,
    streams: HashMap<String, RemoteAudio>,
    muted: bool,
    last_error_code: Option<ErrorCode>,
}

impl RoomClient {
    pub fn new(
        room_id: impl Into<String>,
        user_id: impl Into<String>,
        display_name: impl Into<String>,
        backend: Arc<dyn PeerBackend>,
    ) -> Self {
        let (mesh, mesh_events) = MeshCoordinator::new(backend);
        Self {
            room_id: room_id.into(),
            user_id: user_id.into(),
            display_name: display_name.into(),
            state: RoomState::new(),
            monitor: RoomMonitor::new(),
            mesh,
            mesh_events,
            signaling: None,
            streams: HashMap::new(),
            muted: false,
            last_error_code: None,
        }
    }

    pub fn from_config(config: &ClientConfig, backend: Arc<dyn PeerBackend>) -> Self {
        Self::new(
            config.room_id.clone(),
            config.user_id.clone(),
            config.display_name.clone(),
            backend,
        )
    }

    pub fn state(&self) -> &RoomState {
        &self.state
    }

    /// Observer handle; every state change is published to it.
    pub fn monitor(&self) -> RoomMonitor {
        self.monitor.clone()
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Inbound audio currently attached for `user_id`.
    pub fn remote_stream(&self, user_id: &str) -> Option<&RemoteAudio> {
        self.streams.get(user_id)
    }

    pub fn mesh(&self) -> &MeshCoordinator {
        &self.mesh
    }

    /// Whether the relay refused us in a way that retrying cannot fix.
    pub fn rejected_permanently(&self) -> bool {
        self.last_error_code.is_some_and(|code| !code.is_retryable())
    }

    /// Connects to `url` and runs until the user leaves or the channel drops.
    pub async fn connect_and_run(
        &mut self,
        url: &str,
        commands: &mut mpsc::Receiver<RoomCommand>,
    ) -> Result<SessionEnd> {
        self.begin_connecting();
        let client = match SignalingClient::connect(url).await {
            Ok(client) => client,
            Err(e) => {
                warn!(target: "echo_room.client", url = %url, error = %e, "Unable to reach signaling server");
                self.update(|s| {
                    s.apply_connection_status(ConnectionStatus::Disconnected)
                        .apply_error(Some("Unable to reach signaling server.".to_string()))
                });
                return Err(e);
            }
        };
        let (sender, mut transport) = client.split();
        self.on_transport_open(sender).await;
        Ok(self.run(&mut transport, commands).await)
    }

    pub fn begin_connecting(&mut self) {
        self.update(|s| s.apply_connection_status(ConnectionStatus::Connecting));
    }

    /// The signaling channel is up: announce ourselves.
    pub async fn on_transport_open(&mut self, sender: SignalingSender) {
        self.signaling = Some(sender);
        self.last_error_code = None;
        self.update(|s| {
            s.apply_connection_status(ConnectionStatus::Connected)
                .apply_error(None)
        });
        info!(target: "echo_room.client", room_id = %self.room_id, user_id = %self.user_id, "Joining room");
        self.send(ClientMessage::JoinRoom(JoinRoomPayload {
            room_id: self.room_id.clone(),
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
        }))
        .await;
    }

    /// Event loop: transport messages, mesh events and local commands, one at
    /// a time.
    #[instrument(skip_all, name = "echo_room.client.run", fields(room_id = %self.room_id, user_id = %self.user_id))]
    pub async fn run(
        &mut self,
        transport: &mut mpsc::Receiver<TransportEvent>,
        commands: &mut mpsc::Receiver<RoomCommand>,
    ) -> SessionEnd {
        loop {
            tokio::select! {
                event = transport.recv() => match event {
                    Some(TransportEvent::Message(message)) => self.handle_server_message(message).await,
                    Some(TransportEvent::Closed { reason }) => {
                        self.on_transport_closed().await;
                        return SessionEnd::TransportClosed { reason };
                    }
                    None => {
                        self.on_transport_closed().await;
                        return SessionEnd::TransportClosed { reason: None };
                    }
                },

                Some(event) = self.mesh_events.recv() => self.handle_mesh_event(event).await,

                command = commands.recv() => match command {
                    Some(RoomCommand::SetMuted(muted)) => self.set_muted(muted).await,
                    Some(RoomCommand::ToggleMute) => self.set_muted(!self.muted).await,
                    Some(RoomCommand::Leave) | None => {
                        self.leave().await;
                        return SessionEnd::Left;
                    }
                },
            }
        }
    }

    pub async fn handle_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::RoomSnapshot(payload) => {
                info!(
                    target: "echo_room.client",
                    room_id = %payload.room_id,
                    participants = payload.participants.len(),
                    "Received room snapshot"
                );
                // A snapshot is a full reset; sessions from before it are stale.
                self.mesh.dispose().await;
                self.streams.clear();

                let self_user_id = payload.self_user_id.clone();
                let muted = self.muted;
                self.update(|s| {
                    s.apply_snapshot(payload.room_id, payload.self_user_id, &payload.participants)
                        .apply_mute_changed(&self_user_id, muted)
                });

                let remotes: Vec<String> =
                    self.state.remote_user_ids().map(str::to_string).collect();
                for peer_id in &remotes {
                    self.mesh.add_peer(peer_id, false);
                }
                if muted {
                    self.send(ClientMessage::MuteState(MuteStatePayload { muted }))
                        .await;
                }
            }

            ServerMessage::UserJoined(payload) => {
                let user = payload.user;
                if user.user_id == self.state.self_user_id {
                    debug!(target: "echo_room.client", "Ignoring own join notification");
                    return;
                }
                info!(target: "echo_room.client", user_id = %user.user_id, display_name = %user.display_name, "Participant joined");
                self.update(|s| s.apply_joined(&user));
                if self.state.contains(&user.user_id) {
                    // The side that already sat in the room offers.
                    self.mesh.add_peer(&user.user_id, true);
                }
            }

            ServerMessage::UserLeft(payload) => {
                if payload.user_id == self.state.self_user_id {
                    return;
                }
                info!(target: "echo_room.client", user_id = %payload.user_id, "Participant left");
                self.update(|s| s.apply_left(&payload.user_id));
                self.mesh.remove_peer(&payload.user_id);
                self.streams.remove(&payload.user_id);
            }

            ServerMessage::SignalOffer(payload) => self.route_signal(SignalKind::Offer, payload),
            ServerMessage::SignalAnswer(payload) => self.route_signal(SignalKind::Answer, payload),
            ServerMessage::SignalIce(payload) => {
                self.route_signal(SignalKind::IceCandidate, payload)
            }

            ServerMessage::UserMuted(payload) => {
                self.update(|s| s.apply_mute_changed(&payload.user_id, payload.muted));
            }

            ServerMessage::Error(payload) => {
                let code = payload.error_code();
                if code.is_some_and(|code| !code.is_room_level()) {
                    // Routine when a signal crosses a departure on the wire.
                    warn!(target: "echo_room.client", code = %payload.code, message = %payload.message, "Relay rejected a request");
                    return;
                }
                warn!(target: "echo_room.client", code = %payload.code, message = %payload.message, "Relay reported an error");
                self.last_error_code = code;
                self.update(|s| s.apply_error(Some(payload.message)));
            }
        }
    }

    fn route_signal(&mut self, kind: SignalKind, payload: SignalPayload) {
        let Some(from) = payload.from_user_id.clone() else {
            debug!(target: "echo_room.client", kind = %kind, "Dropping signal without sender");
            return;
        };
        if from == self.state.self_user_id || !self.state.contains(&from) {
            debug!(target: "echo_room.client", from = %from, kind = %kind, "Dropping signal from non-member");
            return;
        }
        self.mesh.handle_signal(&from, kind, &payload);
    }

    pub async fn handle_mesh_event(&mut self, event: MeshEvent) {
        let stale = !self.mesh.is_current(event.peer_id(), event.session());
        if stale && !matches!(event, MeshEvent::ProtocolViolation { .. }) {
            debug!(
                target: "echo_room.client",
                peer_id = %event.peer_id(),
                session = event.session(),
                "Dropping event from a replaced peer session"
            );
            return;
        }

        match event {
            MeshEvent::Signal { kind, payload, .. } => {
                self.send(ClientMessage::signal(kind, payload)).await;
            }
            MeshEvent::Liveness { peer_id, liveness, .. } => {
                let connected = liveness == Liveness::Connected;
                self.update(|s| s.apply_peer_liveness(&peer_id, connected));
            }
            MeshEvent::RemoteStream { peer_id, stream, .. } => {
                if !self.state.contains(&peer_id) {
                    return;
                }
                info!(target: "echo_room.client", peer_id = %peer_id, stream = ?stream, "Receiving audio");
                self.streams.insert(peer_id.clone(), stream);
                self.update(|s| s.apply_remote_stream(&peer_id, true));
            }
            MeshEvent::ProtocolViolation { peer_id, error, .. } => {
                // A failed session reports its own liveness drop.
                warn!(target: "echo_room.client", peer_id = %peer_id, error = %error, "Peer negotiation failed");
            }
        }
    }

    /// Mutes or unmutes outbound audio without renegotiating any peer.
    pub async fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        self.mesh.set_muted(muted);
        let self_user_id = self.state.self_user_id.clone();
        self.update(|s| s.apply_mute_changed(&self_user_id, muted));
        if !self_user_id.is_empty() {
            self.send(ClientMessage::MuteState(MuteStatePayload { muted }))
                .await;
        }
    }

    /// Leaves the room: announce, tear down every peer link, then close the
    /// signaling channel.
    pub async fn leave(&mut self) {
        info!(target: "echo_room.client", room_id = %self.room_id, "Leaving room");
        if let Some(sender) = self.signaling.take() {
            let _ = sender
                .send(ClientMessage::LeaveRoom(LeaveRoomPayload {
                    room_id: self.room_id.clone(),
                }))
                .await;
            self.mesh.dispose().await;
            let _ = sender.close().await;
        } else {
            self.mesh.dispose().await;
        }
        self.mark_disconnected();
    }

    /// The signaling channel dropped: every peer link goes with it.
    pub async fn on_transport_closed(&mut self) {
        info!(target: "echo_room.client", "Signaling channel closed");
        self.signaling = None;
        self.mesh.dispose().await;
        self.mark_disconnected();
    }

    fn mark_disconnected(&mut self) {
        self.streams.clear();
        let remotes: Vec<String> = self.state.remote_user_ids().map(str::to_string).collect();
        self.update(|mut s| {
            s = s.apply_connection_status(ConnectionStatus::Disconnected);
            for peer_id in &remotes {
                s = s
                    .apply_peer_liveness(peer_id, false)
                    .apply_remote_stream(peer_id, false);
            }
            s
        });
    }

    fn update(&mut self, f: impl FnOnce(RoomState) -> RoomState) {
        self.state = f(std::mem::take(&mut self.state));
        self.monitor.publish(&self.state);
    }

    async fn send(&self, message: ClientMessage) {
        let Some(sender) = &self.signaling else {
            debug!(target: "echo_room.client", kind = message.message_type(), "Not connected, dropping message");
            return;
        };
        if let Err(e) = sender.send(message).await {
            debug!(target: "echo_room.client", error = %e, "Signaling send failed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::mesh::testing::ScriptedBackend;
    use crate::relay::RoomRouter;
    use crate::room::PeerStatus;
    use crate::signaling::protocol::RoomSnapshotPayload;
    use crate::signaling::{Outbound, Participant};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::watch;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    /// In-process relay: clients talk to a real [`RoomRouter`] through
    /// channels instead of sockets.
    #[derive(Clone, Default)]
    struct LocalRelay {
        router: Arc<Mutex<RoomRouter>>,
        next_session: Arc<Mutex<u64>>,
    }

    struct Member {
        commands: mpsc::Sender<RoomCommand>,
        states: watch::Receiver<RoomState>,
        backend: ScriptedBackend,
        task: JoinHandle<(RoomClient, SessionEnd)>,
    }

    impl LocalRelay {
        fn connect(&self, room: &str, user: &str) -> Member {
            let session_id = {
                let mut next = self.next_session.lock().unwrap();
                *next += 1;
                *next
            };

            let (sender, mut outbound) = SignalingSender::channel(64);
            let (frame_tx, mut frame_rx) = mpsc::channel::<crate::relay::router::Frame>(64);
            let (transport_tx, mut transport_rx) = mpsc::channel(64);
            self.router.lock().unwrap().register(session_id, frame_tx);

            let router = self.router.clone();
            let closer = transport_tx.clone();
            tokio::spawn(async move {
                while let Some(out) = outbound.recv().await {
                    match out {
                        Outbound::Message(msg) => {
                            let text = msg.to_json().unwrap();
                            router.lock().unwrap().handle_text(session_id, &text);
                        }
                        Outbound::Close => break,
                    }
                }
                router.lock().unwrap().handle_close(session_id);
                let _ = closer.send(TransportEvent::Closed { reason: None }).await;
            });
            tokio::spawn(async move {
                while let Some(frame) = frame_rx.recv().await {
                    let msg = ServerMessage::parse(&frame).unwrap();
                    if transport_tx.send(TransportEvent::Message(msg)).await.is_err() {
                        break;
                    }
                }
            });

            let backend = ScriptedBackend::new(user);
            let mut client = RoomClient::new(room, user, user.to_uppercase(), Arc::new(backend.clone()));
            let states = client.monitor().subscribe();
            let (commands, mut command_rx) = mpsc::channel(8);

            let task = tokio::spawn(async move {
                client.begin_connecting();
                client.on_transport_open(sender).await;
                let end = client.run(&mut transport_rx, &mut command_rx).await;
                (client, end)
            });

            Member {
                commands,
                states,
                backend,
                task,
            }
        }
    }

    async fn wait_for(
        states: &mut watch::Receiver<RoomState>,
        what: &str,
        pred: impl Fn(&RoomState) -> bool,
    ) -> RoomState {
        let result = timeout(Duration::from_secs(2), async {
            loop {
                {
                    let state = states.borrow_and_update();
                    if pred(&state) {
                        return state.clone();
                    }
                }
                if states.changed().await.is_err() {
                    panic!("state channel closed while waiting for {what}");
                }
            }
        })
        .await;
        match result {
            Ok(state) => state,
            Err(_) => panic!("timed out waiting for {what}: {:?}", states.borrow()),
        }
    }

    fn connected_to(state: &RoomState, peer: &str) -> bool {
        state.participant(peer).is_some_and(|p| p.connected)
    }

    #[tokio::test]
    async fn test_two_clients_form_a_link() {
        let relay = LocalRelay::default();
        let mut a = relay.connect("r1", "a");
        wait_for(&mut a.states, "a snapshot", |s| s.contains("a")).await;

        let mut b = relay.connect("r1", "b");

        let state_b = wait_for(&mut b.states, "b connected to a", |s| connected_to(s, "a")).await;
        let state_a = wait_for(&mut a.states, "a connected to b", |s| connected_to(s, "b")).await;

        assert_eq!(state_a.participant_count(), 2);
        assert_eq!(state_b.participant_count(), 2);
        assert_eq!(state_b.self_user_id, "b");

        // A learned of B live, so A offered and B answered.
        use crate::mesh::testing::LinkCall;
        assert!(a.backend.calls("b").contains(&LinkCall::CreateOffer));
        assert!(b.backend.calls("a").contains(&LinkCall::CreateAnswer));
        assert!(!b.backend.calls("a").contains(&LinkCall::CreateOffer));

        let view = state_b.view();
        assert_eq!(view[0].status, PeerStatus::You);
        assert_eq!(view[1].status, PeerStatus::Connected);
    }

    #[tokio::test]
    async fn test_mute_propagates_to_peer_view() {
        let relay = LocalRelay::default();
        let mut a = relay.connect("r1", "a");
        wait_for(&mut a.states, "a snapshot", |s| s.contains("a")).await;
        let mut b = relay.connect("r1", "b");
        wait_for(&mut a.states, "a sees b", |s| s.contains("b")).await;
        wait_for(&mut b.states, "b sees a", |s| s.contains("a")).await;

        a.commands.send(RoomCommand::SetMuted(true)).await.unwrap();

        wait_for(&mut b.states, "b sees a muted", |s| {
            s.participant("a").is_some_and(|p| p.muted)
        })
        .await;
        let state_a = wait_for(&mut a.states, "a sees itself muted", |s| {
            s.participant("a").is_some_and(|p| p.muted)
        })
        .await;
        assert!(a.backend.is_muted());
        assert_eq!(state_a.participant_count(), 2);
    }

    #[tokio::test]
    async fn test_leave_removes_participant_everywhere() {
        let relay = LocalRelay::default();
        let mut a = relay.connect("r1", "a");
        wait_for(&mut a.states, "a snapshot", |s| s.contains("a")).await;
        let mut b = relay.connect("r1", "b");
        wait_for(&mut a.states, "a connected to b", |s| connected_to(s, "b")).await;
        wait_for(&mut b.states, "b connected to a", |s| connected_to(s, "a")).await;

        b.commands.send(RoomCommand::Leave).await.unwrap();
        let (client_b, end) = timeout(Duration::from_secs(2), b.task).await.unwrap().unwrap();

        assert_eq!(end, SessionEnd::Left);
        assert_eq!(client_b.mesh().session_count(), 0);
        assert_eq!(client_b.state().connection_status, ConnectionStatus::Disconnected);
        assert!(b.backend.calls("a").contains(&crate::mesh::testing::LinkCall::Close));

        let state_a = wait_for(&mut a.states, "a drops b", |s| !s.contains("b")).await;
        assert_eq!(state_a.participant_count(), 1);
    }

    #[tokio::test]
    async fn test_sixth_client_sees_room_full() {
        let relay = LocalRelay::default();
        let mut clients = Vec::new();
        for user in ["a", "b", "c", "d", "e"] {
            let mut client = relay.connect("r1", user);
            wait_for(&mut client.states, "snapshot", |s| s.contains(user)).await;
            clients.push(client);
        }

        let mut f = relay.connect("r1", "f");
        let state = wait_for(&mut f.states, "room full error", |s| s.error.is_some()).await;

        assert_eq!(state.participant_count(), 0);
        assert_eq!(state.error.as_deref(), Some("Room is full (max 5 participants)."));
        assert_eq!(f.backend.opened("a"), 0);
    }

    fn offline_client() -> (RoomClient, ScriptedBackend) {
        let backend = ScriptedBackend::new("me");
        let client = RoomClient::new("r1", "me", "Me", Arc::new(backend.clone()));
        (client, backend)
    }

    fn snapshot(ids: &[&str]) -> ServerMessage {
        ServerMessage::RoomSnapshot(RoomSnapshotPayload {
            room_id: "r1".to_string(),
            self_user_id: "me".to_string(),
            participants: ids.iter().map(|id| Participant::new(*id, *id)).collect(),
        })
    }

    #[tokio::test]
    async fn test_open_sends_join_and_marks_connected() {
        let (mut client, _) = offline_client();
        let (sender, mut outbound) = SignalingSender::channel(16);

        client.begin_connecting();
        assert_eq!(client.state().connection_status, ConnectionStatus::Connecting);
        client.on_transport_open(sender).await;

        assert_eq!(client.state().connection_status, ConnectionStatus::Connected);
        let Some(Outbound::Message(ClientMessage::JoinRoom(join))) = outbound.recv().await else {
            panic!("expected join_room");
        };
        assert_eq!(join.room_id, "r1");
        assert_eq!(join.user_id, "me");
        assert_eq!(join.display_name, "Me");
    }

    #[tokio::test]
    async fn test_snapshot_creates_answerer_sessions_only() {
        let (mut client, backend) = offline_client();

        client.handle_server_message(snapshot(&["me", "x", "y"])).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(client.mesh().session_count(), 2);
        assert_eq!(
            client.mesh().role("x"),
            Some(crate::mesh::NegotiationRole::Answerer)
        );
        assert!(backend.calls("x").is_empty());
        assert!(client.state().participant("me").is_some_and(|p| p.connected));
        assert!(client.state().participant("x").is_some_and(|p| !p.connected));
    }

    #[tokio::test]
    async fn test_repeated_snapshot_resets_mesh() {
        let (mut client, backend) = offline_client();

        client.handle_server_message(snapshot(&["me", "x"])).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.handle_server_message(snapshot(&["me", "x"])).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(client.mesh().session_count(), 1);
        assert_eq!(backend.opened("x"), 2);
        assert_eq!(client.state().participant_count(), 2);
    }

    #[tokio::test]
    async fn test_signal_from_non_member_is_dropped() {
        let (mut client, backend) = offline_client();
        client.handle_server_message(snapshot(&["me"])).await;

        let mut payload = SignalPayload::description(
            "me",
            crate::signaling::SessionDescription::offer("v=0"),
        );
        payload.from_user_id = Some("stranger".to_string());
        client
            .handle_server_message(ServerMessage::SignalOffer(payload))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(backend.opened("stranger"), 0);
        assert_eq!(client.mesh().session_count(), 0);
    }

    #[tokio::test]
    async fn test_user_left_tears_down_session() {
        let (mut client, backend) = offline_client();
        client.handle_server_message(snapshot(&["me", "x"])).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        client
            .handle_server_message(ServerMessage::UserLeft(
                crate::signaling::protocol::UserLeftPayload {
                    room_id: "r1".to_string(),
                    user_id: "x".to_string(),
                },
            ))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!client.state().contains("x"));
        assert!(!client.mesh().has_session("x"));
        assert!(backend
            .calls("x")
            .contains(&crate::mesh::testing::LinkCall::Close));
    }

    #[tokio::test]
    async fn test_transport_close_disconnects_all_peers() {
        let (mut client, _) = offline_client();
        let (sender, _outbound) = SignalingSender::channel(16);
        client.begin_connecting();
        client.on_transport_open(sender).await;
        client.handle_server_message(snapshot(&["me", "x"])).await;
        let session = client.mesh().generation("x").unwrap();
        client
            .handle_mesh_event(MeshEvent::Liveness {
                peer_id: "x".to_string(),
                session,
                liveness: Liveness::Connected,
            })
            .await;
        assert!(client.state().participant("x").is_some_and(|p| p.connected));

        client.on_transport_closed().await;

        assert_eq!(client.state().connection_status, ConnectionStatus::Disconnected);
        assert!(client.state().participant("x").is_some_and(|p| !p.connected));
        assert_eq!(client.mesh().session_count(), 0);
    }

    #[tokio::test]
    async fn test_room_full_is_not_retryable_and_lands_in_error_slot() {
        let (mut client, _) = offline_client();
        client
            .handle_server_message(ServerMessage::error(
                ErrorCode::RoomFull,
                "Room is full (max 5 participants).",
            ))
            .await;

        assert!(client.rejected_permanently());
        assert_eq!(
            client.state().error.as_deref(),
            Some("Room is full (max 5 participants).")
        );

        let (sender, _outbound) = SignalingSender::channel(16);
        client.on_transport_open(sender).await;
        assert!(client.state().error.is_none());
        assert!(!client.rejected_permanently());
    }

    #[tokio::test]
    async fn test_peer_level_relay_errors_leave_error_slot_alone() {
        let (mut client, _) = offline_client();
        client.handle_server_message(snapshot(&["me", "x"])).await;

        client
            .handle_server_message(ServerMessage::error(
                ErrorCode::TargetNotFound,
                "Target user is not connected.",
            ))
            .await;
        assert!(client.state().error.is_none());
        assert!(!client.rejected_permanently());

        client
            .handle_server_message(ServerMessage::error(
                ErrorCode::RoomFull,
                "Room is full (max 5 participants).",
            ))
            .await;
        client
            .handle_server_message(ServerMessage::error(
                ErrorCode::TargetRequired,
                "targetUserId is required.",
            ))
            .await;
        assert_eq!(
            client.state().error.as_deref(),
            Some("Room is full (max 5 participants).")
        );
        assert!(client.rejected_permanently());
    }

    #[tokio::test]
    async fn test_events_from_replaced_session_do_not_leak_into_rejoin() {
        let (mut client, _) = offline_client();
        let (sender, mut outbound) = SignalingSender::channel(64);
        client.on_transport_open(sender).await;
        client.handle_server_message(snapshot(&["me", "x"])).await;

        let mut offer = SignalPayload::description(
            "me",
            crate::signaling::SessionDescription::offer("v=0 x"),
        );
        offer.from_user_id = Some("x".to_string());
        client
            .handle_server_message(ServerMessage::SignalOffer(offer))
            .await;
        // The old session answers and connects; its events stay queued.
        tokio::time::sleep(Duration::from_millis(50)).await;

        client
            .handle_server_message(ServerMessage::UserLeft(
                crate::signaling::protocol::UserLeftPayload {
                    room_id: "r1".to_string(),
                    user_id: "x".to_string(),
                },
            ))
            .await;
        client
            .handle_server_message(ServerMessage::UserJoined(
                crate::signaling::protocol::UserJoinedPayload {
                    room_id: "r1".to_string(),
                    user: Participant::new("x", "x"),
                },
            ))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut drained = Vec::new();
        while let Ok(event) = client.mesh_events.try_recv() {
            drained.push(event.clone());
            client.handle_mesh_event(event).await;
        }
        assert!(drained.iter().any(|e| matches!(
            e,
            MeshEvent::Liveness { liveness: Liveness::Connected, .. }
        )));

        let x = client.state().participant("x").unwrap();
        assert!(!x.connected);
        assert!(!x.receiving_audio);
        assert!(client.remote_stream("x").is_none());
        assert_eq!(
            client.mesh().role("x"),
            Some(crate::mesh::NegotiationRole::Offerer)
        );

        let mut sent = Vec::new();
        while let Ok(Outbound::Message(msg)) = outbound.try_recv() {
            sent.push(msg);
        }
        assert!(!sent.iter().any(|m| matches!(m, ClientMessage::SignalAnswer(_))));
        assert!(sent.iter().any(|m| matches!(m, ClientMessage::SignalOffer(_))));
    }

    #[tokio::test]
    async fn test_mute_before_join_is_announced_after_snapshot() {
        let (mut client, backend) = offline_client();
        let (sender, mut outbound) = SignalingSender::channel(16);

        client.set_muted(true).await;
        assert!(backend.is_muted());

        client.on_transport_open(sender).await;
        client.handle_server_message(snapshot(&["me"])).await;

        let mut sent = Vec::new();
        while let Ok(Outbound::Message(msg)) = outbound.try_recv() {
            sent.push(msg);
        }
        assert!(matches!(sent[0], ClientMessage::JoinRoom(_)));
        assert_eq!(
            sent[1],
            ClientMessage::MuteState(MuteStatePayload { muted: true })
        );
        assert!(client.state().participant("me").is_some_and(|p| p.muted));
    }
}
