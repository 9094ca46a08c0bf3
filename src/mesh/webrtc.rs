use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::link::{LinkEvent, LinkState, PeerBackend, PeerLink, RemoteAudio};
use super::MeshError;
use crate::config::IceServerConfig;
use crate::signaling::{IceCandidate, SdpType, SessionDescription};

/// A single Opus frame of silence, sent in place of captured audio while
/// muted so remote jitter buffers keep their timing.
pub const OPUS_SILENCE_FRAME: [u8; 3] = [0xf8, 0xff, 0xfe];

/// The one outbound audio track shared by every peer link.
///
/// Callers feed encoded Opus samples through [`write_sample`](Self::write_sample);
/// while muted those samples are replaced with silence.
#[derive(Clone)]
pub struct LocalAudio {
    track: Arc<TrackLocalStaticSample>,
    muted: Arc<AtomicBool>,
}

impl LocalAudio {
    fn new() -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            "echo-room".to_owned(),
        ));
        Self {
            track,
            muted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub async fn write_sample(&self, sample: &Sample) -> Result<(), MeshError> {
        if self.is_muted() {
            let silence = Sample {
                data: Bytes::from_static(&OPUS_SILENCE_FRAME),
                duration: sample.duration,
                ..Default::default()
            };
            self.track.write_sample(&silence).await?;
        } else {
            self.track.write_sample(sample).await?;
        }
        Ok(())
    }
}

/// [`PeerBackend`] built on webrtc-rs peer connections.
pub struct WebRtcBackend {
    api: API,
    config: RTCConfiguration,
    local_audio: LocalAudio,
}

impl WebRtcBackend {
    pub fn new(ice_servers: &[IceServerConfig]) -> Result<Self, MeshError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let api = APIBuilder::new().with_media_engine(media_engine).build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        Ok(Self {
            api,
            config,
            local_audio: LocalAudio::new(),
        })
    }

    /// Handle for feeding captured audio into every link.
    pub fn local_audio(&self) -> LocalAudio {
        self.local_audio.clone()
    }
}

#[async_trait]
impl PeerBackend for WebRtcBackend {
    async fn open_link(
        &self,
        peer_id: &str,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, MeshError> {
        let peer_connection = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);

        peer_connection
            .add_track(Arc::clone(&self.local_audio.track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        let candidate_events = events.clone();
        let candidate_peer = peer_id.to_string();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            // `None` marks the end of gathering; nothing to relay.
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidate_events.send(LinkEvent::LocalCandidate(from_rtc_candidate(init)));
                    }
                    Err(e) => {
                        warn!(target: "echo_room.mesh", peer_id = %candidate_peer, error = %e, "Failed to serialize local ICE candidate");
                    }
                }
            }
            Box::pin(async {})
        }));

        let track_events = events.clone();
        let track_peer = peer_id.to_string();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                if track.kind() == RTPCodecType::Audio {
                    let _ = track_events.send(LinkEvent::Track(RemoteAudio::from_track(track)));
                } else {
                    debug!(target: "echo_room.mesh", peer_id = %track_peer, kind = ?track.kind(), "Ignoring non-audio track");
                }
                Box::pin(async {})
            },
        ));

        let state_peer = peer_id.to_string();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                debug!(target: "echo_room.mesh", peer_id = %state_peer, state = %s, "Peer connection state changed");
                if let Some(state) = link_state(s) {
                    let _ = events.send(LinkEvent::StateChanged(state));
                }
                Box::pin(async {})
            },
        ));

        Ok(Arc::new(WebRtcLink { peer_connection }))
    }

    fn set_muted(&self, muted: bool) {
        self.local_audio.muted.store(muted, Ordering::SeqCst);
    }
}

struct WebRtcLink {
    peer_connection: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn create_offer(&self) -> Result<SessionDescription, MeshError> {
        let offer = self.peer_connection.create_offer(None).await?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, MeshError> {
        let answer = self.peer_connection.create_answer(None).await?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MeshError> {
        self.peer_connection
            .set_local_description(to_rtc_description(desc)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MeshError> {
        self.peer_connection
            .set_remote_description(to_rtc_description(desc)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MeshError> {
        self.peer_connection
            .add_ice_candidate(to_rtc_candidate(candidate))
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), MeshError> {
        self.peer_connection.close().await?;
        Ok(())
    }
}

fn link_state(state: RTCPeerConnectionState) -> Option<LinkState> {
    Some(match state {
        RTCPeerConnectionState::New => LinkState::New,
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
        RTCPeerConnectionState::Unspecified => return None,
    })
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, MeshError> {
    let rtc = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
        SdpType::Rollback => {
            return Err(MeshError::Link("rollback descriptions are not supported".to_string()))
        }
    };
    Ok(rtc)
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, MeshError> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(MeshError::Link("description has no type".to_string()))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: desc.sdp,
    })
}

fn to_rtc_candidate(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_m_line_index,
        username_fragment: candidate.username_fragment,
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}
