//! webrtc-rs backed media sessions

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::audio_track::{register_audio_codec, CaptureTrack};
use super::media::{
    LinkConnectionState, LinkEvents, MediaError, MediaEvent, MediaFactory, MediaSession,
    RemoteAudio, SdpKind, SessionDescription,
};
use super::signaling::IceCandidate;

/// Label of the host/client control channel
pub const COMMAND_CHANNEL_LABEL: &str = "commands";

fn map_connection_state(state: RTCPeerConnectionState) -> LinkConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => LinkConnectionState::Connecting,
        RTCPeerConnectionState::Connected => LinkConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => LinkConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => LinkConnectionState::Failed,
        RTCPeerConnectionState::Closed => LinkConnectionState::Closed,
        _ => LinkConnectionState::New,
    }
}

/// Creates peer connections with the host's STUN servers
pub struct RtcMediaFactory {
    stun_servers: Vec<String>,
}

impl RtcMediaFactory {
    pub fn new(stun_servers: Vec<String>) -> Self {
        Self { stun_servers }
    }

    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, MediaError> {
        let mut m = MediaEngine::default();
        register_audio_codec(&mut m)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut m)
            .map_err(|e| MediaError::Setup(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.stun_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let peer_connection = api
            .new_peer_connection(config)
            .await
            .map_err(|e| MediaError::Setup(e.to_string()))?;

        Ok(Arc::new(peer_connection))
    }
}

#[async_trait]
impl MediaFactory for RtcMediaFactory {
    async fn create_session(
        &self,
        client_id: &str,
        events: LinkEvents,
    ) -> Result<Arc<dyn MediaSession>, MediaError> {
        let pc = self.create_peer_connection().await?;
        let session = Arc::new(RtcMediaSession {
            pc,
            events,
            sender: Mutex::new(None),
            sending_track: Mutex::new(None),
            command_channel: Arc::new(Mutex::new(None)),
        });
        session.install_handlers(client_id);

        tracing::debug!(
            "Peer connection for {} created (link {})",
            client_id,
            session.events.generation()
        );
        Ok(session as Arc<dyn MediaSession>)
    }
}

/// One peer connection to a remote client
pub struct RtcMediaSession {
    pc: Arc<RTCPeerConnection>,
    events: LinkEvents,
    sender: Mutex<Option<Arc<RTCRtpSender>>>,
    sending_track: Mutex<Option<String>>,
    command_channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
}

impl RtcMediaSession {
    fn install_handlers(&self, client_id: &str) {
        let events = self.events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                Box::pin(async move {
                    // None marks the end of gathering
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => events.emit(MediaEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        })),
                        Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
                    }
                })
            }));

        let events = self.events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                events.emit(MediaEvent::ConnectionState(map_connection_state(state)));
                Box::pin(async {})
            }));

        let events = self.events.clone();
        let peer = client_id.to_string();
        self.pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let events = events.clone();
            let peer = peer.clone();
            Box::pin(async move {
                if track.kind() != RTPCodecType::Audio {
                    return;
                }
                tracing::info!("Received audio track from {}", peer);

                let (tx, packets) = mpsc::unbounded_channel();
                events.emit(MediaEvent::RemoteTrack(RemoteAudio {
                    track_id: track.id(),
                    packets,
                }));

                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1500];
                    loop {
                        match track.read(&mut buf).await {
                            Ok((rtp_packet, _attributes)) => {
                                if rtp_packet.payload.is_empty() {
                                    continue;
                                }
                                if tx.send(rtp_packet.payload).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::debug!("Audio track from {} ended: {}", peer, e);
                                break;
                            }
                        }
                    }
                });
            })
        }));

        let events = self.events.clone();
        let channel = self.command_channel.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let events = events.clone();
                let channel = channel.clone();
                Box::pin(async move {
                    if dc.label() != COMMAND_CHANNEL_LABEL {
                        tracing::debug!("Ignoring data channel '{}'", dc.label());
                        return;
                    }
                    wire_command_channel(&dc, &events);
                    *channel.lock() = Some(dc);
                })
            }));
    }

    fn current_sender(&self) -> Option<Arc<RTCRtpSender>> {
        self.sender.lock().clone()
    }
}

fn wire_command_channel(dc: &Arc<RTCDataChannel>, events: &LinkEvents) {
    let on_open = events.clone();
    dc.on_open(Box::new(move || {
        on_open.emit(MediaEvent::CommandChannelOpen);
        Box::pin(async {})
    }));

    let on_close = events.clone();
    dc.on_close(Box::new(move || {
        on_close.emit(MediaEvent::CommandChannelClosed);
        Box::pin(async {})
    }));

    let on_message = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        match String::from_utf8(msg.data.to_vec()) {
            Ok(text) => on_message.emit(MediaEvent::CommandMessage(text)),
            Err(e) => tracing::warn!("Non-UTF-8 command dropped: {}", e),
        }
        Box::pin(async {})
    }));
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, MediaError> {
    let result = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    result.map_err(|e| MediaError::Negotiation(format!("Invalid SDP: {}", e)))
}

#[async_trait]
impl MediaSession for RtcMediaSession {
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| MediaError::Negotiation(format!("Failed to set remote description: {}", e)))
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        // Receive-only links still need an audio section
        if self.current_sender().is_none() {
            self.pc
                .add_transceiver_from_kind(
                    RTPCodecType::Audio,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(|e| MediaError::Track(format!("Failed to add audio transceiver: {}", e)))?;
        }

        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| MediaError::Negotiation(format!("Failed to create offer: {}", e)))?;

        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| MediaError::Negotiation(format!("Failed to set local description: {}", e)))?;

        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| MediaError::Negotiation(format!("Failed to create answer: {}", e)))?;

        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| MediaError::Negotiation(format!("Failed to set local description: {}", e)))?;

        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| MediaError::Negotiation(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn attach_track(&self, track: Arc<CaptureTrack>) -> Result<(), MediaError> {
        if self.current_sender().is_some() {
            return self.replace_track(track).await;
        }

        let rtp_track = track.rtp_track() as Arc<dyn TrackLocal + Send + Sync>;
        let sender = self
            .pc
            .add_track(rtp_track)
            .await
            .map_err(|e| MediaError::Track(format!("Failed to add audio track: {}", e)))?;

        // Drain RTCP so the interceptors keep running
        let rtcp_sender = sender.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        *self.sender.lock() = Some(sender);
        *self.sending_track.lock() = Some(track.id().to_string());
        Ok(())
    }

    async fn replace_track(&self, track: Arc<CaptureTrack>) -> Result<(), MediaError> {
        let Some(sender) = self.current_sender() else {
            return Err(MediaError::NoSender);
        };

        let rtp_track = track.rtp_track() as Arc<dyn TrackLocal + Send + Sync>;
        sender
            .replace_track(Some(rtp_track))
            .await
            .map_err(|e| MediaError::Track(format!("Failed to replace track: {}", e)))?;

        *self.sending_track.lock() = Some(track.id().to_string());
        Ok(())
    }

    fn sending_track_id(&self) -> Option<String> {
        self.sending_track.lock().clone()
    }

    async fn open_command_channel(&self) -> Result<(), MediaError> {
        if self.command_channel.lock().is_some() {
            return Ok(());
        }

        let dc = self
            .pc
            .create_data_channel(COMMAND_CHANNEL_LABEL, None)
            .await
            .map_err(|e| MediaError::Channel(format!("Failed to create data channel: {}", e)))?;

        wire_command_channel(&dc, &self.events);
        *self.command_channel.lock() = Some(dc);
        Ok(())
    }

    async fn send_command(&self, text: String) -> Result<(), MediaError> {
        let dc = self
            .command_channel
            .lock()
            .clone()
            .ok_or_else(|| MediaError::Channel("Command channel not open".to_string()))?;

        dc.send_text(text)
            .await
            .map_err(|e| MediaError::Channel(format!("Failed to send command: {}", e)))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.command_channel.lock().take();
        self.pc
            .close()
            .await
            .map_err(|e| MediaError::Setup(format!("Failed to close peer connection: {}", e)))
    }
}
