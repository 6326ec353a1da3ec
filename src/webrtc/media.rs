//! Media session abstraction
//! The supervisor drives negotiation through these traits; `rtc` provides the
//! webrtc-rs implementation.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use super::audio_track::CaptureTrack;
use super::signaling::IceCandidate;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MediaError {
    #[error("Failed to create peer connection: {0}")]
    Setup(String),
    #[error("Negotiation failed: {0}")]
    Negotiation(String),
    #[error("Track error: {0}")]
    Track(String),
    #[error("Command channel error: {0}")]
    Channel(String),
    #[error("Link closed")]
    Closed,
    #[error("No outbound audio sender, renegotiation required")]
    NoSender,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Transport-level state of a link, reported upward for the UI layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Inbound contributor audio: Opus payloads as they come off the wire
pub struct RemoteAudio {
    pub track_id: String,
    pub packets: mpsc::UnboundedReceiver<Bytes>,
}

impl std::fmt::Debug for RemoteAudio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteAudio")
            .field("track_id", &self.track_id)
            .finish()
    }
}

/// Callbacks raised by a media session
#[derive(Debug)]
pub enum MediaEvent {
    LocalCandidate(IceCandidate),
    ConnectionState(LinkConnectionState),
    RemoteTrack(RemoteAudio),
    CommandChannelOpen,
    CommandChannelClosed,
    CommandMessage(String),
}

/// A media event tagged with the identity of the link that produced it
#[derive(Debug)]
pub struct LinkEvent {
    pub generation: u64,
    pub event: MediaEvent,
}

pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;

/// Where a session delivers its callbacks
#[derive(Clone)]
pub struct LinkEvents {
    generation: u64,
    tx: LinkEventSender,
}

impl LinkEvents {
    pub fn new(generation: u64, tx: LinkEventSender) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Deliver an event; a closed receiver means the client task is gone
    pub fn emit(&self, event: MediaEvent) {
        let _ = self.tx.send(LinkEvent {
            generation: self.generation,
            event,
        });
    }
}

/// One negotiated media connection to a remote client
#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError>;

    /// Create an offer and install it as the local description
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    /// Create an answer and install it as the local description
    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    /// Start sending `track` on this link
    async fn attach_track(&self, track: Arc<CaptureTrack>) -> Result<(), MediaError>;

    /// Swap the outbound track in place, without renegotiation
    async fn replace_track(&self, track: Arc<CaptureTrack>) -> Result<(), MediaError>;

    /// Id of the track the outbound sender currently references
    fn sending_track_id(&self) -> Option<String>;

    /// Open the command channel from this side (host-initiated offers)
    async fn open_command_channel(&self) -> Result<(), MediaError>;

    async fn send_command(&self, text: String) -> Result<(), MediaError>;

    async fn close(&self) -> Result<(), MediaError>;
}

/// Creates media sessions for new links
#[async_trait]
pub trait MediaFactory: Send + Sync {
    async fn create_session(
        &self,
        client_id: &str,
        events: LinkEvents,
    ) -> Result<Arc<dyn MediaSession>, MediaError>;
}
