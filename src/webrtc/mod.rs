mod audio_track;
mod media;
mod peer_connection;
mod registry;
mod rtc;
mod signaling;

pub use audio_track::{CaptureTrack, HOST_STREAM_ID};
pub use media::{
    LinkConnectionState, LinkEvent, LinkEventSender, LinkEvents, MediaError, MediaEvent,
    MediaFactory, MediaSession, RemoteAudio, SdpKind, SessionDescription,
};
pub use peer_connection::{LinkError, PeerSupervisor, SignalingState, SignalingStateError};
pub use registry::LinkRegistry;
pub use rtc::{RtcMediaFactory, COMMAND_CHANNEL_LABEL};
pub use signaling::{ClientMessage, CommandMessage, IceCandidate, ProtocolError, ServerMessage};
