use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),
    #[error("Message has no type")]
    MissingType,
    #[error("Unknown message type: {0}")]
    UnknownType(String),
}

/// Network path descriptor exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Messages received from a client over the signaling socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Authenticate {
        #[serde(default)]
        display_name: String,
        session_code: String,
    },
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: IceCandidate },
    ChatMessage { text: String },
    AudioLevel { level: f32 },
    Ping,
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    /// Parse a socket frame, keeping the offending tag for unknown types
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .map(str::to_owned)
            .ok_or(ProtocolError::MissingType)?;

        match serde_json::from_value::<ClientMessage>(value) {
            Ok(ClientMessage::Unknown) => Err(ProtocolError::UnknownType(kind)),
            Ok(message) => Ok(message),
            Err(e) => Err(ProtocolError::Malformed(e.to_string())),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "iceCandidate",
            Self::ChatMessage { .. } => "chatMessage",
            Self::AudioLevel { .. } => "audioLevel",
            Self::Ping => "ping",
            Self::Unknown => "unknown",
        }
    }
}

/// Messages sent to a client over the signaling socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Welcome { client_id: String, server_time: u64 },
    #[serde(rename_all = "camelCase")]
    Authenticated { client_id: String, display_name: String },
    AuthError { message: String },
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: IceCandidate },
    #[serde(rename_all = "camelCase")]
    ChatMessage {
        display_name: String,
        text: String,
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    PeerConnected { client_id: String, display_name: String },
    #[serde(rename_all = "camelCase")]
    PeerDisconnected { client_id: String, display_name: String },
    Pong { timestamp: u64 },
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Control messages carried on the per-link command channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CommandMessage {
    Ducking { active: bool },
    HostLive { active: bool },
    PttIntercom { active: bool },
    PttLive { active: bool },
    #[serde(rename_all = "camelCase")]
    PttLiveAudioChunk {
        audio_id: String,
        chunk_index: u32,
        total_chunks: u32,
        /// Base64 encoded slice of the clip
        chunk_data: String,
        chunk_size: usize,
        total_size: usize,
    },
    RequestHostLiveState,
    RequestHostIntercomState,
    HostLiveState { active: bool },
    HostIntercomState { active: bool },
    #[serde(other)]
    Unknown,
}

impl CommandMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .map(str::to_owned)
            .ok_or(ProtocolError::MissingType)?;

        match serde_json::from_value::<CommandMessage>(value) {
            Ok(CommandMessage::Unknown) => Err(ProtocolError::UnknownType(kind)),
            Ok(message) => Ok(message),
            Err(e) => Err(ProtocolError::Malformed(e.to_string())),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
