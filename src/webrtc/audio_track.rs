use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::rtp::packet::Packet as RtpPacket;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;

use super::media::MediaError;
use crate::audio::CHANNELS;

/// Opus payload type (dynamic, typically 111)
pub const OPUS_PAYLOAD_TYPE: u8 = 111;

/// RTP clock rate for Opus is always 48000
pub const OPUS_CLOCK_RATE: u32 = 48000;

/// Samples per RTP packet (20ms at 48kHz = 960 samples)
pub const SAMPLES_PER_RTP_PACKET: u32 = 960;

/// Stream id shared by every link, so clients see one host stream
pub const HOST_STREAM_ID: &str = "hydrowcast-host";

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_owned(),
        clock_rate: OPUS_CLOCK_RATE,
        channels: CHANNELS,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
        rtcp_feedback: vec![],
    }
}

/// The host microphone as an outbound track.
///
/// One instance is shared by every peer link. It starts disabled: frames
/// written while disabled are dropped, so nothing leaves the host until a
/// talk mode turns it on.
pub struct CaptureTrack {
    id: String,
    device_name: String,
    enabled: AtomicBool,
    track: Arc<TrackLocalStaticRTP>,
    sequence_number: Mutex<u16>,
    timestamp: Mutex<u32>,
    ssrc: u32,
}

impl CaptureTrack {
    pub fn new(device_name: &str) -> Self {
        let id = format!("capture-{}", uuid::Uuid::new_v4());
        let track = Arc::new(TrackLocalStaticRTP::new(
            opus_capability(),
            id.clone(),
            HOST_STREAM_ID.to_string(),
        ));

        Self {
            id,
            device_name: device_name.to_string(),
            enabled: AtomicBool::new(false),
            track,
            sequence_number: Mutex::new(0),
            timestamp: Mutex::new(rand::random::<u32>()),
            ssrc: rand::random::<u32>(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Underlying track for adding to peer connections
    pub fn rtp_track(&self) -> Arc<TrackLocalStaticRTP> {
        self.track.clone()
    }

    /// Send one encoded Opus frame to every bound link.
    /// Returns `false` when the frame was dropped because the track is disabled.
    pub async fn send_audio(&self, opus_data: &[u8]) -> Result<bool, MediaError> {
        if !self.is_enabled() {
            return Ok(false);
        }

        // Build RTP packet without holding locks across await
        let packet = {
            let mut seq = self.sequence_number.lock();
            let mut ts = self.timestamp.lock();

            let packet = RtpPacket {
                header: webrtc::rtp::header::Header {
                    version: 2,
                    padding: false,
                    extension: false,
                    marker: false,
                    payload_type: OPUS_PAYLOAD_TYPE,
                    sequence_number: *seq,
                    timestamp: *ts,
                    ssrc: self.ssrc,
                    ..Default::default()
                },
                payload: bytes::Bytes::copy_from_slice(opus_data),
            };

            *seq = seq.wrapping_add(1);
            *ts = ts.wrapping_add(SAMPLES_PER_RTP_PACKET);

            packet
        };

        self.track
            .write_rtp(&packet)
            .await
            .map_err(|e| MediaError::Track(format!("Failed to write RTP packet: {}", e)))?;

        Ok(true)
    }
}

impl std::fmt::Debug for CaptureTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureTrack")
            .field("id", &self.id)
            .field("device_name", &self.device_name)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Configure MediaEngine with Opus codec for audio
pub fn register_audio_codec(m: &mut MediaEngine) -> Result<(), MediaError> {
    m.register_codec(
        RTCRtpCodecParameters {
            capability: opus_capability(),
            payload_type: OPUS_PAYLOAD_TYPE,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )
    .map_err(|e| MediaError::Setup(format!("Failed to register Opus codec: {}", e)))?;

    Ok(())
}
