use opus::{Application, Channels, Decoder, Encoder};
use thiserror::Error;

use super::{OPUS_BITRATE, SAMPLES_PER_FRAME, SAMPLE_RATE};

/// Largest Opus packet we produce (voice frames are usually 64-128 bytes)
const MAX_PACKET_BYTES: usize = 512;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Failed to create Opus {0}: {1}")]
    Init(&'static str, opus::Error),
    #[error("Encoding failed: {0}")]
    Encode(opus::Error),
    #[error("Decoding failed: {0}")]
    Decode(opus::Error),
}

/// Opus encoder for the host microphone
pub struct OpusEncoder {
    encoder: Encoder,
    scratch: Vec<f32>,
}

impl OpusEncoder {
    pub fn new() -> Result<Self, CodecError> {
        let mut encoder = Encoder::new(SAMPLE_RATE, Channels::Mono, Application::Voip)
            .map_err(|e| CodecError::Init("encoder", e))?;

        encoder
            .set_bitrate(opus::Bitrate::Bits(OPUS_BITRATE))
            .map_err(|e| CodecError::Init("encoder", e))?;

        // FEC keeps short dropouts inaudible on lossy links
        encoder
            .set_inband_fec(true)
            .map_err(|e| CodecError::Init("encoder", e))?;
        encoder
            .set_packet_loss_perc(10)
            .map_err(|e| CodecError::Init("encoder", e))?;

        Ok(Self {
            encoder,
            scratch: vec![0.0; SAMPLES_PER_FRAME],
        })
    }

    /// Encode one frame. Short input is zero-padded and long input truncated
    /// to SAMPLES_PER_FRAME, so a device delivering odd buffer sizes still
    /// produces valid 20ms packets.
    pub fn encode(&mut self, samples: &[f32]) -> Result<Vec<u8>, CodecError> {
        let frame: &[f32] = if samples.len() == SAMPLES_PER_FRAME {
            samples
        } else {
            let n = samples.len().min(SAMPLES_PER_FRAME);
            self.scratch[..n].copy_from_slice(&samples[..n]);
            self.scratch[n..].fill(0.0);
            &self.scratch
        };

        let mut output = vec![0u8; MAX_PACKET_BYTES];
        let len = self
            .encoder
            .encode_float(frame, &mut output)
            .map_err(CodecError::Encode)?;

        output.truncate(len);
        Ok(output)
    }
}

/// Opus decoder for one contributor's inbound audio
pub struct OpusDecoder {
    decoder: Decoder,
}

impl OpusDecoder {
    pub fn new() -> Result<Self, CodecError> {
        let decoder = Decoder::new(SAMPLE_RATE, Channels::Mono)
            .map_err(|e| CodecError::Init("decoder", e))?;

        Ok(Self { decoder })
    }

    /// Decode one packet into mono samples.
    /// An empty packet triggers packet loss concealment.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<f32>, CodecError> {
        // Opus packets carry up to 120ms
        let mut output = vec![0.0f32; SAMPLES_PER_FRAME * 6];

        let len = self
            .decoder
            .decode_float(data, &mut output, data.is_empty())
            .map_err(CodecError::Decode)?;

        output.truncate(len);
        Ok(output)
    }
}
