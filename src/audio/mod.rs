mod capture;
mod encoder;
mod meter;
mod mixer;

pub use capture::{
    CaptureBackend, CaptureConstraints, CaptureHandle, CpalBackend, DeviceError, FrameSender,
    SharedCapture, Swapped,
};
pub use encoder::{CodecError, OpusDecoder, OpusEncoder};
pub use meter::{calculate_audio_level, spawn_sampler, LevelMeter};
pub use mixer::{AudioMixer, MixBus};

/// Sample rate for all audio operations (48kHz is Opus native)
pub const SAMPLE_RATE: u32 = 48000;
/// Channels (mono for voice)
pub const CHANNELS: u16 = 1;
/// Frame duration in ms (20ms is optimal for Opus)
pub const FRAME_DURATION_MS: u32 = 20;
/// Samples per frame (48000 * 20 / 1000 = 960)
pub const SAMPLES_PER_FRAME: usize = (SAMPLE_RATE * FRAME_DURATION_MS / 1000) as usize;
/// Opus bitrate (64kbps good for voice)
pub const OPUS_BITRATE: i32 = 64000;
