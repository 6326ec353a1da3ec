use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::encoder::OpusDecoder;
use super::meter::calculate_audio_level;
use super::SAMPLES_PER_FRAME;
use crate::webrtc::RemoteAudio;

/// Jitter buffer size in frames (60ms = 3 frames at 20ms/frame)
const JITTER_BUFFER_FRAMES: usize = 3;
const JITTER_BUFFER_SAMPLES: usize = SAMPLES_PER_FRAME * JITTER_BUFFER_FRAMES;

/// Interface to the mixing console that receives contributor audio
pub trait MixBus: Send + Sync {
    /// Route a contributor's inbound audio into the mix at `gain`
    fn attach_contributor(&self, client_id: &str, audio: RemoteAudio, gain: f32);

    fn set_contributor_gain(&self, client_id: &str, gain: f32);

    fn detach_contributor(&self, client_id: &str);

    /// Gain applied to program (deck) audio; lowered while ducking
    fn set_program_gain(&self, gain: f32);
}

/// Per-contributor audio buffer
struct ContributorBuffer {
    /// Queue holding decoded samples
    samples: VecDeque<f32>,
    /// Gain into the mix (0.0 - 1.0)
    gain: f32,
    decode_task: Option<JoinHandle<()>>,
}

impl ContributorBuffer {
    fn new(gain: f32) -> Self {
        Self {
            samples: VecDeque::with_capacity(JITTER_BUFFER_SAMPLES * 2),
            gain: gain.clamp(0.0, 1.0),
            decode_task: None,
        }
    }
}

impl Drop for ContributorBuffer {
    fn drop(&mut self) {
        if let Some(task) = self.decode_task.take() {
            task.abort();
        }
    }
}

struct MixerState {
    contributors: HashMap<String, ContributorBuffer>,
    master_volume: f32,
    program_gain: f32,
}

/// In-process mix bus: decodes contributor audio and mixes it for the console
#[derive(Clone)]
pub struct AudioMixer {
    state: Arc<Mutex<MixerState>>,
}

impl AudioMixer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MixerState {
                contributors: HashMap::new(),
                master_volume: 1.0,
                program_gain: 1.0,
            })),
        }
    }

    /// Add decoded samples from a contributor. Samples for unknown
    /// contributors are dropped.
    pub fn push_samples(&self, client_id: &str, samples: &[f32]) {
        let mut state = self.state.lock();
        let Some(buffer) = state.contributors.get_mut(client_id) else {
            return;
        };

        buffer.samples.extend(samples.iter().copied());

        // Limit buffer size to prevent memory growth
        let excess = buffer.samples.len().saturating_sub(JITTER_BUFFER_SAMPLES * 2);
        buffer.samples.drain(..excess);
    }

    /// Get one frame of mixed contributor audio
    pub fn get_mixed_samples(&self) -> Vec<f32> {
        let mut mixed = vec![0.0f32; SAMPLES_PER_FRAME];
        self.mix_into(&mut mixed);
        mixed
    }

    /// Mix one frame into `output`. Muted contributors are still drained so
    /// unmuting never plays stale audio.
    pub fn mix_into(&self, output: &mut [f32]) {
        output.fill(0.0);

        let mut state = self.state.lock();
        let count = state.contributors.len();
        if count == 0 {
            return;
        }

        // Normalization factor to prevent clipping when many contributors
        let norm_factor = if count > 1 {
            1.0 / (count as f32).sqrt()
        } else {
            1.0
        };

        let frame_len = output.len().min(SAMPLES_PER_FRAME);
        for buffer in state.contributors.values_mut() {
            // Jitter buffering: wait for a full frame
            if buffer.samples.len() < frame_len {
                continue;
            }

            let gain = buffer.gain * norm_factor;
            for (out, sample) in output.iter_mut().zip(buffer.samples.drain(..frame_len)) {
                *out += sample * gain;
            }
        }

        let master = state.master_volume;
        for sample in output.iter_mut() {
            *sample = (*sample * master).clamp(-1.0, 1.0);
        }
    }

    pub fn contributor_gain(&self, client_id: &str) -> Option<f32> {
        self.state.lock().contributors.get(client_id).map(|b| b.gain)
    }

    /// Level of the buffered audio for a contributor (0.0 - 1.0)
    pub fn contributor_level(&self, client_id: &str) -> f32 {
        let state = self.state.lock();
        state
            .contributors
            .get(client_id)
            .map(|buffer| {
                let (front, _) = buffer.samples.as_slices();
                let n = front.len().min(SAMPLES_PER_FRAME);
                calculate_audio_level(&front[..n])
            })
            .unwrap_or(0.0)
    }

    pub fn contributors(&self) -> Vec<String> {
        self.state.lock().contributors.keys().cloned().collect()
    }

    pub fn program_gain(&self) -> f32 {
        self.state.lock().program_gain
    }

    pub fn set_master_volume(&self, volume: f32) {
        self.state.lock().master_volume = volume.clamp(0.0, 1.0);
    }

    pub fn master_volume(&self) -> f32 {
        self.state.lock().master_volume
    }

    pub fn clear(&self) {
        self.state.lock().contributors.clear();
    }
}

impl Default for AudioMixer {
    fn default() -> Self {
        Self::new()
    }
}

impl MixBus for AudioMixer {
    fn attach_contributor(&self, client_id: &str, mut audio: RemoteAudio, gain: f32) {
        let mixer = self.clone();
        let id = client_id.to_string();
        let track_id = audio.track_id.clone();

        let task = tokio::spawn(async move {
            let mut decoder = match OpusDecoder::new() {
                Ok(decoder) => decoder,
                Err(e) => {
                    tracing::error!("No decoder for {}: {}", id, e);
                    return;
                }
            };

            while let Some(packet) = audio.packets.recv().await {
                match decoder.decode(&packet) {
                    Ok(samples) => mixer.push_samples(&id, &samples),
                    Err(e) => tracing::debug!("Failed to decode packet from {}: {}", id, e),
                }
            }
            tracing::debug!("Contributor track {} ended", audio.track_id);
        });

        let mut buffer = ContributorBuffer::new(gain);
        buffer.decode_task = Some(task);
        // Replacing an entry drops the old buffer, which stops its decoder
        self.state.lock().contributors.insert(client_id.to_string(), buffer);

        tracing::info!(
            "Contributor {} attached (track {}, gain {:.2})",
            client_id,
            track_id,
            gain
        );
    }

    fn set_contributor_gain(&self, client_id: &str, gain: f32) {
        if let Some(buffer) = self.state.lock().contributors.get_mut(client_id) {
            buffer.gain = gain.clamp(0.0, 1.0);
        }
    }

    fn detach_contributor(&self, client_id: &str) {
        if self.state.lock().contributors.remove(client_id).is_some() {
            tracing::info!("Contributor {} detached", client_id);
        }
    }

    fn set_program_gain(&self, gain: f32) {
        self.state.lock().program_gain = gain.clamp(0.0, 1.0);
    }
}
