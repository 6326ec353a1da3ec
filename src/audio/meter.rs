//! Capture level metering
//! Frames update the level as they arrive; a sampler task publishes it on a
//! fixed interval, independent of any rendering loop.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Audio level calculation from samples (for UI metering)
pub fn calculate_audio_level(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    // Calculate RMS (Root Mean Square)
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    let rms = (sum_squares / samples.len() as f32).sqrt();

    // Convert to dB scale and normalize to 0.0-1.0
    // -60dB to 0dB range
    let db = 20.0 * rms.max(1e-10).log10();
    let normalized = (db + 60.0) / 60.0;
    normalized.clamp(0.0, 1.0)
}

/// Most recent capture level, 0.0 to 1.0
#[derive(Debug, Default)]
pub struct LevelMeter {
    level: AtomicU32,
}

impl LevelMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, samples: &[f32]) {
        let level = calculate_audio_level(samples);
        self.level.store(level.to_bits(), Ordering::Relaxed);
    }

    pub fn level(&self) -> f32 {
        f32::from_bits(self.level.load(Ordering::Relaxed))
    }

    pub fn reset(&self) {
        self.level.store(0f32.to_bits(), Ordering::Relaxed);
    }
}

/// Sample `meter` every `period` and hand the value to `on_sample`
pub fn spawn_sampler<F>(meter: Arc<LevelMeter>, period: Duration, on_sample: F) -> JoinHandle<()>
where
    F: Fn(f32) + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            on_sample(meter.level());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_audio_level_silent() {
        let samples = vec![0.0f32; 960];
        let level = calculate_audio_level(&samples);
        assert!(level < 0.01, "Silent audio should have near-zero level");
    }

    #[test]
    fn test_audio_level_loud() {
        let samples = vec![0.5f32; 960];
        let level = calculate_audio_level(&samples);
        assert!(level > 0.8, "Loud audio should have high level");
    }

    #[test]
    fn test_meter_tracks_last_frame() {
        let meter = LevelMeter::new();
        assert_eq!(meter.level(), 0.0);
        meter.push(&[0.5; 960]);
        assert!(meter.level() > 0.8);
        meter.push(&[0.0; 960]);
        assert!(meter.level() < 0.01);
        meter.push(&[0.5; 960]);
        meter.reset();
        assert_eq!(meter.level(), 0.0);
    }

    #[tokio::test]
    async fn test_sampler_publishes_periodically() {
        let meter = Arc::new(LevelMeter::new());
        meter.push(&[0.5; 960]);

        let samples = Arc::new(Mutex::new(Vec::new()));
        let sink = samples.clone();
        let task = spawn_sampler(meter, Duration::from_millis(5), move |level| {
            sink.lock().push(level);
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        task.abort();

        let samples = samples.lock();
        assert!(samples.len() >= 2);
        assert!(samples.iter().all(|level| *level > 0.8));
    }
}
