//! Shared microphone capture
//!
//! One physical capture feeds every peer link. The capture runs on its own
//! thread (cpal streams are thread-bound); frames travel over a channel to a
//! pump task that meters them and, while the track is enabled, encodes and
//! writes them to the shared RTP track.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

use super::encoder::OpusEncoder;
use super::meter::LevelMeter;
use super::{CHANNELS, SAMPLES_PER_FRAME, SAMPLE_RATE};
use crate::webrtc::{CaptureTrack, LinkRegistry, MediaError, MediaSession};

pub type FrameSender = mpsc::UnboundedSender<Vec<f32>>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Device '{0}' not found")]
    NotFound(String),
    #[error("No default input device available")]
    NoDefaultDevice,
    #[error("Microphone unavailable: {0}")]
    Unavailable(String),
    #[error("Failed to open stream: {0}")]
    Stream(String),
}

/// Requested stream shape; unset fields use the voice defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureConstraints {
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub buffer_frames: Option<u32>,
}

/// Result of moving the capture to another device
#[derive(Clone)]
pub struct Swapped {
    pub track: Arc<CaptureTrack>,
    /// Links that had no outbound sender; they only pick up the new track
    /// through a fresh offer
    pub needs_offer: Vec<String>,
}

/// A running capture; dropping it releases the device
pub trait CaptureHandle: Send + Sync {
    fn device_name(&self) -> &str;
}

/// Opens physical capture devices. `open` may block.
pub trait CaptureBackend: Send + Sync {
    fn list_devices(&self) -> Result<Vec<String>, DeviceError>;

    /// Start capturing from `device` (system default when `None`), delivering
    /// mono frames of SAMPLES_PER_FRAME samples to `frames`
    fn open(
        &self,
        device: Option<&str>,
        constraints: &CaptureConstraints,
        frames: FrameSender,
    ) -> Result<Box<dyn CaptureHandle>, DeviceError>;
}

#[derive(Default)]
struct CaptureState {
    track: Option<Arc<CaptureTrack>>,
    handle: Option<Box<dyn CaptureHandle>>,
    device_id: Option<String>,
}

struct CaptureInner {
    backend: Arc<dyn CaptureBackend>,
    registry: Arc<LinkRegistry>,
    meter: Arc<LevelMeter>,
    state: RwLock<CaptureState>,
    talk_enabled: AtomicBool,
    muted: AtomicBool,
}

/// The single capture shared by every peer link
#[derive(Clone)]
pub struct SharedCapture {
    inner: Arc<CaptureInner>,
}

impl SharedCapture {
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        registry: Arc<LinkRegistry>,
        meter: Arc<LevelMeter>,
    ) -> Self {
        Self {
            inner: Arc::new(CaptureInner {
                backend,
                registry,
                meter,
                state: RwLock::new(CaptureState::default()),
                talk_enabled: AtomicBool::new(false),
                muted: AtomicBool::new(false),
            }),
        }
    }

    fn effective_enabled(&self) -> bool {
        self.inner.talk_enabled.load(Ordering::SeqCst) && !self.inner.muted.load(Ordering::SeqCst)
    }

    /// Start the capture if it isn't running yet
    pub async fn acquire(
        &self,
        device_id: Option<String>,
        constraints: CaptureConstraints,
    ) -> Result<Arc<CaptureTrack>, DeviceError> {
        let mut state = self.inner.state.write().await;
        if let (Some(track), Some(_)) = (&state.track, &state.handle) {
            tracing::debug!("Capture already running on {}", track.device_name());
            return Ok(track.clone());
        }

        let (handle, track) = self.open_with_fallback(device_id.clone(), &constraints).await?;
        tracing::info!("Capture acquired on {}", handle.device_name());
        state.track = Some(track.clone());
        state.handle = Some(handle);
        state.device_id = device_id;
        Ok(track)
    }

    /// Move the capture to another device.
    ///
    /// Registered links with an outbound sender get the new track through
    /// in-place replacement before this returns; links without one are listed
    /// in `needs_offer`. Links being created meanwhile wait on the lock.
    /// If no device can be opened the old track stays attached but silent.
    pub async fn swap(
        &self,
        device_id: Option<String>,
        constraints: CaptureConstraints,
    ) -> Result<Swapped, DeviceError> {
        let mut state = self.inner.state.write().await;

        if let Some(old) = &state.track {
            old.set_enabled(false);
        }
        if let Some(handle) = state.handle.take() {
            release_handle(handle).await;
        }

        let (handle, track) = self.open_with_fallback(device_id.clone(), &constraints).await?;

        let links = self.inner.registry.snapshot();
        let mut needs_offer = Vec::new();
        for (client_id, session) in &links {
            if session.sending_track_id().is_none() {
                needs_offer.push(client_id.clone());
                continue;
            }
            match session.replace_track(track.clone()).await {
                Ok(()) => {}
                Err(MediaError::NoSender) => needs_offer.push(client_id.clone()),
                Err(e) => tracing::warn!("Failed to replace track for {}: {}", client_id, e),
            }
        }

        tracing::info!(
            "Capture swapped to {} ({} links updated, {} need an offer)",
            handle.device_name(),
            links.len() - needs_offer.len(),
            needs_offer.len()
        );
        state.track = Some(track.clone());
        state.handle = Some(handle);
        state.device_id = device_id;
        Ok(Swapped { track, needs_offer })
    }

    /// Open `device_id`, substituting the system default when it fails
    async fn open_with_fallback(
        &self,
        device_id: Option<String>,
        constraints: &CaptureConstraints,
    ) -> Result<(Box<dyn CaptureHandle>, Arc<CaptureTrack>), DeviceError> {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();

        let handle = match self.open_blocking(device_id.clone(), constraints, frames_tx.clone()).await {
            Ok(handle) => handle,
            Err(e) if device_id.is_some() => {
                tracing::warn!(
                    "Capture device {:?} unavailable ({}), falling back to system default",
                    device_id,
                    e
                );
                self.open_blocking(None, constraints, frames_tx).await?
            }
            Err(e) => return Err(e),
        };

        let track = Arc::new(CaptureTrack::new(handle.device_name()));
        track.set_enabled(self.effective_enabled());
        tokio::spawn(pump_frames(frames_rx, track.clone(), self.inner.meter.clone()));

        Ok((handle, track))
    }

    async fn open_blocking(
        &self,
        device_id: Option<String>,
        constraints: &CaptureConstraints,
        frames: FrameSender,
    ) -> Result<Box<dyn CaptureHandle>, DeviceError> {
        let backend = self.inner.backend.clone();
        let constraints = constraints.clone();
        tokio::task::spawn_blocking(move || backend.open(device_id.as_deref(), &constraints, frames))
            .await
            .map_err(|e| DeviceError::Unavailable(format!("Capture task failed: {}", e)))?
    }

    /// Attach the current track to a new link and register the link.
    /// Waits for an in-flight swap to finish first.
    pub async fn attach(&self, client_id: &str, session: Arc<dyn MediaSession>) -> Result<(), MediaError> {
        let state = self.inner.state.read().await;
        self.inner.registry.insert(client_id, session.clone());
        match &state.track {
            Some(track) => session.attach_track(track.clone()).await,
            None => {
                tracing::debug!("No capture running, link {} is receive-only", client_id);
                Ok(())
            }
        }
    }

    pub fn detach(&self, client_id: &str, session: &Arc<dyn MediaSession>) {
        self.inner.registry.remove(client_id, session);
    }

    /// Talk state from the PTT coordinator
    pub async fn set_talk_enabled(&self, enabled: bool) {
        self.inner.talk_enabled.store(enabled, Ordering::SeqCst);
        self.apply_enabled().await;
    }

    /// Host hard mute, overrides any talk mode
    pub async fn set_muted(&self, muted: bool) {
        self.inner.muted.store(muted, Ordering::SeqCst);
        self.apply_enabled().await;
    }

    pub fn is_muted(&self) -> bool {
        self.inner.muted.load(Ordering::SeqCst)
    }

    async fn apply_enabled(&self) {
        let state = self.inner.state.read().await;
        if let Some(track) = &state.track {
            track.set_enabled(self.effective_enabled());
        }
    }

    pub async fn current_track(&self) -> Option<Arc<CaptureTrack>> {
        self.inner.state.read().await.track.clone()
    }

    pub async fn is_transmitting(&self) -> bool {
        self.current_track()
            .await
            .map(|track| track.is_enabled())
            .unwrap_or(false)
    }

    pub async fn device_id(&self) -> Option<String> {
        self.inner.state.read().await.device_id.clone()
    }

    pub async fn list_devices(&self) -> Result<Vec<String>, DeviceError> {
        let backend = self.inner.backend.clone();
        tokio::task::spawn_blocking(move || backend.list_devices())
            .await
            .map_err(|e| DeviceError::Unavailable(format!("Device listing failed: {}", e)))?
    }

    pub fn level(&self) -> f32 {
        self.inner.meter.level()
    }

    pub fn meter(&self) -> Arc<LevelMeter> {
        self.inner.meter.clone()
    }

    /// Stop capturing; links keep the silent track until they close
    pub async fn release(&self) {
        let mut state = self.inner.state.write().await;
        if let Some(track) = state.track.take() {
            track.set_enabled(false);
        }
        if let Some(handle) = state.handle.take() {
            release_handle(handle).await;
        }
        self.inner.meter.reset();
        tracing::info!("Capture released");
    }
}

async fn release_handle(handle: Box<dyn CaptureHandle>) {
    let name = handle.device_name().to_string();
    if let Err(e) = tokio::task::spawn_blocking(move || drop(handle)).await {
        tracing::warn!("Failed to release capture {}: {}", name, e);
    }
}

/// Meter every frame, encode and send the ones captured while enabled
async fn pump_frames(
    mut frames: mpsc::UnboundedReceiver<Vec<f32>>,
    track: Arc<CaptureTrack>,
    meter: Arc<LevelMeter>,
) {
    let mut encoder = match OpusEncoder::new() {
        Ok(encoder) => Some(encoder),
        Err(e) => {
            tracing::error!("Capture on {} will not transmit: {}", track.device_name(), e);
            None
        }
    };

    while let Some(frame) = frames.recv().await {
        meter.push(&frame);
        if !track.is_enabled() {
            continue;
        }
        let Some(encoder) = encoder.as_mut() else {
            continue;
        };
        match encoder.encode(&frame) {
            Ok(packet) => {
                if let Err(e) = track.send_audio(&packet).await {
                    tracing::debug!("Dropped capture frame: {}", e);
                }
            }
            Err(e) => tracing::warn!("Failed to encode capture frame: {}", e),
        }
    }

    tracing::debug!("Capture pump for {} finished", track.device_name());
}

/// Capture backend on the system audio host
#[derive(Debug, Default)]
pub struct CpalBackend;

fn find_input_device(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device, DeviceError> {
    match name {
        Some(device_name) => {
            let devices = host
                .input_devices()
                .map_err(|e| DeviceError::Unavailable(format!("Failed to enumerate devices: {}", e)))?;

            for device in devices {
                if let Ok(n) = device.name() {
                    if n == device_name {
                        return Ok(device);
                    }
                }
            }
            Err(DeviceError::NotFound(device_name.to_string()))
        }
        None => host.default_input_device().ok_or(DeviceError::NoDefaultDevice),
    }
}

struct CpalHandle {
    device_name: String,
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle for CpalHandle {
    fn device_name(&self) -> &str {
        &self.device_name
    }
}

impl Drop for CpalHandle {
    fn drop(&mut self) {
        // Closing the stop channel ends the capture thread, which drops the stream
        drop(self.stop_tx.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl CaptureBackend for CpalBackend {
    fn list_devices(&self) -> Result<Vec<String>, DeviceError> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| DeviceError::Unavailable(format!("Failed to enumerate input devices: {}", e)))?;

        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }

    fn open(
        &self,
        device: Option<&str>,
        constraints: &CaptureConstraints,
        frames: FrameSender,
    ) -> Result<Box<dyn CaptureHandle>, DeviceError> {
        let requested = device.map(str::to_owned);
        let config = StreamConfig {
            channels: constraints.channels.unwrap_or(CHANNELS),
            sample_rate: cpal::SampleRate(constraints.sample_rate.unwrap_or(SAMPLE_RATE)),
            buffer_size: cpal::BufferSize::Fixed(
                constraints.buffer_frames.unwrap_or(SAMPLES_PER_FRAME as u32),
            ),
        };

        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<String, DeviceError>>(1);
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name("host-capture".to_string())
            .spawn(move || {
                let host = cpal::default_host();
                let device = match find_input_device(&host, requested.as_deref()) {
                    Ok(device) => device,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let name = device.name().unwrap_or_default();
                let channels = config.channels.max(1) as usize;
                let mut pending: Vec<f32> = Vec::with_capacity(SAMPLES_PER_FRAME * 2);

                let stream = device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        // Downmix to mono
                        if channels > 1 {
                            for chunk in data.chunks(channels) {
                                pending.push(chunk.iter().sum::<f32>() / channels as f32);
                            }
                        } else {
                            pending.extend_from_slice(data);
                        }

                        while pending.len() >= SAMPLES_PER_FRAME {
                            let frame: Vec<f32> = pending.drain(..SAMPLES_PER_FRAME).collect();
                            let _ = frames.send(frame);
                        }
                    },
                    move |err| {
                        tracing::error!("Audio input error: {}", err);
                    },
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(DeviceError::Stream(format!(
                            "Failed to build input stream: {}",
                            e
                        ))));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(DeviceError::Stream(format!(
                        "Failed to start stream: {}",
                        e
                    ))));
                    return;
                }

                let _ = ready_tx.send(Ok(name));

                // Keep the stream alive until the handle is dropped
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| DeviceError::Stream(e.to_string()))?;

        let device_name = ready_rx
            .recv()
            .map_err(|_| DeviceError::Stream("Capture thread exited during startup".to_string()))??;

        tracing::info!("Using input device: {}", device_name);

        Ok(Box::new(CpalHandle {
            device_name,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeCaptureBackend, FakeSession};

    fn capture_with(backend: Arc<FakeCaptureBackend>) -> (SharedCapture, Arc<LinkRegistry>) {
        let registry = Arc::new(LinkRegistry::new());
        let capture = SharedCapture::new(backend, registry.clone(), Arc::new(LevelMeter::new()));
        (capture, registry)
    }

    #[tokio::test]
    async fn test_acquire_starts_disabled() {
        let backend = FakeCaptureBackend::new(&["USB Mic"]);
        let (capture, _) = capture_with(backend);

        let track = capture
            .acquire(Some("USB Mic".to_string()), CaptureConstraints::default())
            .await
            .unwrap();
        assert_eq!(track.device_name(), "USB Mic");
        assert!(!track.is_enabled());
        assert!(!capture.is_transmitting().await);
    }

    #[tokio::test]
    async fn test_acquire_falls_back_to_default() {
        let backend = FakeCaptureBackend::new(&["USB Mic"]);
        let (capture, _) = capture_with(backend.clone());

        let track = capture
            .acquire(Some("Missing Mic".to_string()), CaptureConstraints::default())
            .await
            .unwrap();
        assert_eq!(track.device_name(), crate::testing::DEFAULT_DEVICE);
        assert_eq!(backend.open_attempts(), 2);
    }

    #[tokio::test]
    async fn test_acquire_fails_when_access_denied() {
        let backend = FakeCaptureBackend::new(&["USB Mic"]);
        backend.deny_access();
        let (capture, _) = capture_with(backend);

        let err = capture
            .acquire(Some("USB Mic".to_string()), CaptureConstraints::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Unavailable(_)));
        assert!(capture.current_track().await.is_none());
    }

    #[tokio::test]
    async fn test_swap_replaces_track_on_every_link() {
        let backend = FakeCaptureBackend::new(&["USB Mic", "Headset"]);
        let (capture, registry) = capture_with(backend.clone());
        capture
            .acquire(Some("USB Mic".to_string()), CaptureConstraints::default())
            .await
            .unwrap();

        let a = FakeSession::new("a");
        let b = FakeSession::new("b");
        capture.attach("a", a.clone()).await.unwrap();
        capture.attach("b", b.clone()).await.unwrap();

        let swapped = capture
            .swap(Some("Headset".to_string()), CaptureConstraints::default())
            .await
            .unwrap();
        let new_track = swapped.track;

        let mut ids = registry.client_ids();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(a.sending_track_id().as_deref(), Some(new_track.id()));
        assert_eq!(b.sending_track_id().as_deref(), Some(new_track.id()));
        assert_eq!(a.replace_calls(), 1);
        assert!(swapped.needs_offer.is_empty());
        assert_eq!(backend.released(), 1);
    }

    #[tokio::test]
    async fn test_swap_reapplies_talk_state() {
        let backend = FakeCaptureBackend::new(&["USB Mic", "Headset"]);
        let (capture, _) = capture_with(backend);
        capture.acquire(None, CaptureConstraints::default()).await.unwrap();

        capture.set_talk_enabled(true).await;
        assert!(capture.is_transmitting().await);

        let track = capture
            .swap(Some("Headset".to_string()), CaptureConstraints::default())
            .await
            .unwrap()
            .track;
        assert!(track.is_enabled());

        capture.set_muted(true).await;
        let track = capture
            .swap(Some("USB Mic".to_string()), CaptureConstraints::default())
            .await
            .unwrap()
            .track;
        assert!(!track.is_enabled());
    }

    #[tokio::test]
    async fn test_swap_lists_links_without_sender() {
        let backend = FakeCaptureBackend::new(&["USB Mic", "Headset"]);
        let (capture, _) = capture_with(backend.clone());

        // Attached while no capture was running, so it has no sender
        let silent = FakeSession::new("silent");
        capture.attach("silent", silent.clone()).await.unwrap();
        capture
            .acquire(Some("USB Mic".to_string()), CaptureConstraints::default())
            .await
            .unwrap();
        let sending = FakeSession::new("sending");
        capture.attach("sending", sending.clone()).await.unwrap();

        let swapped = capture
            .swap(Some("Headset".to_string()), CaptureConstraints::default())
            .await
            .unwrap();

        assert_eq!(swapped.needs_offer, vec!["silent".to_string()]);
        assert_eq!(silent.replace_calls(), 0);
        assert!(silent.sending_track_id().is_none());
        assert!(!silent.log().contains(&"silent:attach_track".to_string()));
        assert_eq!(sending.replace_calls(), 1);
        assert_eq!(sending.sending_track_id().as_deref(), Some(swapped.track.id()));
    }

    #[tokio::test]
    async fn test_attach_waits_for_swap() {
        let backend = FakeCaptureBackend::new(&["USB Mic", "Headset"]);
        let (capture, _) = capture_with(backend.clone());
        capture.acquire(None, CaptureConstraints::default()).await.unwrap();

        backend.set_open_delay(std::time::Duration::from_millis(50));
        let swapping = {
            let capture = capture.clone();
            tokio::spawn(async move {
                capture
                    .swap(Some("Headset".to_string()), CaptureConstraints::default())
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let late = FakeSession::new("late");
        capture.attach("late", late.clone()).await.unwrap();
        let new_track = swapping.await.unwrap().unwrap().track;

        assert_eq!(late.sending_track_id().as_deref(), Some(new_track.id()));
        assert_eq!(late.replace_calls(), 0);
    }

    #[tokio::test]
    async fn test_frames_feed_meter() {
        let backend = FakeCaptureBackend::new(&[]);
        let (capture, _) = capture_with(backend.clone());
        capture.acquire(None, CaptureConstraints::default()).await.unwrap();

        backend.push_frame(vec![0.5; SAMPLES_PER_FRAME]);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(capture.level() > 0.8);

        capture.release().await;
        assert_eq!(capture.level(), 0.0);
        assert!(capture.current_track().await.is_none());
    }
}
