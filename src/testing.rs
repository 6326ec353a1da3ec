//! In-memory stand-ins for the media stack, capture devices and mixer

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::audio::{
    CaptureBackend, CaptureConstraints, CaptureHandle, DeviceError, FrameSender, MixBus,
};
use crate::webrtc::{
    CaptureTrack, CommandMessage, IceCandidate, LinkEvents, MediaError, MediaFactory, MediaSession,
    RemoteAudio, SdpKind, SessionDescription,
};

pub const DEFAULT_DEVICE: &str = "Default Input";

pub type CallLog = Arc<Mutex<Vec<String>>>;

/// Media session that records every call into a shared log
pub struct FakeSession {
    name: String,
    log: CallLog,
    channel_open: AtomicBool,
    closed: AtomicBool,
    fail_answers: AtomicBool,
    commands: Mutex<Vec<CommandMessage>>,
    sending_track: Mutex<Option<String>>,
    replace_calls: AtomicUsize,
    close_calls: AtomicUsize,
}

impl FakeSession {
    pub fn new(name: &str) -> Arc<Self> {
        Self::with_log(name, Arc::new(Mutex::new(Vec::new())))
    }

    pub fn with_log(name: &str, log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log,
            channel_open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            fail_answers: AtomicBool::new(false),
            commands: Mutex::new(Vec::new()),
            sending_track: Mutex::new(None),
            replace_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
        })
    }

    fn record(&self, call: &str) {
        self.log.lock().push(format!("{}:{}", self.name, call));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn open_channel(&self) {
        self.channel_open.store(true, Ordering::SeqCst);
    }

    pub fn fail_answers(&self) {
        self.fail_answers.store(true, Ordering::SeqCst);
    }

    pub fn commands(&self) -> Vec<CommandMessage> {
        self.commands.lock().clone()
    }

    pub fn replace_calls(&self) -> usize {
        self.replace_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl MediaSession for FakeSession {
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        let kind = match desc.kind {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        };
        self.record(&format!("set_remote:{}", kind));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        self.record("create_offer");
        Ok(SessionDescription::offer(format!("offer-from-{}", self.name)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        self.record("create_answer");
        if self.fail_answers.load(Ordering::SeqCst) {
            return Err(MediaError::Negotiation("answer refused".to_string()));
        }
        Ok(SessionDescription::answer(format!("answer-from-{}", self.name)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.record(&format!("add_candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn attach_track(&self, track: Arc<CaptureTrack>) -> Result<(), MediaError> {
        self.record("attach_track");
        *self.sending_track.lock() = Some(track.id().to_string());
        Ok(())
    }

    async fn replace_track(&self, track: Arc<CaptureTrack>) -> Result<(), MediaError> {
        self.record("replace_track");
        self.replace_calls.fetch_add(1, Ordering::SeqCst);
        let mut sending = self.sending_track.lock();
        if sending.is_none() {
            return Err(MediaError::NoSender);
        }
        *sending = Some(track.id().to_string());
        Ok(())
    }

    fn sending_track_id(&self) -> Option<String> {
        self.sending_track.lock().clone()
    }

    async fn open_command_channel(&self) -> Result<(), MediaError> {
        self.record("open_channel");
        Ok(())
    }

    async fn send_command(&self, text: String) -> Result<(), MediaError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MediaError::Closed);
        }
        if !self.channel_open.load(Ordering::SeqCst) {
            return Err(MediaError::Channel("not open".to_string()));
        }
        let command = CommandMessage::parse(&text)
            .map_err(|e| MediaError::Channel(e.to_string()))?;
        self.commands.lock().push(command);
        Ok(())
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.record("close");
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        self.channel_open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out FakeSessions named s1, s2, ... sharing one call log
#[derive(Default)]
pub struct FakeFactory {
    log: CallLog,
    sessions: Mutex<Vec<(Arc<FakeSession>, LinkEvents)>>,
    fail: AtomicBool,
    fail_answers: AtomicBool,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_creation(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    /// Sessions created from now on refuse to produce answers
    pub fn fail_answers(&self) {
        self.fail_answers.store(true, Ordering::SeqCst);
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn created(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Session `n`, counting from 1
    pub fn session(&self, n: usize) -> Arc<FakeSession> {
        self.sessions.lock()[n - 1].0.clone()
    }

    /// Event sink handed to session `n`, counting from 1
    pub fn events(&self, n: usize) -> LinkEvents {
        self.sessions.lock()[n - 1].1.clone()
    }
}

#[async_trait]
impl MediaFactory for FakeFactory {
    async fn create_session(
        &self,
        client_id: &str,
        events: LinkEvents,
    ) -> Result<Arc<dyn MediaSession>, MediaError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(MediaError::Setup(format!("refused link for {}", client_id)));
        }
        let mut sessions = self.sessions.lock();
        let session = FakeSession::with_log(&format!("s{}", sessions.len() + 1), self.log.clone());
        if self.fail_answers.load(Ordering::SeqCst) {
            session.fail_answers();
        }
        self.log.lock().push(format!("{}:created", session.name()));
        sessions.push((session.clone(), events));
        Ok(session as Arc<dyn MediaSession>)
    }
}

struct FakeHandle {
    name: String,
    released: Arc<AtomicUsize>,
}

impl CaptureHandle for FakeHandle {
    fn device_name(&self) -> &str {
        &self.name
    }
}

impl Drop for FakeHandle {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Capture backend with a fixed device list and no real audio
pub struct FakeCaptureBackend {
    devices: Vec<String>,
    deny: AtomicBool,
    open_attempts: AtomicUsize,
    released: Arc<AtomicUsize>,
    open_delay: Mutex<Duration>,
    frames: Mutex<Option<FrameSender>>,
}

impl FakeCaptureBackend {
    pub fn new(devices: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            devices: devices.iter().map(|d| d.to_string()).collect(),
            deny: AtomicBool::new(false),
            open_attempts: AtomicUsize::new(0),
            released: Arc::new(AtomicUsize::new(0)),
            open_delay: Mutex::new(Duration::ZERO),
            frames: Mutex::new(None),
        })
    }

    pub fn deny_access(&self) {
        self.deny.store(true, Ordering::SeqCst);
    }

    pub fn allow_access(&self) {
        self.deny.store(false, Ordering::SeqCst);
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock() = delay;
    }

    pub fn open_attempts(&self) -> usize {
        self.open_attempts.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Deliver a frame as if the most recently opened device captured it
    pub fn push_frame(&self, frame: Vec<f32>) {
        if let Some(frames) = self.frames.lock().as_ref() {
            let _ = frames.send(frame);
        }
    }
}

impl CaptureBackend for FakeCaptureBackend {
    fn list_devices(&self) -> Result<Vec<String>, DeviceError> {
        Ok(self.devices.clone())
    }

    fn open(
        &self,
        device: Option<&str>,
        _constraints: &CaptureConstraints,
        frames: FrameSender,
    ) -> Result<Box<dyn CaptureHandle>, DeviceError> {
        self.open_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.open_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        if self.deny.load(Ordering::SeqCst) {
            return Err(DeviceError::Unavailable("permission denied".to_string()));
        }

        let name = match device {
            Some(name) if self.devices.iter().any(|d| d == name) => name.to_string(),
            Some(name) => return Err(DeviceError::NotFound(name.to_string())),
            None => DEFAULT_DEVICE.to_string(),
        };

        *self.frames.lock() = Some(frames);
        Ok(Box::new(FakeHandle {
            name,
            released: self.released.clone(),
        }))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MixCall {
    Attach(String, f32),
    ContributorGain(String, f32),
    Detach(String),
    ProgramGain(f32),
}

/// Mix bus that only records what it was asked to do
#[derive(Default)]
pub struct RecordingMixBus {
    calls: Mutex<Vec<MixCall>>,
}

impl RecordingMixBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<MixCall> {
        self.calls.lock().clone()
    }
}

impl MixBus for RecordingMixBus {
    fn attach_contributor(&self, client_id: &str, _audio: RemoteAudio, gain: f32) {
        self.calls
            .lock()
            .push(MixCall::Attach(client_id.to_string(), gain));
    }

    fn set_contributor_gain(&self, client_id: &str, gain: f32) {
        self.calls
            .lock()
            .push(MixCall::ContributorGain(client_id.to_string(), gain));
    }

    fn detach_contributor(&self, client_id: &str) {
        self.calls
            .lock()
            .push(MixCall::Detach(client_id.to_string()));
    }

    fn set_program_gain(&self, gain: f32) {
        self.calls.lock().push(MixCall::ProgramGain(gain));
    }
}
