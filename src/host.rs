//! Host context and the API the UI drives
//!
//! `HostContext` bundles every shared component and is passed explicitly to
//! whoever needs it. `Host` wraps it with the start/stop lifecycle and the
//! operations exposed to the console and any other front end.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::audio::{
    spawn_sampler, CaptureBackend, CaptureConstraints, DeviceError, LevelMeter, MixBus,
    SharedCapture,
};
use crate::chat::{ChatEntry, ChatError, ChatRelay};
use crate::config::HostConfig;
use crate::ptt::{PttCoordinator, TalkState};
use crate::relay::{split_clip, ChunkReassembler};
use crate::server::{ServerError, SignalingServer, SupervisorCommand};
use crate::session::{generate_session_code, Client, Session};
use crate::webrtc::{LinkConnectionState, LinkRegistry, MediaError, MediaFactory, ServerMessage};
use crate::now_millis;

/// Display name used for messages the host posts
pub const HOST_DISPLAY_NAME: &str = "Host";

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PttChannel {
    Intercom,
    Live,
}

/// Notifications for the UI layer
#[derive(Debug, Clone)]
pub enum HostEvent {
    ClientJoined(Client),
    ClientLeft {
        client_id: String,
        display_name: String,
    },
    Chat(ChatEntry),
    LinkState {
        client_id: String,
        state: LinkConnectionState,
    },
    ClipReceived {
        client_id: String,
        audio_id: String,
        audio: Vec<u8>,
    },
    ClientPtt {
        client_id: String,
        channel: PttChannel,
        active: bool,
    },
    ClientLevel {
        client_id: String,
        level: f32,
    },
    HostLevel(f32),
    TalkStateChanged(TalkState),
}

/// Shared components of a running host
pub struct HostContext {
    pub config: HostConfig,
    pub factory: Arc<dyn MediaFactory>,
    pub registry: Arc<LinkRegistry>,
    pub capture: SharedCapture,
    pub mix: Arc<dyn MixBus>,
    pub ptt: PttCoordinator,
    pub relay: Mutex<ChunkReassembler>,
    pub chat: ChatRelay,
    events: broadcast::Sender<HostEvent>,
}

impl HostContext {
    pub fn new(
        config: HostConfig,
        factory: Arc<dyn MediaFactory>,
        capture_backend: Arc<dyn CaptureBackend>,
        mix: Arc<dyn MixBus>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let registry = Arc::new(LinkRegistry::new());
        let capture = SharedCapture::new(
            capture_backend,
            registry.clone(),
            Arc::new(LevelMeter::new()),
        );
        let ptt = PttCoordinator::new(
            config.duck_factor(),
            capture.clone(),
            registry.clone(),
            mix.clone(),
            events.clone(),
        );

        Arc::new(Self {
            relay: Mutex::new(ChunkReassembler::new(
                Duration::from_secs(config.assembly_ttl_secs),
                config.max_clip_bytes,
            )),
            chat: ChatRelay::new(config.chat_history_limit),
            config,
            factory,
            registry,
            capture,
            mix,
            ptt,
            events,
        })
    }

    pub fn publish(&self, event: HostEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }
}

/// Outcome of a start request, in the shape UI callers expect
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartReport {
    pub success: bool,
    pub port: Option<u16>,
    pub session_code: Option<String>,
    pub error: Option<String>,
}

pub struct Host {
    ctx: Arc<HostContext>,
    server: tokio::sync::Mutex<Option<SignalingServer>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Host {
    pub fn new(ctx: Arc<HostContext>) -> Self {
        Self {
            ctx,
            server: tokio::sync::Mutex::new(None),
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn context(&self) -> &Arc<HostContext> {
        &self.ctx
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.ctx.subscribe()
    }

    /// Acquire the microphone, bind the signaling port and start serving
    pub async fn start(&self) -> Result<Session, ServerError> {
        let mut server = self.server.lock().await;
        if server.is_some() {
            return Err(ServerError::AlreadyHosting);
        }

        let config = &self.ctx.config;
        let session_code = config
            .session_code
            .clone()
            .unwrap_or_else(generate_session_code);

        // Serve without a local track rather than not at all
        if let Err(e) = self
            .ctx
            .capture
            .acquire(config.capture_device.clone(), CaptureConstraints::default())
            .await
        {
            tracing::warn!("Hosting without a microphone: {}", e);
        }

        let started = SignalingServer::start(self.ctx.clone(), config.port, session_code).await?;
        let session = started.session().clone();
        *server = Some(started);

        self.spawn_background();
        tracing::info!(
            "Hosting session {} on port {}",
            session.session_code,
            session.bound_port
        );
        Ok(session)
    }

    /// `start` for UI callers that want a report instead of an error
    pub async fn start_report(&self) -> StartReport {
        match self.start().await {
            Ok(session) => StartReport {
                success: true,
                port: Some(session.bound_port),
                session_code: Some(session.session_code),
                error: None,
            },
            Err(e) => StartReport {
                success: false,
                port: None,
                session_code: None,
                error: Some(e.to_string()),
            },
        }
    }

    fn spawn_background(&self) {
        let config = &self.ctx.config;
        let mut tasks = self.background.lock();

        let ctx = self.ctx.clone();
        let sweep_every = Duration::from_secs(config.assembly_ttl_secs.max(2) / 2);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                ctx.relay.lock().sweep(Instant::now());
            }
        }));

        let ctx = self.ctx.clone();
        tasks.push(spawn_sampler(
            self.ctx.capture.meter(),
            Duration::from_millis(config.meter_interval_ms.max(1)),
            move |level| ctx.publish(HostEvent::HostLevel(level)),
        ));
    }

    /// Disconnect everyone and release the microphone
    pub async fn stop(&self) -> Result<(), ServerError> {
        let server = self.server.lock().await.take().ok_or(ServerError::NotRunning)?;
        server.shutdown().await;

        for task in self.background.lock().drain(..) {
            task.abort();
        }

        self.ctx.ptt.release_intercom().await;
        self.ctx.ptt.release_live().await;
        self.ctx.capture.release().await;
        self.ctx.chat.clear();
        self.ctx.relay.lock().clear();
        tracing::info!("Hosting stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.server.lock().await.is_some()
    }

    pub async fn session(&self) -> Option<Session> {
        self.server.lock().await.as_ref().map(|s| s.session().clone())
    }

    pub async fn clients(&self) -> Vec<Client> {
        self.server
            .lock()
            .await
            .as_ref()
            .map(|s| s.directory().clients())
            .unwrap_or_default()
    }

    pub async fn press_intercom(&self) -> TalkState {
        self.ctx.ptt.press_intercom().await
    }

    pub async fn release_intercom(&self) -> TalkState {
        self.ctx.ptt.release_intercom().await
    }

    pub async fn press_live(&self) -> TalkState {
        self.ctx.ptt.press_live().await
    }

    pub async fn release_live(&self) -> TalkState {
        self.ctx.ptt.release_live().await
    }

    /// Put a contributor on or off the broadcast and tell their client
    pub async fn set_client_live(&self, client_id: &str, active: bool) -> TalkState {
        let command = crate::webrtc::CommandMessage::PttLive { active };
        if let Err(e) = self.ctx.registry.send_to(client_id, &command).await {
            tracing::warn!("Could not notify {} of live change: {}", client_id, e);
        }
        self.ctx.ptt.toggle_client_live(client_id, active).await
    }

    pub async fn talk_state(&self) -> TalkState {
        self.ctx.ptt.state().await
    }

    pub async fn set_muted(&self, muted: bool) {
        self.ctx.capture.set_muted(muted).await;
    }

    /// Move the capture to another device (system default when `None`);
    /// returns the name of the device actually opened. Links that were
    /// receive-only get a fresh offer carrying the new track.
    pub async fn set_capture_device(&self, device: Option<String>) -> Result<String, DeviceError> {
        let swapped = self
            .ctx
            .capture
            .swap(device, CaptureConstraints::default())
            .await?;
        for client_id in &swapped.needs_offer {
            if let Err(e) = self.control(client_id, SupervisorCommand::Renegotiate).await {
                tracing::warn!("Could not renegotiate {} after device swap: {}", client_id, e);
            }
        }
        Ok(swapped.track.device_name().to_string())
    }

    pub async fn list_capture_devices(&self) -> Result<Vec<String>, DeviceError> {
        self.ctx.capture.list_devices().await
    }

    pub fn capture_level(&self) -> f32 {
        self.ctx.capture.level()
    }

    /// Post a chat message to every authenticated client
    pub async fn post_chat(&self, text: &str) -> Result<ChatEntry, ChatError> {
        let entry = self.ctx.chat.post(HOST_DISPLAY_NAME, text, now_millis())?;
        if let Some(server) = self.server.lock().await.as_ref() {
            server.directory().broadcast(entry.to_message(), None);
        }
        self.ctx.publish(HostEvent::Chat(entry.clone()));
        Ok(entry)
    }

    pub fn chat_history(&self) -> Vec<ChatEntry> {
        self.ctx.chat.history()
    }

    /// Send a short clip over the command channel, to one client or all.
    /// Returns the clip id.
    pub async fn send_clip(&self, target: Option<&str>, audio: &[u8]) -> Result<String, MediaError> {
        let audio_id = uuid::Uuid::new_v4().to_string();
        let chunks = split_clip(&audio_id, audio, self.ctx.config.clip_chunk_bytes);

        for chunk in &chunks {
            let command = chunk.to_command();
            match target {
                Some(client_id) => self.ctx.registry.send_to(client_id, &command).await?,
                None => {
                    self.ctx.registry.broadcast(&command).await;
                }
            }
        }

        tracing::info!(
            "Sent clip {} ({} bytes, {} chunks)",
            audio_id,
            audio.len(),
            chunks.len()
        );
        Ok(audio_id)
    }

    /// Drop a client's link and offer a new one
    pub async fn renegotiate(&self, client_id: &str) -> Result<(), ServerError> {
        self.control(client_id, SupervisorCommand::Renegotiate).await
    }

    pub async fn kick(&self, client_id: &str) -> Result<(), ServerError> {
        self.control(client_id, SupervisorCommand::Kick).await
    }

    async fn control(&self, client_id: &str, command: SupervisorCommand) -> Result<(), ServerError> {
        let server = self.server.lock().await;
        let server = server.as_ref().ok_or(ServerError::NotRunning)?;
        server.control(client_id, command)
    }

    /// Send a signaling message straight to one client
    pub async fn notify(&self, client_id: &str, message: ServerMessage) -> bool {
        self.server
            .lock()
            .await
            .as_ref()
            .map(|s| s.directory().send_to(client_id, message))
            .unwrap_or(false)
    }
}
