//! Push-to-talk arbitration
//!
//! The host is either idle, talking on the private intercom, or live on the
//! broadcast. Going live ducks program audio and tells every client; intercom
//! never touches the broadcast. Remote contributors have their own live flags,
//! independent of the host mode.

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

use crate::audio::{MixBus, SharedCapture};
use crate::host::HostEvent;
use crate::webrtc::{CommandMessage, LinkRegistry, RemoteAudio};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TalkMode {
    Idle,
    IntercomActive,
    LiveActive,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TalkState {
    pub mode: TalkMode,
    /// Fraction of program level removed while ducking
    pub duck_factor: f32,
    pub ducking: bool,
    pub live_client_ids: BTreeSet<String>,
}

impl TalkState {
    fn new(duck_factor: f32) -> Self {
        Self {
            mode: TalkMode::Idle,
            duck_factor,
            ducking: false,
            live_client_ids: BTreeSet::new(),
        }
    }

    pub fn is_live(&self) -> bool {
        self.mode == TalkMode::LiveActive
    }

    pub fn is_intercom(&self) -> bool {
        self.mode == TalkMode::IntercomActive
    }
}

pub struct PttCoordinator {
    state: Mutex<TalkState>,
    capture: SharedCapture,
    registry: Arc<LinkRegistry>,
    mix: Arc<dyn MixBus>,
    events: broadcast::Sender<HostEvent>,
}

impl PttCoordinator {
    pub fn new(
        duck_factor: f32,
        capture: SharedCapture,
        registry: Arc<LinkRegistry>,
        mix: Arc<dyn MixBus>,
        events: broadcast::Sender<HostEvent>,
    ) -> Self {
        Self {
            state: Mutex::new(TalkState::new(duck_factor.clamp(0.0, 1.0))),
            capture,
            registry,
            mix,
            events,
        }
    }

    pub async fn press_intercom(&self) -> TalkState {
        let mut state = self.state.lock().await;
        if state.is_intercom() {
            return state.clone();
        }
        if state.is_live() {
            self.leave_live(&mut state).await;
        }

        state.mode = TalkMode::IntercomActive;
        self.capture.set_talk_enabled(true).await;
        self.registry
            .broadcast(&CommandMessage::PttIntercom { active: true })
            .await;

        tracing::info!("Intercom on");
        self.publish(&state)
    }

    pub async fn release_intercom(&self) -> TalkState {
        let mut state = self.state.lock().await;
        if !state.is_intercom() {
            return state.clone();
        }

        self.leave_intercom(&mut state).await;
        tracing::info!("Intercom off");
        self.publish(&state)
    }

    pub async fn press_live(&self) -> TalkState {
        let mut state = self.state.lock().await;
        if state.is_live() {
            return state.clone();
        }
        if state.is_intercom() {
            self.leave_intercom(&mut state).await;
        }

        state.mode = TalkMode::LiveActive;
        self.capture.set_talk_enabled(true).await;

        state.ducking = true;
        self.mix.set_program_gain(1.0 - state.duck_factor);
        self.registry
            .broadcast(&CommandMessage::Ducking { active: true })
            .await;
        self.registry
            .broadcast(&CommandMessage::HostLive { active: true })
            .await;

        tracing::info!("Host live, program ducked by {:.0}%", state.duck_factor * 100.0);
        self.publish(&state)
    }

    pub async fn release_live(&self) -> TalkState {
        let mut state = self.state.lock().await;
        if !state.is_live() {
            return state.clone();
        }

        self.leave_live(&mut state).await;
        tracing::info!("Host off air");
        self.publish(&state)
    }

    /// Put a remote contributor on or off the broadcast mix.
    /// Leaves the host mode and ducking alone.
    pub async fn toggle_client_live(&self, client_id: &str, active: bool) -> TalkState {
        let mut state = self.state.lock().await;
        self.mix
            .set_contributor_gain(client_id, if active { 1.0 } else { 0.0 });

        let changed = if active {
            state.live_client_ids.insert(client_id.to_string())
        } else {
            state.live_client_ids.remove(client_id)
        };

        if !changed {
            return state.clone();
        }
        tracing::info!("Client {} live: {}", client_id, active);
        self.publish(&state)
    }

    /// Route a contributor's inbound track into the mix, silent unless the
    /// contributor is already live. Holds the talk lock so a concurrent
    /// toggle lands after the attach.
    pub async fn attach_contributor(&self, client_id: &str, audio: RemoteAudio) {
        let state = self.state.lock().await;
        let live = state.live_client_ids.contains(client_id);
        self.mix
            .attach_contributor(client_id, audio, if live { 1.0 } else { 0.0 });
        tracing::debug!("Contributor {} joined the mix (live: {})", client_id, live);
    }

    pub async fn client_disconnected(&self, client_id: &str) {
        let mut state = self.state.lock().await;
        if state.live_client_ids.remove(client_id) {
            self.publish(&state);
        }
    }

    pub async fn state(&self) -> TalkState {
        self.state.lock().await.clone()
    }

    async fn leave_intercom(&self, state: &mut TalkState) {
        state.mode = TalkMode::Idle;
        self.capture.set_talk_enabled(false).await;
        self.registry
            .broadcast(&CommandMessage::PttIntercom { active: false })
            .await;
    }

    async fn leave_live(&self, state: &mut TalkState) {
        state.mode = TalkMode::Idle;
        state.ducking = false;
        self.mix.set_program_gain(1.0);
        self.registry
            .broadcast(&CommandMessage::Ducking { active: false })
            .await;
        self.registry
            .broadcast(&CommandMessage::HostLive { active: false })
            .await;
        self.capture.set_talk_enabled(false).await;
    }

    fn publish(&self, state: &TalkState) -> TalkState {
        // No subscribers is fine
        let _ = self.events.send(HostEvent::TalkStateChanged(state.clone()));
        state.clone()
    }
}
