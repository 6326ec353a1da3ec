//! Per-client negotiation
//!
//! A `PeerSupervisor` lives inside its client's task, so socket messages and
//! media callbacks for one client are handled one at a time, in arrival order.
//! Each link it creates gets a new generation; callbacks carrying an older
//! generation belong to a link that was already replaced and are dropped.

use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use super::media::{
    LinkConnectionState, LinkEvent, LinkEventSender, LinkEvents, MediaError, MediaEvent,
    MediaSession, SessionDescription,
};
use super::signaling::{CommandMessage, IceCandidate, ServerMessage};
use crate::host::{HostContext, HostEvent, PttChannel};
use crate::relay::{AudioChunk, IngestOutcome};
use crate::session::ClientSender;

/// Candidates held back while no remote description is set
const MAX_PENDING_CANDIDATES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    New,
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
    Closed,
}

impl SignalingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::HaveLocalOffer => "have-local-offer",
            Self::HaveRemoteOffer => "have-remote-offer",
            Self::Stable => "stable",
            Self::Closed => "closed",
        }
    }

    /// Validate a move to `next`
    pub fn transition(self, next: SignalingState) -> Result<SignalingState, SignalingStateError> {
        use SignalingState::*;
        match (self, next) {
            (_, Closed) => Ok(Closed),
            (New, HaveLocalOffer)
            | (New, HaveRemoteOffer)
            | (HaveLocalOffer, Stable)
            | (HaveRemoteOffer, Stable) => Ok(next),
            _ => Err(SignalingStateError::Illegal { from: self, to: next }),
        }
    }
}

impl std::fmt::Display for SignalingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SignalingStateError {
    #[error("Illegal signaling transition {from} -> {to}")]
    Illegal {
        from: SignalingState,
        to: SignalingState,
    },
    #[error("No link")]
    NoLink,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    #[error(transparent)]
    State(#[from] SignalingStateError),
    #[error(transparent)]
    Media(#[from] MediaError),
}

struct PeerLink {
    session: Arc<dyn MediaSession>,
    generation: u64,
    state: SignalingState,
    connection_state: LinkConnectionState,
    command_channel_open: bool,
    remote_description_set: bool,
}

/// Owns the media link to one remote client
pub struct PeerSupervisor {
    client_id: String,
    ctx: Arc<HostContext>,
    outbound: ClientSender,
    events_tx: LinkEventSender,
    link: Option<PeerLink>,
    next_generation: u64,
    /// Candidates received before the remote description
    pending_candidates: Vec<IceCandidate>,
}

impl PeerSupervisor {
    pub fn new(
        client_id: &str,
        ctx: Arc<HostContext>,
        outbound: ClientSender,
        events_tx: LinkEventSender,
    ) -> Self {
        Self {
            client_id: client_id.to_string(),
            ctx,
            outbound,
            events_tx,
            link: None,
            next_generation: 0,
            pending_candidates: Vec::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> Option<SignalingState> {
        self.link.as_ref().map(|link| link.state)
    }

    pub fn generation(&self) -> Option<u64> {
        self.link.as_ref().map(|link| link.generation)
    }

    pub fn connection_state(&self) -> Option<LinkConnectionState> {
        self.link.as_ref().map(|link| link.connection_state)
    }

    pub fn command_channel_open(&self) -> bool {
        self.link
            .as_ref()
            .map(|link| link.command_channel_open)
            .unwrap_or(false)
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Remote offer from the client
    pub async fn on_offer(&mut self, sdp: String) -> Result<(), LinkError> {
        match self.state() {
            Some(SignalingState::Stable) => {
                tracing::debug!("Ignoring offer from {}: link already stable", self.client_id);
                return Ok(());
            }
            Some(SignalingState::HaveRemoteOffer) => {
                tracing::debug!("Ignoring offer from {}: negotiation in progress", self.client_id);
                return Ok(());
            }
            Some(SignalingState::HaveLocalOffer) => {
                // Both sides offered; start over on a fresh link
                tracing::warn!("Offer collision with {}, recreating link", self.client_id);
                self.reset().await?;
            }
            Some(SignalingState::New) => {}
            Some(SignalingState::Closed) | None => self.create_link().await?,
        }

        let session = self.session()?;
        session
            .set_remote_description(SessionDescription::offer(sdp))
            .await?;
        self.transition(SignalingState::HaveRemoteOffer)?;
        self.remote_description_applied().await;

        // Attach after the remote description so the track lands on the
        // transceiver the offer created
        self.ctx.capture.attach(&self.client_id, session.clone()).await?;

        let answer = match session.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::error!("Failed to answer {}: {}", self.client_id, e);
                return Err(e.into());
            }
        };
        self.transition(SignalingState::Stable)?;
        self.send(ServerMessage::Answer { sdp: answer.sdp });

        tracing::info!("Answered offer from {}", self.client_id);
        Ok(())
    }

    /// Remote answer to an offer we sent
    pub async fn on_answer(&mut self, sdp: String) -> Result<(), LinkError> {
        if self.state() != Some(SignalingState::HaveLocalOffer) {
            tracing::debug!(
                "Ignoring answer from {} in state {:?}",
                self.client_id,
                self.state()
            );
            return Ok(());
        }

        let session = self.session()?;
        session
            .set_remote_description(SessionDescription::answer(sdp))
            .await?;
        self.transition(SignalingState::Stable)?;
        self.remote_description_applied().await;

        tracing::info!("Link to {} negotiated", self.client_id);
        Ok(())
    }

    pub async fn on_ice_candidate(&mut self, candidate: IceCandidate) {
        let ready = self
            .link
            .as_ref()
            .filter(|link| link.state != SignalingState::Closed && link.remote_description_set)
            .map(|link| link.session.clone());

        match ready {
            Some(session) => {
                if let Err(e) = session.add_ice_candidate(candidate).await {
                    tracing::warn!("Failed to add candidate from {}: {}", self.client_id, e);
                }
            }
            None if self.pending_candidates.len() >= MAX_PENDING_CANDIDATES => {
                tracing::warn!(
                    "Dropping candidate from {}: {} already queued",
                    self.client_id,
                    MAX_PENDING_CANDIDATES
                );
            }
            None => self.pending_candidates.push(candidate),
        }
    }

    /// Host-initiated negotiation; the link must be fresh
    pub async fn create_offer(&mut self) -> Result<(), LinkError> {
        match self.state() {
            None | Some(SignalingState::Closed) => self.create_link().await?,
            Some(SignalingState::New) => {}
            Some(other) => {
                return Err(SignalingStateError::Illegal {
                    from: other,
                    to: SignalingState::HaveLocalOffer,
                }
                .into())
            }
        }

        let session = self.session()?;
        self.ctx.capture.attach(&self.client_id, session.clone()).await?;
        session.open_command_channel().await?;

        let offer = session.create_offer().await?;
        self.transition(SignalingState::HaveLocalOffer)?;
        self.send(ServerMessage::Offer { sdp: offer.sdp });

        tracing::info!("Sent offer to {}", self.client_id);
        Ok(())
    }

    /// Drop the current link and offer a fresh one
    pub async fn renegotiate(&mut self) -> Result<(), LinkError> {
        self.reset().await?;
        self.create_offer().await
    }

    pub async fn on_media_event(&mut self, event: LinkEvent) {
        let current = self
            .link
            .as_ref()
            .filter(|link| link.state != SignalingState::Closed)
            .map(|link| link.generation);
        if current != Some(event.generation) {
            tracing::debug!(
                "Dropping event from stale link {} of {}",
                event.generation,
                self.client_id
            );
            return;
        }

        match event.event {
            MediaEvent::LocalCandidate(candidate) => {
                self.send(ServerMessage::IceCandidate { candidate });
            }
            MediaEvent::ConnectionState(state) => self.on_connection_state(state).await,
            MediaEvent::RemoteTrack(audio) => {
                self.ctx.ptt.attach_contributor(&self.client_id, audio).await;
            }
            MediaEvent::CommandChannelOpen => {
                if let Some(link) = self.link.as_mut() {
                    link.command_channel_open = true;
                }
                self.push_talk_state().await;
            }
            MediaEvent::CommandChannelClosed => {
                if let Some(link) = self.link.as_mut() {
                    link.command_channel_open = false;
                }
            }
            MediaEvent::CommandMessage(text) => self.on_command(&text).await,
        }
    }

    /// Release the link; safe to call repeatedly
    pub async fn teardown(&mut self) {
        self.close_link().await;
        self.pending_candidates.clear();
    }

    async fn on_connection_state(&mut self, state: LinkConnectionState) {
        if let Some(link) = self.link.as_mut() {
            link.connection_state = state;
        }
        tracing::info!("Link to {} is {:?}", self.client_id, state);
        self.ctx.publish(HostEvent::LinkState {
            client_id: self.client_id.clone(),
            state,
        });

        if matches!(state, LinkConnectionState::Failed | LinkConnectionState::Closed) {
            self.close_link().await;
        }
    }

    async fn on_command(&mut self, text: &str) {
        let command = match CommandMessage::parse(text) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!("Bad command from {}: {}", self.client_id, e);
                return;
            }
        };

        match command {
            CommandMessage::PttLiveAudioChunk { .. } => self.on_audio_chunk(&command),
            CommandMessage::PttLive { active } => {
                self.ctx.ptt.toggle_client_live(&self.client_id, active).await;
                self.ctx.publish(HostEvent::ClientPtt {
                    client_id: self.client_id.clone(),
                    channel: PttChannel::Live,
                    active,
                });
            }
            CommandMessage::PttIntercom { active } => {
                self.ctx.publish(HostEvent::ClientPtt {
                    client_id: self.client_id.clone(),
                    channel: PttChannel::Intercom,
                    active,
                });
            }
            CommandMessage::RequestHostLiveState => {
                let active = self.ctx.ptt.state().await.is_live();
                self.send_command(CommandMessage::HostLiveState { active }).await;
            }
            CommandMessage::RequestHostIntercomState => {
                let active = self.ctx.ptt.state().await.is_intercom();
                self.send_command(CommandMessage::HostIntercomState { active })
                    .await;
            }
            other => tracing::debug!("Ignoring command {:?} from {}", other, self.client_id),
        }
    }

    fn on_audio_chunk(&self, command: &CommandMessage) {
        let chunk = match AudioChunk::from_command(command) {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Dropping audio chunk from {}: {}", self.client_id, e);
                return;
            }
        };

        let audio_id = chunk.audio_id.clone();
        let outcome = self
            .ctx
            .relay
            .lock()
            .ingest(&self.client_id, chunk, Instant::now());
        match outcome {
            Ok(IngestOutcome::Complete(audio)) => {
                self.ctx.publish(HostEvent::ClipReceived {
                    client_id: self.client_id.clone(),
                    audio_id,
                    audio,
                });
            }
            Ok(IngestOutcome::Pending { received, total }) => {
                tracing::debug!("Clip {}: {}/{} chunks", audio_id, received, total);
            }
            Ok(IngestOutcome::Duplicate) => {}
            Err(e) => tracing::warn!("Dropping audio chunk from {}: {}", self.client_id, e),
        }
    }

    /// Tell a freshly connected client whether the host is on air
    async fn push_talk_state(&self) {
        let talk = self.ctx.ptt.state().await;
        self.send_command(CommandMessage::Ducking {
            active: talk.ducking,
        })
        .await;
        self.send_command(CommandMessage::HostLive {
            active: talk.is_live(),
        })
        .await;
    }

    async fn send_command(&self, command: CommandMessage) {
        let Some(session) = self.link.as_ref().map(|link| link.session.clone()) else {
            return;
        };
        let result = match command.to_json() {
            Ok(json) => session.send_command(json).await,
            Err(e) => Err(MediaError::Channel(e.to_string())),
        };
        if let Err(e) = result {
            tracing::warn!("Failed to send command to {}: {}", self.client_id, e);
        }
    }

    async fn create_link(&mut self) -> Result<(), MediaError> {
        self.next_generation += 1;
        let generation = self.next_generation;
        let events = LinkEvents::new(generation, self.events_tx.clone());
        let session = self.ctx.factory.create_session(&self.client_id, events).await?;

        tracing::debug!("Created link {} for {}", generation, self.client_id);
        self.link = Some(PeerLink {
            session,
            generation,
            state: SignalingState::New,
            connection_state: LinkConnectionState::New,
            command_channel_open: false,
            remote_description_set: false,
        });
        Ok(())
    }

    /// Replace the link with a fresh one in state `new`
    async fn reset(&mut self) -> Result<(), MediaError> {
        self.close_link().await;
        self.pending_candidates.clear();
        self.create_link().await
    }

    async fn close_link(&mut self) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        if link.state == SignalingState::Closed {
            return;
        }
        link.state = SignalingState::Closed;
        link.command_channel_open = false;
        let session = link.session.clone();

        self.ctx.capture.detach(&self.client_id, &session);
        self.ctx.mix.detach_contributor(&self.client_id);
        if let Err(e) = session.close().await {
            tracing::warn!("Error closing link to {}: {}", self.client_id, e);
        }
        tracing::info!("Link to {} closed", self.client_id);
    }

    async fn remote_description_applied(&mut self) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        link.remote_description_set = true;
        let session = link.session.clone();

        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = session.add_ice_candidate(candidate).await {
                tracing::warn!("Failed to add queued candidate from {}: {}", self.client_id, e);
            }
        }
    }

    fn session(&self) -> Result<Arc<dyn MediaSession>, SignalingStateError> {
        self.link
            .as_ref()
            .map(|link| link.session.clone())
            .ok_or(SignalingStateError::NoLink)
    }

    fn transition(&mut self, next: SignalingState) -> Result<(), SignalingStateError> {
        let link = self.link.as_mut().ok_or(SignalingStateError::NoLink)?;
        link.state = link.state.transition(next)?;
        Ok(())
    }

    fn send(&self, message: ServerMessage) {
        if self.outbound.send(message).is_err() {
            tracing::debug!("Socket for {} already closed", self.client_id);
        }
    }
}
