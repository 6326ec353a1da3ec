//! WebSocket signaling server
//!
//! Binds the first free port of a small range and runs one task per client.
//! Each task owns that client's `PeerSupervisor` and handles, in arrival
//! order, socket frames, media events for its link and host commands.

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::config::PORT_SCAN_SPAN;
use crate::host::{HostContext, HostEvent};
use crate::session::{ClientSender, Directory, Session};
use crate::webrtc::{ClientMessage, PeerSupervisor, ProtocolError, ServerMessage};
use crate::now_millis;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Server not running")]
    NotRunning,
    #[error("Already hosting")]
    AlreadyHosting,
    #[error("No free port between {first} and {last}")]
    NoFreePort { first: u16, last: u16 },
    #[error("Failed to bind: {0}")]
    Bind(#[from] std::io::Error),
    #[error("Unknown client {0}")]
    UnknownClient(String),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("WebSocket handshake failed: {0}")]
    Handshake(tokio_tungstenite::tungstenite::Error),
    #[error("Socket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Host-side requests delivered to a client task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorCommand {
    Renegotiate,
    Kick,
}

type Controls = Arc<RwLock<HashMap<String, mpsc::UnboundedSender<SupervisorCommand>>>>;

/// Bind the first free port in `[port, port + PORT_SCAN_SPAN]`
pub async fn bind_first_free(port: u16) -> Result<TcpListener, ServerError> {
    let last = port.saturating_add(PORT_SCAN_SPAN);
    for candidate in port..=last {
        match TcpListener::bind(("0.0.0.0", candidate)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => tracing::debug!("Port {} unavailable: {}", candidate, e),
        }
    }
    Err(ServerError::NoFreePort { first: port, last })
}

pub struct SignalingServer {
    directory: Arc<Directory>,
    controls: Controls,
    shutdown_tx: broadcast::Sender<()>,
    accept_task: JoinHandle<()>,
}

impl SignalingServer {
    pub async fn start(
        ctx: Arc<HostContext>,
        port: u16,
        session_code: String,
    ) -> Result<Self, ServerError> {
        let listener = bind_first_free(port).await?;
        let bound_port = listener.local_addr()?.port();

        let directory = Arc::new(Directory::new(Session::new(session_code, bound_port)));
        let controls: Controls = Arc::new(RwLock::new(HashMap::new()));
        let (shutdown_tx, _) = broadcast::channel(1);

        tracing::info!("Signaling server listening on port {}", bound_port);

        let accept_task = tokio::spawn(accept_loop(
            listener,
            ctx,
            directory.clone(),
            controls.clone(),
            shutdown_tx.clone(),
        ));

        Ok(Self {
            directory,
            controls,
            shutdown_tx,
            accept_task,
        })
    }

    pub fn session(&self) -> &Session {
        self.directory.session()
    }

    pub fn directory(&self) -> Arc<Directory> {
        self.directory.clone()
    }

    pub fn control(&self, client_id: &str, command: SupervisorCommand) -> Result<(), ServerError> {
        self.controls
            .read()
            .get(client_id)
            .and_then(|tx| tx.send(command).ok())
            .ok_or_else(|| ServerError::UnknownClient(client_id.to_string()))
    }

    /// Stop accepting and close every client, waiting for their cleanup
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.accept_task.await {
            tracing::error!("Accept loop ended abnormally: {}", e);
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<HostContext>,
    directory: Arc<Directory>,
    controls: Controls,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut clients: Vec<JoinHandle<()>> = Vec::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    clients.retain(|task| !task.is_finished());
                    let ctx = ctx.clone();
                    let directory = directory.clone();
                    let controls = controls.clone();
                    let shutdown_rx = shutdown_tx.subscribe();
                    clients.push(tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(stream, addr, ctx, directory, controls, shutdown_rx).await
                        {
                            tracing::warn!("Connection from {} ended: {}", addr, e);
                        }
                    }));
                }
                Err(e) => tracing::error!("Failed to accept connection: {}", e),
            },
            _ = shutdown_rx.recv() => break,
        }
    }

    for task in clients {
        let _ = task.await;
    }
    tracing::info!("Signaling server stopped");
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<HostContext>,
    directory: Arc<Directory>,
    controls: Controls,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), TransportError> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(TransportError::Handshake)?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let json = match message.to_json() {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("Failed to encode message: {}", e);
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let client_id = directory.register(addr, out_tx.clone());
    let (command_tx, mut command_rx) = mpsc::unbounded_channel();
    controls.write().insert(client_id.clone(), command_tx);

    let (link_tx, mut link_rx) = mpsc::unbounded_channel();
    let mut task = ClientTask {
        supervisor: PeerSupervisor::new(&client_id, ctx.clone(), out_tx.clone(), link_tx),
        client_id,
        ctx,
        directory,
        outbound: out_tx,
    };

    let result = loop {
        tokio::select! {
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => task.handle_text(&text).await,
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(TransportError::Socket(e)),
            },
            Some(event) = link_rx.recv() => task.supervisor.on_media_event(event).await,
            Some(command) = command_rx.recv() => match command {
                SupervisorCommand::Renegotiate => {
                    if let Err(e) = task.supervisor.renegotiate().await {
                        tracing::warn!("Renegotiation with {} failed: {}", task.client_id, e);
                    }
                }
                SupervisorCommand::Kick => {
                    tracing::info!("Disconnecting {}", task.client_id);
                    break Ok(());
                }
            },
            _ = shutdown_rx.recv() => break Ok(()),
        }
    };

    controls.write().remove(&task.client_id);
    task.finish().await;
    // The writer drains once every sender is gone
    let _ = writer.await;
    result
}

/// Protocol handling for one connected socket
struct ClientTask {
    client_id: String,
    ctx: Arc<HostContext>,
    directory: Arc<Directory>,
    supervisor: PeerSupervisor,
    outbound: ClientSender,
}

impl ClientTask {
    fn reply(&self, message: ServerMessage) {
        let _ = self.outbound.send(message);
    }

    async fn handle_text(&mut self, text: &str) {
        match ClientMessage::parse(text) {
            Ok(message) => self.handle_message(message).await,
            Err(e) => {
                if !matches!(e, ProtocolError::UnknownType(_)) {
                    tracing::warn!("Bad message from {}: {}", self.client_id, e);
                }
                self.reply(ServerMessage::error(e.to_string()));
            }
        }
    }

    async fn handle_message(&mut self, message: ClientMessage) {
        let kind = message.kind();
        match message {
            ClientMessage::Authenticate {
                display_name,
                session_code,
            } => {
                // The directory replies to the client itself
                if let Ok((client, true)) =
                    self.directory
                        .authenticate(&self.client_id, &session_code, &display_name)
                {
                    self.ctx.publish(HostEvent::ClientJoined(client));
                }
            }
            ClientMessage::Ping => self.reply(ServerMessage::Pong {
                timestamp: now_millis(),
            }),
            _ if !self.directory.is_authenticated(&self.client_id) => {
                tracing::debug!("Rejecting {} from unauthenticated {}", kind, self.client_id);
                self.reply(ServerMessage::error("Not authenticated"));
            }
            ClientMessage::Offer { sdp } => {
                if let Err(e) = self.supervisor.on_offer(sdp).await {
                    tracing::warn!("Offer from {} failed: {}", self.client_id, e);
                }
            }
            ClientMessage::Answer { sdp } => {
                if let Err(e) = self.supervisor.on_answer(sdp).await {
                    tracing::warn!("Answer from {} failed: {}", self.client_id, e);
                }
            }
            ClientMessage::IceCandidate { candidate } => {
                self.supervisor.on_ice_candidate(candidate).await;
            }
            ClientMessage::ChatMessage { text } => self.on_chat(&text),
            ClientMessage::AudioLevel { level } => {
                self.directory.set_audio_level(&self.client_id, level);
                self.ctx.publish(HostEvent::ClientLevel {
                    client_id: self.client_id.clone(),
                    level: level.clamp(0.0, 1.0),
                });
            }
            ClientMessage::Unknown => {
                self.reply(ServerMessage::error(format!("Unknown message type: {}", kind)));
            }
        }
    }

    fn on_chat(&self, text: &str) {
        let display_name = self
            .directory
            .get(&self.client_id)
            .map(|c| c.display_name)
            .unwrap_or_default();

        match self.ctx.chat.post(&display_name, text, now_millis()) {
            Ok(entry) => {
                self.directory
                    .broadcast(entry.to_message(), Some(self.client_id.as_str()));
                self.ctx.publish(HostEvent::Chat(entry));
            }
            Err(e) => self.reply(ServerMessage::error(e.to_string())),
        }
    }

    /// Tear the client down: link first, then presence, then talk state
    async fn finish(mut self) {
        self.supervisor.teardown().await;

        if let Some(client) = self.directory.disconnect(&self.client_id) {
            if client.authenticated {
                self.ctx.publish(HostEvent::ClientLeft {
                    client_id: client.client_id,
                    display_name: client.display_name,
                });
            }
        }
        self.ctx.ptt.client_disconnected(&self.client_id).await;
        self.ctx.relay.lock().drop_client(&self.client_id);
    }
}
