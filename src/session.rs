use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::now_millis;
use crate::webrtc::ServerMessage;

/// Outbound queue of one client socket
pub type ClientSender = mpsc::UnboundedSender<ServerMessage>;

const CODE_CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Length of generated session codes
pub const SESSION_CODE_LEN: usize = 8;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    #[error("Invalid session code")]
    InvalidCode,
    #[error("Unknown client {0}")]
    UnknownClient(String),
}

fn random_code(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..CODE_CHARSET.len());
            CODE_CHARSET[idx] as char
        })
        .collect()
}

/// Generate an 8-character session code
pub fn generate_session_code() -> String {
    random_code(SESSION_CODE_LEN)
}

fn generate_display_name() -> String {
    format!("Guest-{}", random_code(4))
}

/// One running host session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_code: String,
    pub bound_port: u16,
    pub created_at: u64,
}

impl Session {
    pub fn new(session_code: String, bound_port: u16) -> Self {
        Self {
            session_code,
            bound_port,
            created_at: now_millis(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub client_id: String,
    pub display_name: String,
    pub remote_address: SocketAddr,
    pub authenticated: bool,
    pub connected_at: u64,
    pub audio_level: f32,
}

struct ClientEntry {
    info: Client,
    sender: ClientSender,
}

/// Connected clients of a session
pub struct Directory {
    session: Session,
    clients: RwLock<HashMap<String, ClientEntry>>,
}

impl Directory {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Track a freshly connected socket and greet it
    pub fn register(&self, remote_address: SocketAddr, sender: ClientSender) -> String {
        let client_id = Uuid::new_v4().to_string();
        let now = now_millis();

        let _ = sender.send(ServerMessage::Welcome {
            client_id: client_id.clone(),
            server_time: now,
        });

        self.clients.write().insert(
            client_id.clone(),
            ClientEntry {
                info: Client {
                    client_id: client_id.clone(),
                    display_name: String::new(),
                    remote_address,
                    authenticated: false,
                    connected_at: now,
                    audio_level: 0.0,
                },
                sender,
            },
        );

        tracing::info!("Client {} connected from {}", client_id, remote_address);
        client_id
    }

    /// Check the submitted code and reply to the client.
    ///
    /// Returns the client and whether it just became authenticated. Peers are
    /// told about the client only on its first successful authentication.
    pub fn authenticate(
        &self,
        client_id: &str,
        submitted_code: &str,
        display_name: &str,
    ) -> Result<(Client, bool), AuthError> {
        let (client, newly) = {
            let mut clients = self.clients.write();
            let entry = clients
                .get_mut(client_id)
                .ok_or_else(|| AuthError::UnknownClient(client_id.to_string()))?;

            if submitted_code != self.session.session_code {
                let _ = entry.sender.send(ServerMessage::AuthError {
                    message: AuthError::InvalidCode.to_string(),
                });
                tracing::warn!("Client {} failed authentication", client_id);
                return Err(AuthError::InvalidCode);
            }

            let name = display_name.trim();
            if !name.is_empty() {
                entry.info.display_name = name.to_string();
            } else if entry.info.display_name.is_empty() {
                entry.info.display_name = generate_display_name();
            }

            let newly = !entry.info.authenticated;
            entry.info.authenticated = true;

            let _ = entry.sender.send(ServerMessage::Authenticated {
                client_id: client_id.to_string(),
                display_name: entry.info.display_name.clone(),
            });
            (entry.info.clone(), newly)
        };

        if newly {
            tracing::info!("Client {} authenticated as {}", client_id, client.display_name);
            self.broadcast(
                ServerMessage::PeerConnected {
                    client_id: client.client_id.clone(),
                    display_name: client.display_name.clone(),
                },
                Some(client_id),
            );
        }

        Ok((client, newly))
    }

    /// Forget a client, telling peers if it had joined
    pub fn disconnect(&self, client_id: &str) -> Option<Client> {
        let entry = self.clients.write().remove(client_id)?;
        tracing::info!("Client {} disconnected", client_id);

        if entry.info.authenticated {
            self.broadcast(
                ServerMessage::PeerDisconnected {
                    client_id: entry.info.client_id.clone(),
                    display_name: entry.info.display_name.clone(),
                },
                None,
            );
        }
        Some(entry.info)
    }

    /// Send to every authenticated client except `except`
    pub fn broadcast(&self, message: ServerMessage, except: Option<&str>) -> usize {
        let clients = self.clients.read();
        clients
            .values()
            .filter(|entry| entry.info.authenticated)
            .filter(|entry| except != Some(entry.info.client_id.as_str()))
            .filter(|entry| entry.sender.send(message.clone()).is_ok())
            .count()
    }

    pub fn send_to(&self, client_id: &str, message: ServerMessage) -> bool {
        self.clients
            .read()
            .get(client_id)
            .map(|entry| entry.sender.send(message).is_ok())
            .unwrap_or(false)
    }

    pub fn get(&self, client_id: &str) -> Option<Client> {
        self.clients.read().get(client_id).map(|e| e.info.clone())
    }

    pub fn is_authenticated(&self, client_id: &str) -> bool {
        self.clients
            .read()
            .get(client_id)
            .map(|e| e.info.authenticated)
            .unwrap_or(false)
    }

    pub fn clients(&self) -> Vec<Client> {
        let mut clients: Vec<Client> = self.clients.read().values().map(|e| e.info.clone()).collect();
        clients.sort_by_key(|c| c.connected_at);
        clients
    }

    pub fn set_audio_level(&self, client_id: &str, level: f32) {
        if let Some(entry) = self.clients.write().get_mut(client_id) {
            entry.info.audio_level = level.clamp(0.0, 1.0);
        }
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}
