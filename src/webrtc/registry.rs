use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::media::{MediaError, MediaSession};
use super::signaling::CommandMessage;

fn same_session(a: &Arc<dyn MediaSession>, b: &Arc<dyn MediaSession>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Live media sessions keyed by client id
#[derive(Default)]
pub struct LinkRegistry {
    links: RwLock<HashMap<String, Arc<dyn MediaSession>>>,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, client_id: &str, session: Arc<dyn MediaSession>) {
        self.links.write().insert(client_id.to_string(), session);
    }

    /// Remove the entry only if it still points at `session`
    pub fn remove(&self, client_id: &str, session: &Arc<dyn MediaSession>) -> bool {
        let mut links = self.links.write();
        match links.get(client_id) {
            Some(current) if same_session(current, session) => {
                links.remove(client_id);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<dyn MediaSession>> {
        self.links.read().get(client_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<(String, Arc<dyn MediaSession>)> {
        self.links
            .read()
            .iter()
            .map(|(id, session)| (id.clone(), session.clone()))
            .collect()
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.links.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.links.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.read().is_empty()
    }

    /// Send a command to one client
    pub async fn send_to(&self, client_id: &str, command: &CommandMessage) -> Result<(), MediaError> {
        let session = self.get(client_id).ok_or(MediaError::Closed)?;
        let json = command
            .to_json()
            .map_err(|e| MediaError::Channel(format!("Failed to serialize command: {}", e)))?;
        session.send_command(json).await
    }

    /// Send a command to every link, returns how many accepted it
    pub async fn broadcast(&self, command: &CommandMessage) -> usize {
        let json = match command.to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("Failed to serialize command: {}", e);
                return 0;
            }
        };

        // Collect sessions first to avoid holding lock across await
        let mut delivered = 0;
        for (client_id, session) in self.snapshot() {
            match session.send_command(json.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!("Failed to send command to {}: {}", client_id, e),
            }
        }
        delivered
    }
}
