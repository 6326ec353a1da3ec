use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use thiserror::Error;

use crate::webrtc::ServerMessage;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChatError {
    #[error("Message is empty")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntry {
    pub display_name: String,
    pub text: String,
    pub timestamp: u64,
}

impl ChatEntry {
    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::ChatMessage {
            display_name: self.display_name.clone(),
            text: self.text.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Broadcast-only chat with a bounded history
pub struct ChatRelay {
    history: Mutex<VecDeque<ChatEntry>>,
    limit: usize,
}

impl ChatRelay {
    pub fn new(limit: usize) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(limit)),
            limit,
        }
    }

    /// Record a message; the text is relayed verbatim
    pub fn post(&self, display_name: &str, text: &str, timestamp: u64) -> Result<ChatEntry, ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::Empty);
        }

        let entry = ChatEntry {
            display_name: display_name.to_string(),
            text: text.to_string(),
            timestamp,
        };

        let mut history = self.history.lock();
        history.push_back(entry.clone());
        while history.len() > self.limit {
            history.pop_front();
        }
        Ok(entry)
    }

    pub fn history(&self) -> Vec<ChatEntry> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.history.lock().clear();
    }
}
