pub mod audio;
pub mod chat;
pub mod config;
pub mod host;
pub mod ptt;
pub mod relay;
pub mod server;
pub mod session;
pub mod webrtc;

#[cfg(test)]
mod testing;

use std::time::{SystemTime, UNIX_EPOCH};

pub use audio::{AudioMixer, CpalBackend, MixBus, SharedCapture};
pub use chat::{ChatEntry, ChatRelay};
pub use config::{load_config, save_config, HostConfig};
pub use host::{Host, HostContext, HostEvent, PttChannel, StartReport};
pub use ptt::{PttCoordinator, TalkMode, TalkState};
pub use server::{ServerError, SignalingServer, SupervisorCommand};
pub use session::{Client, Directory, Session};

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
