use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

/// First port tried when none is configured
pub const DEFAULT_PORT: u16 = 8765;
/// Ports scanned above the requested one before giving up
pub const PORT_SCAN_SPAN: u16 = 10;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

/// Host configuration, persisted as JSON next to the other app settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HostConfig {
    /// Requested signaling port (first free in `[port, port + 10]` wins)
    pub port: u16,
    /// Fixed session code, generated on start when absent
    pub session_code: Option<String>,
    /// How much program audio is lowered while the host is live (0-100)
    pub duck_percent: u8,
    /// STUN servers used for connectivity probing
    pub stun_servers: Vec<String>,
    /// Chat entries kept in memory
    pub chat_history_limit: usize,
    /// Raw bytes per `pttLiveAudioChunk` message
    pub clip_chunk_bytes: usize,
    /// Largest clip accepted from a contributor
    pub max_clip_bytes: usize,
    /// Incomplete clip assemblies older than this are dropped
    pub assembly_ttl_secs: u64,
    /// Capture level sampling period
    pub meter_interval_ms: u64,
    /// Capture device name, system default when absent
    pub capture_device: Option<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            session_code: None,
            duck_percent: 60,
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_owned(),
                "stun:stun.cloudflare.com:3478".to_owned(),
            ],
            chat_history_limit: 50,
            clip_chunk_bytes: 16 * 1024,
            max_clip_bytes: 8 * 1024 * 1024,
            assembly_ttl_secs: 30,
            meter_interval_ms: 100,
            capture_device: None,
        }
    }
}

impl HostConfig {
    /// Fraction of the program level removed while ducking
    pub fn duck_factor(&self) -> f32 {
        f32::from(self.duck_percent.min(100)) / 100.0
    }

    /// Apply `HYDROWCAST_PORT` / `HYDROWCAST_SESSION_CODE` overrides
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(port) = std::env::var("HYDROWCAST_PORT") {
            self.port = port
                .parse()
                .map_err(|_| ConfigError::InvalidValue("HYDROWCAST_PORT", port.clone()))?;
        }
        if let Ok(code) = std::env::var("HYDROWCAST_SESSION_CODE") {
            if !code.trim().is_empty() {
                self.session_code = Some(code.trim().to_string());
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.duck_percent > 100 {
            return Err(ConfigError::InvalidValue(
                "duck_percent",
                self.duck_percent.to_string(),
            ));
        }
        if self.clip_chunk_bytes == 0 {
            return Err(ConfigError::InvalidValue("clip_chunk_bytes", "0".to_string()));
        }
        if self.max_clip_bytes == 0 {
            return Err(ConfigError::InvalidValue("max_clip_bytes", "0".to_string()));
        }
        if self.chat_history_limit == 0 {
            return Err(ConfigError::InvalidValue("chat_history_limit", "0".to_string()));
        }
        Ok(())
    }
}

/// Path to the config file
pub fn config_path() -> PathBuf {
    let config_dir = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hydrowcast");
    fs::create_dir_all(&config_dir).ok();
    config_dir.join("host.json")
}

/// Load the config, falling back to defaults when the file doesn't exist
pub fn load_config() -> Result<HostConfig, ConfigError> {
    let path = config_path();
    if !path.exists() {
        return Ok(HostConfig::default());
    }
    let content = fs::read_to_string(&path)?;
    let config: HostConfig = serde_json::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Save the config to disk
pub fn save_config(config: &HostConfig) -> Result<(), ConfigError> {
    let content = serde_json::to_string_pretty(config)?;
    fs::write(config_path(), content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: HostConfig = serde_json::from_str(r#"{"port": 9000, "duck_percent": 80}"#).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.chat_history_limit, 50);
        assert!((config.duck_factor() - 0.8).abs() < f32::EPSILON);
    }

    #[test]
    fn test_validate_rejects_zero_chunk_size() {
        let config = HostConfig {
            clip_chunk_bytes: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(HostConfig::default().validate().is_ok());
    }
}
