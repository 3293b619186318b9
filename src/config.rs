use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_CONFIG_PATH: &str = "config/babel-chat.json";

/// Tunables for one conversation engine. Every field has a default, so a
/// partial file only overrides what it names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound for translate + audio + persist during a send
    pub send_timeout_secs: u64,
    pub page_size: usize,
    pub pagination_cooldown_ms: u64,
    /// Intermediate language for the retry bridge
    pub bridge_language: String,
    /// Queue depth of the conversation task
    pub command_buffer: usize,
    /// Where archived conversations are written; in-memory when unset
    pub archive_dir: Option<PathBuf>,
    /// Where synthesized audio is written
    pub audio_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            send_timeout_secs: 30,
            page_size: 10,
            pagination_cooldown_ms: 1000,
            bridge_language: "en".to_string(),
            command_buffer: 64,
            archive_dir: None,
            audio_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn pagination_cooldown(&self) -> Duration {
        Duration::from_millis(self.pagination_cooldown_ms)
    }
}

/// Read the config at `path`, falling back to defaults when it is missing
/// or unreadable.
pub fn load_config(path: impl AsRef<Path>) -> EngineConfig {
    let path = path.as_ref();
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<EngineConfig>(&content) {
            Ok(config) => config,
            Err(err) => {
                warn!("Failed to parse config file {}: {err}", path.display());
                EngineConfig::default()
            }
        },
        Err(err) => {
            info!(
                "Config file {} not found ({err}); using defaults",
                path.display()
            );
            EngineConfig::default()
        }
    }
}

pub fn save_config(path: impl AsRef<Path>, config: &EngineConfig) -> std::io::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(path, json)
}
