use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration loaded from `~/.filament/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
    #[serde(default)]
    pub webhooks: WebhookConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

impl Config {
    /// Load config from `~/.filament/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(cfg)
    }

    /// Serialize config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".filament")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_instance_name")]
    pub instance_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON logs instead of the human-readable format.
    #[serde(default)]
    pub log_json: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

fn default_instance_name() -> String {
    "filament".into()
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Per-subscriber bounded buffer; overflow drops for that subscriber only.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    /// Ring-buffered history retained for `recent()` queries.
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: default_subscriber_buffer(),
            history_size: default_history_size(),
        }
    }
}

fn default_subscriber_buffer() -> usize {
    64
}

fn default_history_size() -> usize {
    1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Capacity of the coalesced work channel; duplicate project markers
    /// beyond this are dropped.
    #[serde(default = "default_work_channel_capacity")]
    pub work_channel_capacity: usize,
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            work_channel_capacity: default_work_channel_capacity(),
            tick_interval_secs: default_tick_interval_secs(),
        }
    }
}

fn default_work_channel_capacity() -> usize {
    256
}

fn default_tick_interval_secs() -> u64 {
    5
}

/// One named LLM backend, registered at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub id: String,
    pub name: String,
    /// `anthropic`, `openai` or `local`.
    pub kind: String,
    pub endpoint: Option<String>,
    pub model: String,
    /// Name of the environment variable holding the API key; the registry
    /// stores only this reference, never the key itself.
    pub secret_env: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Per-source HMAC secrets; sources without an entry skip verification.
    #[serde(default)]
    pub secrets: std::collections::BTreeMap<String, String>,
    /// Create a pr-review bead when a pr_opened event arrives.
    #[serde(default)]
    pub create_review_beads: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Comment-line heartbeat interval for SSE streams.
    #[serde(default = "default_sse_keepalive_secs")]
    pub sse_keepalive_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            sse_keepalive_secs: default_sse_keepalive_secs(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:7300".into()
}

fn default_sse_keepalive_secs() -> u64 {
    15
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let cfg = Config::default();
        assert_eq!(cfg.bus.subscriber_buffer, 64);
        assert_eq!(cfg.bus.history_size, 1024);
        assert_eq!(cfg.bridge.bind_addr, "127.0.0.1:7300");
        assert!(cfg.providers.is_empty());
    }

    #[test]
    fn roundtrip_through_toml() {
        let cfg = Config::default();
        let text = cfg.to_toml().unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.general.instance_name, "filament");
        assert_eq!(back.dispatcher.work_channel_capacity, 256);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let text = r#"
            [general]
            instance_name = "filament-dev"

            [[providers]]
            id = "anthropic-main"
            name = "Anthropic"
            kind = "anthropic"
            model = "claude-sonnet-4-20250514"
            secret_env = "ANTHROPIC_API_KEY"
        "#;
        let cfg: Config = toml::from_str(text).unwrap();
        assert_eq!(cfg.general.instance_name, "filament-dev");
        assert_eq!(cfg.general.log_level, "info");
        assert_eq!(cfg.providers.len(), 1);
        assert_eq!(cfg.providers[0].kind, "anthropic");
        assert!(cfg.providers[0].endpoint.is_none());
    }

    #[test]
    fn load_from_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(Config::load_from(missing).is_err());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[bridge]\nbind_addr = \"0.0.0.0:9000\"\n").unwrap();
        let cfg = Config::load_from(&path).unwrap();
        assert_eq!(cfg.bridge.bind_addr, "0.0.0.0:9000");
    }
}
