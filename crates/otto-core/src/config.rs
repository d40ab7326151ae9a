//! Engine configuration
//!
//! Loaded from `~/.config/otto/config.toml`; every knob has a default
//! so a missing file is fine.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

fn default_max_rounds() -> usize {
    400
}

fn default_short_response_threshold() -> usize {
    50
}

fn default_hook_timeout_ms() -> u64 {
    30_000
}

fn default_backend() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env_var() -> String {
    "OPENAI_API_KEY".to_string()
}

/// Paths to the hook scripts, all optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookPaths {
    pub tool_approval: Option<PathBuf>,
    pub state_change: Option<PathBuf>,
    pub startup: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Ceiling on tool-calling rounds per user message.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,

    /// A non-tool response at or under this many chars triggers one
    /// continuation round. Policy knob, not a contract.
    #[serde(default = "default_short_response_threshold")]
    pub short_response_threshold: usize,

    /// Hook subprocess timeout in milliseconds.
    #[serde(default = "default_hook_timeout_ms")]
    pub hook_timeout_ms: u64,

    /// Stream responses instead of waiting for the full completion.
    #[serde(default)]
    pub stream: bool,

    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env_var")]
    pub api_key_env_var: String,

    #[serde(default)]
    pub hooks: HookPaths,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            short_response_threshold: default_short_response_threshold(),
            hook_timeout_ms: default_hook_timeout_ms(),
            stream: false,
            backend: default_backend(),
            model: default_model(),
            base_url: default_base_url(),
            api_key_env_var: default_api_key_env_var(),
            hooks: HookPaths::default(),
        }
    }
}

impl EngineConfig {
    pub fn hook_timeout(&self) -> Duration {
        Duration::from_millis(self.hook_timeout_ms)
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("otto")
    }

    /// Load from the default location, falling back to defaults when the
    /// file does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(Self::config_dir().join("config.toml"))
    }

    pub fn load_from(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}
