//! Session state
//!
//! One explicit struct instead of scattered global environment
//! variables. Hooks and the engine mutate it through setters; the
//! switch validator writes its backend-identity fields only after a
//! probe call succeeds.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    None,
    Active,
    Paused,
    Done,
}

/// Serializable snapshot of everything that defines a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub persona: Option<String>,
    pub mood: Option<String>,
    pub active_task: Option<String>,
    pub task_status: TaskStatus,
    pub backend: String,
    pub model: String,
    pub base_url: String,
    pub api_key_env_var: String,
    pub working_dir: PathBuf,
    pub token_usage: usize,
    /// Session-scoped environment handed to hook subprocesses.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Prompt-variable assignments collected from hooks, keyed
    /// `namespace:name`. The templating engine consuming them is an
    /// external collaborator.
    #[serde(default)]
    pub prompt_vars: HashMap<String, String>,
}

impl SessionState {
    pub fn new(backend: &str, model: &str, base_url: &str, api_key_env_var: &str) -> Self {
        Self {
            persona: None,
            mood: None,
            active_task: None,
            task_status: TaskStatus::None,
            backend: backend.to_string(),
            model: model.to_string(),
            base_url: base_url.to_string(),
            api_key_env_var: api_key_env_var.to_string(),
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            token_usage: 0,
            env: HashMap::new(),
            prompt_vars: HashMap::new(),
        }
    }

    /// Apply an env assignment from a hook. Empty value means unset.
    pub fn apply_env(&mut self, key: &str, value: &str) {
        if value.is_empty() {
            self.env.remove(key);
        } else {
            self.env.insert(key.to_string(), value.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_env_value_unsets() {
        let mut state = SessionState::new("openai", "m", "u", "K");
        state.apply_env("OTTO_MOOD", "focused");
        assert_eq!(state.env.get("OTTO_MOOD").map(String::as_str), Some("focused"));
        state.apply_env("OTTO_MOOD", "");
        assert!(!state.env.contains_key("OTTO_MOOD"));
    }
}
