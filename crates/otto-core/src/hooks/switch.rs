//! Transactional backend/model switching.
//!
//! A requested switch is probed with a real chat call against the live
//! conversation before any state changes. Compatibility problems (a
//! backend that chokes on existing tool-call history, a model name that
//! does not exist) only surface against the actual transcript, so the
//! probe sends it rather than a synthetic ping. Session, token counter
//! and the live client slot are only written at the single commit
//! point after the probe succeeds.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::agent::tokens::TokenAccounting;
use crate::ai::client::{BackendProfile, CallOptions, LlmClient};
use crate::ai::types::{unresolved_tool_call_ids, ChatMessage};
use crate::config::EngineConfig;
use crate::session::SessionState;

/// Token budget for the probe call. Small on purpose: the probe only
/// needs to prove the request parses, not produce useful output.
const PROBE_MAX_TOKENS: usize = 16;

/// Builds a client for a candidate profile. Injectable so tests can
/// substitute a scripted client.
pub type ClientFactory =
    Arc<dyn Fn(&BackendProfile) -> anyhow::Result<Arc<dyn LlmClient>> + Send + Sync>;

/// Shared slot holding the live client; swapped only on commit.
pub type ClientSlot = Arc<RwLock<Arc<dyn LlmClient>>>;

#[derive(Debug, Clone)]
pub struct SwitchOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl SwitchOutcome {
    fn ok() -> Self {
        Self { success: true, error: None }
    }

    fn failed(error: String) -> Self {
        Self { success: false, error: Some(error) }
    }
}

/// Fields of a switch request; unset fields keep their current value.
#[derive(Debug, Clone, Default)]
pub struct SwitchRequest {
    pub backend: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub api_key_env_var: Option<String>,
}

impl SwitchRequest {
    pub fn model_only(model: &str) -> Self {
        Self { model: Some(model.to_string()), ..Self::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.backend.is_none()
            && self.model.is_none()
            && self.base_url.is_none()
            && self.api_key_env_var.is_none()
    }
}

pub struct SwitchValidator {
    client_slot: ClientSlot,
    factory: ClientFactory,
}

impl SwitchValidator {
    pub fn new(client_slot: ClientSlot, factory: ClientFactory) -> Self {
        Self { client_slot, factory }
    }

    /// Whether the live client reports tool-calling support.
    pub async fn client_supports_tools(&self) -> bool {
        self.client_slot.read().await.supports_tools()
    }

    /// Try switching just the model on the current backend.
    pub async fn test_model(
        &self,
        model: &str,
        session: &mut SessionState,
        tokens: &mut TokenAccounting,
        messages: &[ChatMessage],
    ) -> SwitchOutcome {
        self.validate_and_commit(&SwitchRequest::model_only(model), session, tokens, messages)
            .await
    }

    /// Try switching backend (and optionally model) in one transaction.
    pub async fn test_backend_change(
        &self,
        backend: &str,
        base_url: Option<String>,
        api_key_env_var: Option<String>,
        model: Option<String>,
        session: &mut SessionState,
        tokens: &mut TokenAccounting,
        messages: &[ChatMessage],
    ) -> SwitchOutcome {
        let request = SwitchRequest {
            backend: Some(backend.to_string()),
            model,
            base_url,
            api_key_env_var,
        };
        self.validate_and_commit(&request, session, tokens, messages).await
    }

    /// Probe the candidate configuration and commit it on success.
    /// On failure nothing is mutated; the error names a diagnostic log
    /// when one could be written.
    pub async fn validate_and_commit(
        &self,
        request: &SwitchRequest,
        session: &mut SessionState,
        tokens: &mut TokenAccounting,
        messages: &[ChatMessage],
    ) -> SwitchOutcome {
        if request.is_empty() {
            return SwitchOutcome::ok();
        }

        let current = self.client_slot.read().await.clone();
        let candidate_profile = BackendProfile {
            name: request.backend.clone().unwrap_or_else(|| session.backend.clone()),
            base_url: request.base_url.clone().unwrap_or_else(|| session.base_url.clone()),
            api_key_env_var: request
                .api_key_env_var
                .clone()
                .unwrap_or_else(|| session.api_key_env_var.clone()),
            model: request.model.clone().unwrap_or_else(|| session.model.clone()),
            supports_tools: current.supports_tools(),
        };

        let candidate = match (self.factory)(&candidate_profile) {
            Ok(client) => client,
            Err(e) => {
                return self.fail(&candidate_profile, format!("client construction failed: {e}"))
            }
        };

        let probe_messages = strip_unresolved(messages);
        let options = CallOptions {
            tools: None,
            temperature: None,
            max_tokens: Some(PROBE_MAX_TOKENS),
        };
        match candidate.chat(&probe_messages, &options).await {
            Ok(response) if response.choices.is_empty() => {
                self.fail(&candidate_profile, "probe returned no choices".to_string())
            }
            Err(e) => self.fail(&candidate_profile, format!("probe call failed: {e}")),
            Ok(_) => {
                // Commit point. Nothing above this line mutated state.
                session.backend = candidate_profile.name.clone();
                session.model = candidate_profile.model.clone();
                session.base_url = candidate_profile.base_url.clone();
                session.api_key_env_var = candidate_profile.api_key_env_var.clone();
                *tokens = TokenAccounting::for_backend(&session.backend);
                *self.client_slot.write().await = candidate;
                info!(
                    backend = %session.backend,
                    model = %session.model,
                    "backend switch committed"
                );
                SwitchOutcome::ok()
            }
        }
    }

    fn fail(&self, profile: &BackendProfile, error: String) -> SwitchOutcome {
        warn!(backend = %profile.name, model = %profile.model, "backend switch rejected: {}", error);
        match write_diagnostic(profile, &error) {
            Some(path) => SwitchOutcome::failed(format!(
                "{error} (diagnostic log: {})",
                path.display()
            )),
            None => SwitchOutcome::failed(error),
        }
    }
}

/// Drop unresolved tool calls so the probe transcript is well-formed.
/// An assistant message left with neither content nor tool calls gets
/// placeholder content; tool results pointing at dropped calls go too.
pub fn strip_unresolved(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let unresolved = unresolved_tool_call_ids(messages);
    if unresolved.is_empty() {
        return messages.to_vec();
    }

    let mut stripped = Vec::with_capacity(messages.len());
    for message in messages {
        let mut message = message.clone();
        if !message.tool_calls.is_empty() {
            message.tool_calls.retain(|call| !unresolved.contains(&call.id));
            if message.tool_calls.is_empty() && message.content.is_none() {
                message.content = Some("(interrupted)".to_string());
            }
        }
        if let Some(id) = &message.tool_call_id {
            if unresolved.contains(id) {
                continue;
            }
        }
        stripped.push(message);
    }
    stripped
}

fn write_diagnostic(profile: &BackendProfile, error: &str) -> Option<PathBuf> {
    let dir = EngineConfig::config_dir();
    if std::fs::create_dir_all(&dir).is_err() {
        return None;
    }
    let path = dir.join("switch-failures.log");
    let line = format!(
        "{} backend={} model={} base_url={} error={}\n",
        Utc::now().to_rfc3339(),
        profile.name,
        profile.model,
        profile.base_url,
        error
    );
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .ok()?;
    file.write_all(line.as_bytes()).ok()?;
    Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::client::ClientError;
    use crate::ai::types::{ChatChoice, ChatResponse, StreamEvent, ToolCall};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct ScriptedClient {
        name: String,
        model: std::sync::RwLock<String>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl ScriptedClient {
        fn new(name: &str, model: &str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                model: std::sync::RwLock::new(model.to_string()),
                fail,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _options: &CallOptions,
        ) -> Result<ChatResponse, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ClientError::Status {
                    status: 400,
                    body: "unknown model".to_string(),
                });
            }
            Ok(ChatResponse {
                choices: vec![ChatChoice {
                    message: ChatMessage::assistant("ok"),
                    finish_reason: Some("stop".to_string()),
                }],
                usage: None,
            })
        }

        async fn chat_stream(
            &self,
            _messages: &[ChatMessage],
            _options: &CallOptions,
        ) -> Result<mpsc::UnboundedReceiver<StreamEvent>, ClientError> {
            let (_tx, rx) = mpsc::unbounded_channel();
            Ok(rx)
        }

        fn supports_tools(&self) -> bool {
            true
        }

        fn set_model(&self, model: String) {
            *self.model.write().unwrap() = model;
        }

        fn current_model(&self) -> String {
            self.model.read().unwrap().clone()
        }

        fn backend_name(&self) -> String {
            self.name.clone()
        }

        fn base_url(&self) -> String {
            "http://test".to_string()
        }
    }

    fn setup(fail_probe: bool) -> (SwitchValidator, ClientSlot, SessionState, TokenAccounting) {
        let current: Arc<dyn LlmClient> = ScriptedClient::new("openai", "gpt-4o", false);
        let slot: ClientSlot = Arc::new(RwLock::new(current));
        let factory: ClientFactory = Arc::new(move |profile: &BackendProfile| {
            let client: Arc<dyn LlmClient> =
                ScriptedClient::new(&profile.name, &profile.model, fail_probe);
            Ok(client)
        });
        let validator = SwitchValidator::new(slot.clone(), factory);
        let session = SessionState::new("openai", "gpt-4o", "https://api.openai.com/v1", "OPENAI_API_KEY");
        let tokens = TokenAccounting::for_backend("openai");
        (validator, slot, session, tokens)
    }

    #[tokio::test]
    async fn successful_switch_commits_everything() {
        let (validator, slot, mut session, mut tokens) = setup(false);
        let request = SwitchRequest {
            backend: Some("anthropic".to_string()),
            model: Some("claude-sonnet".to_string()),
            ..SwitchRequest::default()
        };
        let outcome = validator
            .validate_and_commit(&request, &mut session, &mut tokens, &[])
            .await;
        assert!(outcome.success);
        assert_eq!(session.backend, "anthropic");
        assert_eq!(session.model, "claude-sonnet");
        assert_eq!(tokens.max_tokens(), crate::agent::tokens::context_window_for("anthropic"));
        assert_eq!(slot.read().await.backend_name(), "anthropic");
    }

    #[tokio::test]
    async fn failed_probe_leaves_state_untouched() {
        let (validator, slot, mut session, mut tokens) = setup(true);
        let before_max = tokens.max_tokens();
        let request = SwitchRequest {
            backend: Some("groq".to_string()),
            model: Some("bogus".to_string()),
            ..SwitchRequest::default()
        };
        let outcome = validator
            .validate_and_commit(&request, &mut session, &mut tokens, &[])
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("probe"));
        assert_eq!(session.backend, "openai");
        assert_eq!(session.model, "gpt-4o");
        assert_eq!(tokens.max_tokens(), before_max);
        assert_eq!(slot.read().await.backend_name(), "openai");
    }

    #[tokio::test]
    async fn test_model_switches_only_the_model() {
        let (validator, slot, mut session, mut tokens) = setup(false);
        let outcome = validator
            .test_model("gpt-4o-mini", &mut session, &mut tokens, &[])
            .await;
        assert!(outcome.success);
        assert_eq!(session.backend, "openai");
        assert_eq!(session.model, "gpt-4o-mini");
        assert_eq!(slot.read().await.current_model(), "gpt-4o-mini");
    }

    #[tokio::test]
    async fn empty_request_is_a_noop() {
        let (validator, slot, mut session, mut tokens) = setup(false);
        let outcome = validator
            .validate_and_commit(&SwitchRequest::default(), &mut session, &mut tokens, &[])
            .await;
        assert!(outcome.success);
        assert_eq!(slot.read().await.backend_name(), "openai");
    }

    #[test]
    fn strip_unresolved_drops_dangling_calls() {
        let messages = vec![
            ChatMessage::user("hi"),
            ChatMessage::assistant_with_tools(
                None,
                vec![
                    ToolCall::new("a", "read", "{}"),
                    ToolCall::new("b", "write", "{}"),
                ],
            ),
            ChatMessage::tool_result("a", "done"),
        ];
        let stripped = strip_unresolved(&messages);
        assert_eq!(stripped.len(), 3);
        assert_eq!(stripped[1].tool_calls.len(), 1);
        assert_eq!(stripped[1].tool_calls[0].id, "a");
    }

    #[test]
    fn strip_unresolved_backfills_empty_assistant() {
        let messages = vec![ChatMessage::assistant_with_tools(
            None,
            vec![ToolCall::new("x", "read", "{}")],
        )];
        let stripped = strip_unresolved(&messages);
        assert!(stripped[0].tool_calls.is_empty());
        assert_eq!(stripped[0].content.as_deref(), Some("(interrupted)"));
    }
}
