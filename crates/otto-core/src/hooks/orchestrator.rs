//! Hook execution and command application.
//!
//! Hooks are external executables. Input goes in as process-scoped
//! environment entries (the parent environment is never mutated),
//! output comes back as the stdout command grammar, and the exit code
//! is the approval channel: 0 approves, non-zero rejects, timeout
//! approves unless the hook is mandatory.
//!
//! CALL commands are dispatched after all synchronous processing as
//! detached tasks. A chain shares one `executedCalls` signature set, so
//! a duplicate CALL anywhere in the chain runs zero extra times, and a
//! depth bound stops runaway hook-calls-tool-calls-hook loops.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::agent::events::LoopEvent;
use crate::agent::history::{ChatEntry, ToolResultInfo};
use crate::agent::state::{Shared, SharedState};
use crate::hooks::commands::{self, AppliedCommands, ConditionKind, HookCommand};
use crate::hooks::switch::{SwitchRequest, SwitchValidator};
use crate::tools::{truncate_output, ToolRegistry};

/// A chain stops dispatching CALL commands at this depth.
pub const MAX_CALL_DEPTH: usize = 5;

/// Signatures already dispatched in the current chain. Shared across
/// nested dispatches, never replaced with a fresh set.
pub type ExecutedCalls = Arc<StdMutex<HashSet<String>>>;

pub fn new_executed_calls() -> ExecutedCalls {
    Arc::new(StdMutex::new(HashSet::new()))
}

/// Outcome of one hook subprocess.
#[derive(Debug)]
pub struct HookResult {
    pub approved: bool,
    pub reason: Option<String>,
    pub timed_out: bool,
    /// Parsed stdout. Present even on rejection: a rejecting hook's
    /// commands are still applied.
    pub commands: Vec<HookCommand>,
}

impl HookResult {
    fn approved_with(commands: Vec<HookCommand>) -> Self {
        Self { approved: true, reason: None, timed_out: false, commands }
    }

    fn rejected(reason: String, commands: Vec<HookCommand>) -> Self {
        Self { approved: false, reason: Some(reason), timed_out: false, commands }
    }
}

/// Result of applying a hook's command batch.
#[derive(Debug)]
pub struct ApplyOutcome {
    /// False when a requested backend/model switch failed validation.
    /// The caller must not apply its own pending change in that case.
    pub success: bool,
    /// Value of the watched env key after the batch, if the hook set it.
    pub transformed_value: Option<String>,
    /// Plain output lines, newline-joined.
    pub output: Option<String>,
}

/// Session-scoped env entries for a hook child process. Callers append
/// their explicit params after these, so explicit params win when a key
/// collides.
pub fn session_env_params(env: &HashMap<String, String>) -> Vec<(String, String)> {
    env.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

/// Run a hook executable for a named operation.
pub async fn run_operation_hook(
    path: &Path,
    operation: &str,
    params: &[(String, String)],
    timeout: Duration,
    mandatory: bool,
) -> HookResult {
    let mut command = tokio::process::Command::new(path);
    command
        .env("OTTO_HOOK_OPERATION", operation)
        .envs(params.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(hook = %path.display(), operation, "hook failed to spawn: {}", e);
            return if mandatory {
                HookResult::rejected(format!("hook failed to spawn: {e}"), Vec::new())
            } else {
                HookResult::approved_with(Vec::new())
            };
        }
    };

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!(hook = %path.display(), operation, "hook wait failed: {}", e);
            return HookResult::rejected(format!("hook wait failed: {e}"), Vec::new());
        }
        // kill_on_drop reaps the child when the future is dropped.
        Err(_) => {
            warn!(hook = %path.display(), operation, timeout_ms = timeout.as_millis() as u64, "hook timed out");
            let mut result = if mandatory {
                HookResult::rejected("hook timed out".to_string(), Vec::new())
            } else {
                HookResult::approved_with(Vec::new())
            };
            result.timed_out = true;
            return result;
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let parsed = commands::parse(&stdout);

    if output.status.success() {
        return HookResult::approved_with(parsed);
    }

    let output_lines: Vec<&str> = parsed
        .iter()
        .filter_map(|c| match c {
            HookCommand::Output(line) => Some(line.as_str()),
            _ => None,
        })
        .collect();
    let reason = if !output_lines.is_empty() {
        output_lines.join("\n")
    } else if !stdout.trim().is_empty() {
        stdout.trim().to_string()
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.trim().is_empty() {
            format!("hook exited with {}", output.status)
        } else {
            stderr.trim().to_string()
        }
    };
    HookResult::rejected(reason, parsed)
}

/// Run the tool-approval hook for one tool call.
pub async fn run_tool_approval_hook(
    path: &Path,
    tool_name: &str,
    arguments: &Value,
    session_env: &[(String, String)],
    timeout: Duration,
) -> HookResult {
    let mut params = session_env.to_vec();
    params.push(("OTTO_TOOL_NAME".to_string(), tool_name.to_string()));
    params.push(("OTTO_TOOL_ARGS".to_string(), arguments.to_string()));
    run_operation_hook(path, "tool_approval", &params, timeout, false).await
}

pub struct HookOrchestrator {
    state: Shared,
    validator: Arc<SwitchValidator>,
    registry: Arc<ToolRegistry>,
    events: mpsc::UnboundedSender<LoopEvent>,
}

impl HookOrchestrator {
    pub fn new(
        state: Shared,
        validator: Arc<SwitchValidator>,
        registry: Arc<ToolRegistry>,
        events: mpsc::UnboundedSender<LoopEvent>,
    ) -> Self {
        Self { state, validator, registry, events }
    }

    /// Apply a hook's command batch: env/prompt-vars/system notices
    /// unconditionally, backend/model switches through validation, then
    /// dispatch accumulated CALL commands detached. `watched_env_key`
    /// reports back the value a hook assigned to that key, letting a
    /// hook transform the value the caller is about to commit.
    pub async fn apply_hook_result(
        &self,
        result: &HookResult,
        watched_env_key: Option<&str>,
        executed: ExecutedCalls,
        depth: usize,
    ) -> ApplyOutcome {
        let applied = commands::apply(&result.commands);
        let output = applied.output.clone();

        let mut state = self.state.lock().await;
        let (success, calls) = self.apply_batches(&mut state, &applied).await;
        let transformed_value =
            watched_env_key.and_then(|key| state.session.env.get(key).cloned());
        drop(state);

        if !calls.is_empty() {
            dispatch_calls(
                self.registry.clone(),
                self.state.clone(),
                self.events.clone(),
                executed,
                depth,
                calls,
            );
        }

        ApplyOutcome { success, transformed_value, output }
    }

    /// Walk a batch and its conditional chain. Each conditional block
    /// applies only after the switch requested alongside it validates.
    async fn apply_batches(
        &self,
        state: &mut SharedState,
        applied: &AppliedCommands,
    ) -> (bool, Vec<String>) {
        let mut calls: Vec<String> = Vec::new();
        let mut current = Some(applied);

        while let Some(batch) = current {
            for (key, value) in &batch.env {
                state.session.apply_env(key, value);
            }
            for (key, value) in &batch.prompt_vars {
                state.session.prompt_vars.insert(key.clone(), value.clone());
            }
            if let Some(system) = &batch.system {
                state.pending_system.push(system.clone());
            }
            if let Some(prefill) = &batch.prefill {
                state.prefill = Some(prefill.clone());
            }
            calls.extend(batch.calls.iter().cloned());

            if !batch.requests_switch() {
                if batch.conditional.is_some() {
                    debug!("CONDITION block without a switch request, skipping");
                }
                break;
            }

            let request = SwitchRequest {
                backend: batch.backend.clone(),
                model: batch.model.clone(),
                base_url: batch.base_url.clone(),
                api_key_env_var: batch.api_key_env_var.clone(),
            };
            let had_tools = self.validator.client_supports_tools().await;
            let outcome = self
                .validator
                .validate_and_commit(&request, &mut state.session, &mut state.tokens, &state.messages)
                .await;

            if !outcome.success {
                let error = outcome.error.unwrap_or_else(|| "unknown error".to_string());
                state
                    .pending_system
                    .push(format!("Backend switch failed: {error}"));
                return (false, calls);
            }

            if request.backend.is_some() {
                self.events
                    .send(LoopEvent::BackendChanged {
                        backend: state.session.backend.clone(),
                        model: state.session.model.clone(),
                    })
                    .ok();
            } else {
                self.events
                    .send(LoopEvent::ModelChanged { model: state.session.model.clone() })
                    .ok();
            }
            state.pending_system.push(format!(
                "Now using backend {} with model {}",
                state.session.backend, state.session.model
            ));
            let has_tools = self.validator.client_supports_tools().await;
            if has_tools != had_tools {
                state.pending_system.push(if has_tools {
                    "Tool calling is available again on this backend.".to_string()
                } else {
                    "This backend does not support tool calling; tools are disabled.".to_string()
                });
            }

            current = batch.conditional.as_deref().and_then(|block| {
                let met = match block.kind {
                    ConditionKind::Backend => batch.backend.is_some(),
                    ConditionKind::Model => batch.model.is_some(),
                };
                met.then_some(&block.commands)
            });
        }

        (true, calls)
    }
}

/// Fire-and-forget CALL dispatch. Each call runs in its own task;
/// nested CALL commands found in a tool's own output re-enter here with
/// `depth + 1` and the same signature set.
pub fn dispatch_calls(
    registry: Arc<ToolRegistry>,
    state: Shared,
    events: mpsc::UnboundedSender<LoopEvent>,
    executed: ExecutedCalls,
    depth: usize,
    calls: Vec<String>,
) {
    if depth >= MAX_CALL_DEPTH {
        warn!(depth, dropped = calls.len(), "CALL depth limit reached");
        return;
    }

    for line in calls {
        let Some((name, args)) = commands::parse_call_line(&line) else {
            warn!(line, "unparseable CALL line");
            continue;
        };

        let signature = commands::call_signature(&name, &args);
        {
            let mut set = match executed.lock() {
                Ok(set) => set,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !set.insert(signature) {
                debug!(tool = %name, "duplicate CALL signature, skipping");
                continue;
            }
        }

        let registry = registry.clone();
        let state = state.clone();
        let events = events.clone();
        let executed = executed.clone();
        tokio::spawn(async move {
            let call_id = format!("hookcall_{}", Uuid::new_v4().simple());
            let args_value = Value::Object(args);
            events
                .send(LoopEvent::ToolExecuting { id: call_id.clone(), name: name.clone() })
                .ok();

            let outcome = registry.execute(&name, args_value.clone()).await;
            if !outcome.success {
                warn!(tool = %name, "hook CALL failed: {}", outcome.result_text());
            }

            {
                let mut shared = state.lock().await;
                let mut entry =
                    ChatEntry::tool_call(call_id.clone(), name.clone(), args_value.to_string());
                entry.complete_tool(ToolResultInfo {
                    success: outcome.success,
                    output: outcome.output.clone(),
                    error: outcome.error.clone(),
                    display_output: outcome.display_output.clone(),
                });
                shared.history.push(entry);
            }
            events
                .send(LoopEvent::ToolResult {
                    id: call_id,
                    output: truncate_output(&outcome.result_text()),
                    is_error: !outcome.success,
                })
                .ok();

            let nested: Vec<String> = commands::parse(&outcome.result_text())
                .into_iter()
                .filter_map(|command| match command {
                    HookCommand::Call(line) => Some(line),
                    _ => None,
                })
                .collect();
            if !nested.is_empty() {
                dispatch_calls(registry, state, events, executed, depth + 1, nested);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::client::{BackendProfile, CallOptions, ClientError, LlmClient};
    use crate::ai::types::{ChatChoice, ChatMessage, ChatResponse, StreamEvent, ToolSchema};
    use crate::hooks::switch::{ClientFactory, ClientSlot};
    use crate::session::SessionState;
    use crate::tools::{Tool, ToolOutcome};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::RwLock;

    fn script(body: &str) -> (tempfile::TempDir, PathBuf) {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hook.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn approving_hook_returns_parsed_commands() {
        let (_dir, path) = script("echo \"ENV MOOD=happy\"\necho \"SYSTEM mood updated\"\nexit 0");
        let result =
            run_operation_hook(&path, "set_mood", &[], Duration::from_secs(5), false).await;
        assert!(result.approved);
        assert!(!result.timed_out);
        assert_eq!(
            result.commands[0],
            HookCommand::Env { key: "OTTO_MOOD".to_string(), value: "happy".to_string() }
        );
        assert_eq!(result.commands[1], HookCommand::System("mood updated".to_string()));
    }

    #[tokio::test]
    async fn rejecting_hook_reports_output_as_reason() {
        let (_dir, path) = script("echo \"not during business hours\"\nexit 3");
        let result =
            run_operation_hook(&path, "set_persona", &[], Duration::from_secs(5), false).await;
        assert!(!result.approved);
        assert_eq!(result.reason.as_deref(), Some("not during business hours"));
    }

    #[tokio::test]
    async fn hook_sees_operation_and_params_in_env() {
        let (_dir, path) = script("echo \"SYSTEM op=$OTTO_HOOK_OPERATION val=$OTTO_NEW_VALUE\"");
        let params = vec![("OTTO_NEW_VALUE".to_string(), "pirate".to_string())];
        let result =
            run_operation_hook(&path, "set_persona", &params, Duration::from_secs(5), false).await;
        assert_eq!(
            result.commands[0],
            HookCommand::System("op=set_persona val=pirate".to_string())
        );
    }

    #[tokio::test]
    async fn timeout_approves_unless_mandatory() {
        let (_dir, path) = script("sleep 5");
        let lenient =
            run_operation_hook(&path, "startup", &[], Duration::from_millis(200), false).await;
        assert!(lenient.approved);
        assert!(lenient.timed_out);

        let strict =
            run_operation_hook(&path, "startup", &[], Duration::from_millis(200), true).await;
        assert!(!strict.approved);
        assert!(strict.timed_out);
    }

    #[tokio::test]
    async fn tool_approval_hook_passes_arguments() {
        let (_dir, path) = script("echo \"SYSTEM tool=$OTTO_TOOL_NAME\"\nexit 0");
        let args = serde_json::json!({"path": "/tmp/x"});
        let result =
            run_tool_approval_hook(&path, "write_file", &args, &[], Duration::from_secs(5)).await;
        assert!(result.approved);
        assert_eq!(result.commands[0], HookCommand::System("tool=write_file".to_string()));
    }

    #[tokio::test]
    async fn session_env_reaches_the_hook_and_explicit_params_win() {
        let (_dir, path) = script("echo \"SYSTEM mood=$OTTO_MOOD val=$OTTO_NEW_VALUE\"\nexit 0");
        let mut env = HashMap::new();
        env.insert("OTTO_MOOD".to_string(), "calm".to_string());
        env.insert("OTTO_NEW_VALUE".to_string(), "stale".to_string());
        let mut params = session_env_params(&env);
        params.push(("OTTO_NEW_VALUE".to_string(), "pirate".to_string()));

        let result =
            run_operation_hook(&path, "set_persona", &params, Duration::from_secs(5), false).await;
        assert_eq!(
            result.commands[0],
            HookCommand::System("mood=calm val=pirate".to_string())
        );
    }

    struct ProbeClient {
        name: String,
        fail: bool,
        tools: bool,
    }

    #[async_trait]
    impl LlmClient for ProbeClient {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _options: &CallOptions,
        ) -> Result<ChatResponse, ClientError> {
            if self.fail {
                return Err(ClientError::Status { status: 404, body: "no such model".to_string() });
            }
            Ok(ChatResponse {
                choices: vec![ChatChoice {
                    message: ChatMessage::assistant("ok"),
                    finish_reason: None,
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
            self.tools
        }
        fn set_model(&self, _model: String) {}
        fn current_model(&self) -> String {
            "m".to_string()
        }
        fn backend_name(&self) -> String {
            self.name.clone()
        }
        fn base_url(&self) -> String {
            "http://test".to_string()
        }
    }

    struct CountingTool {
        name: String,
        calls: Arc<AtomicUsize>,
        output: String,
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: self.name.clone(),
                description: "counts invocations".to_string(),
                parameters: Default::default(),
            }
        }

        async fn execute(&self, _args: Value) -> ToolOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ToolOutcome::success(self.output.clone())
        }
    }

    fn orchestrator(
        probe_fails: bool,
        registry: ToolRegistry,
    ) -> (HookOrchestrator, Shared, mpsc::UnboundedReceiver<LoopEvent>) {
        let session =
            SessionState::new("openai", "gpt-4o", "https://api.openai.com/v1", "OPENAI_API_KEY");
        let state = SharedState::shared(session);
        let current: Arc<dyn LlmClient> =
            Arc::new(ProbeClient { name: "openai".to_string(), fail: false, tools: true });
        let slot: ClientSlot = Arc::new(RwLock::new(current));
        let factory: ClientFactory = Arc::new(move |profile: &BackendProfile| {
            let client: Arc<dyn LlmClient> =
                Arc::new(ProbeClient { name: profile.name.clone(), fail: probe_fails, tools: true });
            Ok(client)
        });
        let validator = Arc::new(SwitchValidator::new(slot, factory));
        let (tx, rx) = mpsc::unbounded_channel();
        let orchestrator = HookOrchestrator::new(state.clone(), validator, Arc::new(registry), tx);
        (orchestrator, state, rx)
    }

    #[tokio::test]
    async fn env_and_system_apply_unconditionally() {
        let (orchestrator, state, _rx) = orchestrator(false, ToolRegistry::new());
        let result = HookResult::approved_with(commands::parse("ENV MOOD=calm\nSYSTEM a note\n"));
        let outcome = orchestrator
            .apply_hook_result(&result, Some("OTTO_MOOD"), new_executed_calls(), 0)
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.transformed_value.as_deref(), Some("calm"));

        let shared = state.lock().await;
        assert_eq!(shared.session.env.get("OTTO_MOOD").map(String::as_str), Some("calm"));
        assert_eq!(shared.pending_system, vec!["a note".to_string()]);
    }

    #[tokio::test]
    async fn failed_switch_skips_conditional_and_signals_failure() {
        let (orchestrator, state, _rx) = orchestrator(true, ToolRegistry::new());
        let result = HookResult::approved_with(commands::parse(
            "BACKEND groq\nMODEL llama-3.3\nCONDITION BACKEND\nSYSTEM switched ok\n",
        ));
        let outcome = orchestrator
            .apply_hook_result(&result, None, new_executed_calls(), 0)
            .await;
        assert!(!outcome.success);

        let shared = state.lock().await;
        assert_eq!(shared.session.backend, "openai");
        assert_eq!(shared.session.model, "gpt-4o");
        assert_eq!(shared.pending_system.len(), 1);
        assert!(shared.pending_system[0].starts_with("Backend switch failed"));
    }

    #[tokio::test]
    async fn successful_switch_applies_conditional_block() {
        let (orchestrator, state, mut rx) = orchestrator(false, ToolRegistry::new());
        let result = HookResult::approved_with(commands::parse(
            "BACKEND groq\nMODEL llama-3.3\nCONDITION BACKEND\nSYSTEM switched ok\nENV MOOD=fast\n",
        ));
        let outcome = orchestrator
            .apply_hook_result(&result, None, new_executed_calls(), 0)
            .await;
        assert!(outcome.success);

        let shared = state.lock().await;
        assert_eq!(shared.session.backend, "groq");
        assert_eq!(shared.session.env.get("OTTO_MOOD").map(String::as_str), Some("fast"));
        assert!(shared.pending_system.iter().any(|m| m == "switched ok"));

        let event = rx.try_recv().unwrap();
        assert!(matches!(event, LoopEvent::BackendChanged { .. }));
    }

    #[tokio::test]
    async fn losing_tool_support_queues_a_notice() {
        let session =
            SessionState::new("openai", "gpt-4o", "https://api.openai.com/v1", "OPENAI_API_KEY");
        let state = SharedState::shared(session);
        let current: Arc<dyn LlmClient> =
            Arc::new(ProbeClient { name: "openai".to_string(), fail: false, tools: true });
        let slot: ClientSlot = Arc::new(RwLock::new(current));
        let factory: ClientFactory = Arc::new(|profile: &BackendProfile| {
            let client: Arc<dyn LlmClient> =
                Arc::new(ProbeClient { name: profile.name.clone(), fail: false, tools: false });
            Ok(client)
        });
        let validator = Arc::new(SwitchValidator::new(slot, factory));
        let (tx, _rx) = mpsc::unbounded_channel();
        let orchestrator =
            HookOrchestrator::new(state.clone(), validator, Arc::new(ToolRegistry::new()), tx);

        let result = HookResult::approved_with(commands::parse("BACKEND legacy\n"));
        let outcome = orchestrator
            .apply_hook_result(&result, None, new_executed_calls(), 0)
            .await;
        assert!(outcome.success);

        let shared = state.lock().await;
        assert!(shared
            .pending_system
            .iter()
            .any(|m| m.contains("does not support tool calling")));
    }

    #[tokio::test]
    async fn duplicate_call_signatures_execute_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(CountingTool {
            name: "f".to_string(),
            calls: calls.clone(),
            output: "done".to_string(),
        }));
        let (orchestrator, _state, _rx) = orchestrator(false, registry);

        let result =
            HookResult::approved_with(commands::parse("CALL f a=1\nCALL f a=1\n"));
        let executed = new_executed_calls();
        orchestrator.apply_hook_result(&result, None, executed.clone(), 0).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Same signature from a later batch in the same chain: still deduped.
        let again = HookResult::approved_with(commands::parse("CALL f a=1\n"));
        orchestrator.apply_hook_result(&again, None, executed, 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn call_chain_stops_at_depth_limit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        // Each execution emits a CALL with a fresh signature.
        struct ChainTool {
            calls: Arc<AtomicUsize>,
        }
        #[async_trait]
        impl Tool for ChainTool {
            fn schema(&self) -> ToolSchema {
                ToolSchema {
                    name: "chain".to_string(),
                    description: "emits another CALL".to_string(),
                    parameters: Default::default(),
                }
            }
            async fn execute(&self, _args: Value) -> ToolOutcome {
                let step = self.calls.fetch_add(1, Ordering::SeqCst);
                ToolOutcome::success(format!("CALL chain step={}", step + 1))
            }
        }
        registry.register(Arc::new(ChainTool { calls: calls.clone() }));
        let (orchestrator, _state, _rx) = orchestrator(false, registry);

        let result = HookResult::approved_with(commands::parse("CALL chain step=0\n"));
        orchestrator.apply_hook_result(&result, None, new_executed_calls(), 0).await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(calls.load(Ordering::SeqCst), MAX_CALL_DEPTH);
    }

    #[tokio::test]
    async fn dispatched_calls_land_in_history() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(CountingTool {
            name: "notify".to_string(),
            calls,
            output: "sent".to_string(),
        }));
        let (orchestrator, state, _rx) = orchestrator(false, registry);

        let result = HookResult::approved_with(commands::parse("CALL notify msg=\"hi\"\n"));
        orchestrator.apply_hook_result(&result, None, new_executed_calls(), 0).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let shared = state.lock().await;
        assert_eq!(shared.history.len(), 1);
        let entry = &shared.history[0];
        assert_eq!(entry.tool_name.as_deref(), Some("notify"));
        assert!(entry.tool_result.as_ref().unwrap().success);
        // Detached calls never touch the API message list.
        assert!(shared.messages.is_empty());
    }
}
