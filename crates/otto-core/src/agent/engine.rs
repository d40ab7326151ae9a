//! Conversation engine
//!
//! Drives the multi-round tool-calling loop for one conversation:
//! request a response, execute any tool calls strictly in model order,
//! append results, repeat until the model answers without tools or the
//! round ceiling trips. Cancellation is cooperative and checked before
//! each tool execution and inside the streaming read loop.
//!
//! Ordering is load-bearing throughout: an assistant message carrying
//! tool_calls must be followed by exactly its tool results before any
//! other message, or backends reject the transcript. System notices
//! produced mid-round are therefore parked in `pending_system` and
//! flushed only after the round's last tool result.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::accumulator::{extract_xml_tool_calls, StreamAccumulator};
use crate::agent::events::LoopEvent;
use crate::agent::failure::detect_repeated_failures;
use crate::agent::history::{ChatEntry, EntryKind, RephraseState, ToolResultInfo};
use crate::agent::sanitizer;
use crate::agent::state::{Shared, SharedState};
use crate::agent::tokens::UsageEvent;
use crate::ai::client::{BackendProfile, CallOptions, HttpLlmClient, LlmClient};
use crate::ai::types::{
    unresolved_tool_call_ids, ChatMessage, StreamEvent, ToolCall, ToolSchema,
};
use crate::config::EngineConfig;
use crate::hooks::orchestrator::{
    new_executed_calls, run_operation_hook, run_tool_approval_hook, session_env_params,
    HookOrchestrator,
};
use crate::hooks::switch::{ClientFactory, ClientSlot, SwitchValidator};
use crate::mcp::{mcp_server_for_tool, McpManager};
use crate::persist::Persistence;
use crate::session::{SessionState, TaskStatus};
use crate::tools::{truncate_output, ToolOutcome, ToolRegistry};

/// Result content synthesized for a tool call that never ran.
pub const CANCELLED_RESULT: &str = "[Cancelled by user]";

/// Some backends reject an assistant message with tool_calls but blank
/// content, so empty content gets this placeholder.
const TOOL_CONTENT_PLACEHOLDER: &str = "(using tools)";

enum RoundControl {
    Continue,
    Stop,
}

enum SessionField {
    Persona,
    Mood,
    ActiveTask,
}

pub struct Engine {
    config: EngineConfig,
    state: Shared,
    client: ClientSlot,
    registry: Arc<ToolRegistry>,
    mcp: Option<Arc<dyn McpManager>>,
    hooks: HookOrchestrator,
    persistence: Arc<dyn Persistence>,
    events: mpsc::UnboundedSender<LoopEvent>,
    cancel: CancellationToken,
    failure_counters: HashMap<String, usize>,
    system_prompt: String,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        client: Arc<dyn LlmClient>,
        factory: ClientFactory,
        registry: Arc<ToolRegistry>,
        mcp: Option<Arc<dyn McpManager>>,
        persistence: Arc<dyn Persistence>,
        system_prompt: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<LoopEvent>) {
        let session = SessionState::new(
            &config.backend,
            &config.model,
            &config.base_url,
            &config.api_key_env_var,
        );
        let state = SharedState::shared(session);
        let client: ClientSlot = Arc::new(RwLock::new(client));
        let validator = Arc::new(SwitchValidator::new(client.clone(), factory));
        let (events, receiver) = mpsc::unbounded_channel();
        let hooks =
            HookOrchestrator::new(state.clone(), validator, registry.clone(), events.clone());

        let engine = Self {
            config,
            state,
            client,
            registry,
            mcp,
            hooks,
            persistence,
            events,
            cancel: CancellationToken::new(),
            failure_counters: HashMap::new(),
            system_prompt: system_prompt.into(),
        };
        (engine, receiver)
    }

    /// HTTP-backed engine wired from the config's backend fields.
    pub fn with_http(
        config: EngineConfig,
        registry: Arc<ToolRegistry>,
        mcp: Option<Arc<dyn McpManager>>,
        persistence: Arc<dyn Persistence>,
        system_prompt: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<LoopEvent>) {
        let profile = BackendProfile {
            name: config.backend.clone(),
            base_url: config.base_url.clone(),
            api_key_env_var: config.api_key_env_var.clone(),
            model: config.model.clone(),
            supports_tools: true,
        };
        let client: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::new(profile));
        let factory: ClientFactory = Arc::new(|profile: &BackendProfile| {
            Ok(Arc::new(HttpLlmClient::new(profile.clone())) as Arc<dyn LlmClient>)
        });
        Self::new(config, client, factory, registry, mcp, persistence, system_prompt)
    }

    /// Shared state handle, for front-ends that render history directly.
    pub fn state(&self) -> Shared {
        self.state.clone()
    }

    /// Token for aborting the in-flight turn. Re-fetch per turn: a
    /// tripped token is replaced when the next turn starts.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run one user turn to completion.
    pub async fn send_message(&mut self, text: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
        let cancel = self.cancel.clone();

        {
            let mut state = self.state.lock().await;
            if state.messages.is_empty() {
                let prompt = self.system_prompt.clone();
                state.messages.push(ChatMessage::system(prompt));
            }
            // A crashed or interrupted prior turn may have left dangling
            // tool_calls; resolve them before the new user message.
            for id in unresolved_tool_call_ids(&state.messages) {
                debug!(tool_call_id = %id, "resolving dangling tool call");
                state.messages.push(ChatMessage::tool_result(id, CANCELLED_RESULT));
            }
            state.messages.push(ChatMessage::user(text));
            state.history.push(ChatEntry::new(EntryKind::User, text));

            if self.evaluate_tokens(&mut state).await {
                // The clear wiped the user message along with the rest.
                state.messages.push(ChatMessage::user(text));
                state.history.push(ChatEntry::new(EntryKind::User, text));
            }
        }

        let mut round: usize = 0;
        let mut continued_once = false;
        loop {
            let message = match self.request_response(&cancel).await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    // Cancelled mid-stream; nothing was appended yet.
                    let mut state = self.state.lock().await;
                    state.push_system_now("Cancelled by user.");
                    self.events.send(LoopEvent::Cancelled).ok();
                    break;
                }
                Err(e) => {
                    let text = format!("Error: {e}");
                    let mut state = self.state.lock().await;
                    state.messages.push(ChatMessage::assistant(text.clone()));
                    state.history.push(ChatEntry::new(EntryKind::Assistant, text));
                    self.events.send(LoopEvent::Error { error: e.to_string() }).ok();
                    break;
                }
            };

            if message.tool_calls.is_empty() {
                let content = message.content_text().trim().to_string();
                {
                    let mut state = self.state.lock().await;
                    state.messages.push(ChatMessage::assistant(content.clone()));
                    let index = state.history.len();
                    state.history.push(ChatEntry::new(EntryKind::Assistant, content.clone()));
                    if let Some(rephrase) = state.rephrase.as_mut() {
                        if rephrase.new_response_index.is_none() {
                            rephrase.new_response_index = Some(index);
                        }
                        state.rephrase = None;
                    }
                }
                self.events
                    .send(LoopEvent::AssistantMessage { content: content.clone() })
                    .ok();

                // A short or empty answer after tool work often means the
                // model stopped mid-thought; give it one more round.
                if content.len() <= self.config.short_response_threshold && !continued_once {
                    debug!(chars = content.len(), "short response, requesting continuation");
                    continued_once = true;
                    continue;
                }
                self.events
                    .send(LoopEvent::TurnComplete { round, has_more: false })
                    .ok();
                break;
            }

            round += 1;
            if round > self.config.max_rounds {
                warn!(limit = self.config.max_rounds, "tool round ceiling reached");
                let mut state = self.state.lock().await;
                state.push_system_now(format!(
                    "Stopped after {} tool-calling rounds without a final answer.",
                    self.config.max_rounds
                ));
                self.events
                    .send(LoopEvent::RoundLimitReached { limit: self.config.max_rounds })
                    .ok();
                break;
            }

            match self.run_tool_round(message, round, &cancel).await {
                RoundControl::Continue => continue,
                RoundControl::Stop => break,
            }
        }

        {
            let state = self.state.lock().await;
            if let Err(e) = self.persistence.save_messages(&state.messages).await {
                warn!("failed to persist messages: {}", e);
            }
            if let Err(e) = self
                .persistence
                .save_context(&self.system_prompt, &state.history, &state.session)
                .await
            {
                warn!("failed to persist context: {}", e);
            }
        }
        self.events.send(LoopEvent::Finished).ok();
        Ok(())
    }

    /// One backend request, streamed or not. `Ok(None)` means the stream
    /// was cancelled before completing.
    async fn request_response(&self, cancel: &CancellationToken) -> Result<Option<ChatMessage>> {
        let (mut request, prefill) = {
            let mut state = self.state.lock().await;
            let prefill = state.prefill.take();
            (state.messages.clone(), prefill)
        };
        if let Some(prefill) = &prefill {
            request.push(ChatMessage::assistant(prefill.clone()));
        }

        let client = self.client.read().await.clone();
        let tools = if client.supports_tools() {
            let schemas = self.collect_tools().await;
            (!schemas.is_empty()).then_some(schemas)
        } else {
            None
        };
        let options = CallOptions { tools, temperature: None, max_tokens: None };

        let mut message = if self.config.stream {
            let mut receiver = client.chat_stream(&request, &options).await?;
            let mut accumulator = StreamAccumulator::new();
            let message = loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(None),
                    event = receiver.recv() => match event {
                        Some(StreamEvent::Delta(delta)) => {
                            let seen = accumulator.visible_text().len();
                            accumulator.push_delta(&delta);
                            let visible = accumulator.visible_text();
                            if visible.len() > seen {
                                self.events
                                    .send(LoopEvent::TextDelta { delta: visible[seen..].to_string() })
                                    .ok();
                            }
                        }
                        Some(StreamEvent::Usage(_)) => {}
                        Some(StreamEvent::Error(error)) => return Err(anyhow!(error)),
                        Some(StreamEvent::Done) | None => break accumulator.finish(),
                    }
                }
            };
            message
        } else {
            // The client retries 429s itself; no second retry layer here.
            let response = client.chat(&request, &options).await?;
            let choice = response
                .choices
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("response carried no choices"))?;
            let mut message = choice.message;
            // The accumulator handles XML tool calls on the streaming
            // path; mirror it here for non-streamed content.
            if message.tool_calls.is_empty() {
                if let Some(content) = message.content.clone() {
                    let (visible, calls) = extract_xml_tool_calls(&content);
                    if !calls.is_empty() {
                        message.tool_calls = calls;
                        message.content =
                            (!visible.trim().is_empty()).then(|| visible.trim().to_string());
                    }
                }
            }
            message
        };

        if let Some(prefill) = prefill {
            let rest = message.content.take().unwrap_or_default();
            message.content = Some(format!("{prefill}{rest}"));
        }
        Ok(Some(message))
    }

    async fn collect_tools(&self) -> Vec<ToolSchema> {
        let mut schemas = self.registry.schemas();
        if let Some(mcp) = &self.mcp {
            match mcp.get_tools().await {
                Ok(mcp_schemas) => schemas.extend(mcp_schemas),
                Err(e) => warn!("MCP tool listing failed: {}", e),
            }
        }
        schemas
    }

    /// Execute one round of tool calls in model order.
    async fn run_tool_round(
        &mut self,
        mut message: ChatMessage,
        round: usize,
        cancel: &CancellationToken,
    ) -> RoundControl {
        let mut warnings: Vec<String> = Vec::new();
        let mut sanitized_args: HashMap<String, Map<String, Value>> = HashMap::new();
        for call in &mut message.tool_calls {
            let repaired = sanitizer::sanitize(&call.function.arguments);
            for warning in &repaired.warnings {
                warnings.push(format!("{}: {}", call.function.name, warning));
            }
            call.function.arguments = Value::Object(repaired.args.clone()).to_string();
            sanitized_args.insert(call.id.clone(), repaired.args);
        }

        let content = message
            .content
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| TOOL_CONTENT_PLACEHOLDER.to_string());
        let calls = message.tool_calls.clone();

        {
            let mut state = self.state.lock().await;
            state.pending_system.append(&mut warnings);
            state
                .messages
                .push(ChatMessage::assistant_with_tools(Some(content.clone()), calls.clone()));
            if content != TOOL_CONTENT_PLACEHOLDER {
                state.history.push(ChatEntry::new(EntryKind::Assistant, content.clone()));
                self.events
                    .send(LoopEvent::AssistantMessage { content: content.clone() })
                    .ok();
            }
            for call in &calls {
                state.history.push(ChatEntry::tool_call(
                    &call.id,
                    &call.function.name,
                    &call.function.arguments,
                ));
                let arguments = serde_json::from_str(&call.function.arguments)
                    .unwrap_or(Value::Null);
                self.events
                    .send(LoopEvent::ToolCallStart {
                        id: call.id.clone(),
                        name: call.function.name.clone(),
                        arguments,
                    })
                    .ok();
            }
        }

        let mut executions: Vec<(String, String, ToolOutcome)> = Vec::new();
        let mut cancelled = false;
        for (position, call) in calls.iter().enumerate() {
            if cancel.is_cancelled() {
                let mut state = self.state.lock().await;
                for remaining in &calls[position..] {
                    state
                        .messages
                        .push(ChatMessage::tool_result(&remaining.id, CANCELLED_RESULT));
                    complete_history_entry(
                        &mut state,
                        &remaining.id,
                        &ToolOutcome::error(CANCELLED_RESULT),
                    );
                }
                cancelled = true;
                break;
            }

            let args = sanitized_args.remove(&call.id).unwrap_or_default();
            let outcome = self.execute_tool(call, args).await;
            let result_text = truncate_output(&outcome.result_text());

            let mut state = self.state.lock().await;
            state
                .messages
                .push(ChatMessage::tool_result(&call.id, result_text.clone()));
            complete_history_entry(&mut state, &call.id, &outcome);
            drop(state);

            self.events
                .send(LoopEvent::ToolResult {
                    id: call.id.clone(),
                    output: result_text,
                    is_error: !outcome.success,
                })
                .ok();
            executions.push((
                call.function.name.clone(),
                call.function.arguments.clone(),
                outcome,
            ));
        }

        let mut state = self.state.lock().await;
        state.flush_pending_system();

        if cancelled {
            state.push_system_now("Cancelled by user.");
            self.events.send(LoopEvent::Cancelled).ok();
            return RoundControl::Stop;
        }

        if let Some(diagnostic) =
            detect_repeated_failures(&mut self.failure_counters, &executions)
        {
            info!("stopping turn: {}", diagnostic);
            state.push_system_now(diagnostic.clone());
            self.events.send(LoopEvent::SystemNotice { message: diagnostic }).ok();
            return RoundControl::Stop;
        }

        // Tool results can be large; re-run the usage ladder before the
        // next request instead of waiting for the next user message.
        if self.evaluate_tokens(&mut state).await {
            state.push_system_now(
                "Context was cleared mid-task after exceeding the token window. Continue from here.",
            );
        }

        self.events
            .send(LoopEvent::TurnComplete { round, has_more: true })
            .ok();
        RoundControl::Continue
    }

    /// Validate, gate through the approval hook, and run one tool call.
    async fn execute_tool(&self, call: &ToolCall, args: Map<String, Value>) -> ToolOutcome {
        let name = &call.function.name;
        self.events
            .send(LoopEvent::ToolExecuting { id: call.id.clone(), name: name.clone() })
            .ok();

        if let Some(schema) = self.schema_for(name).await {
            if let Some(error) = sanitizer::validate(name, &args, &schema) {
                return ToolOutcome::error(error);
            }
        }

        if let Some(hook) = &self.config.hooks.tool_approval {
            let arguments = Value::Object(args.clone());
            let session_env = {
                let state = self.state.lock().await;
                session_env_params(&state.session.env)
            };
            let result = run_tool_approval_hook(
                hook,
                name,
                &arguments,
                &session_env,
                self.config.hook_timeout(),
            )
            .await;
            // A rejecting hook's commands still apply.
            self.hooks
                .apply_hook_result(&result, None, new_executed_calls(), 0)
                .await;
            if !result.approved {
                let reason = result
                    .reason
                    .unwrap_or_else(|| "rejected by approval hook".to_string());
                return ToolOutcome::error(format!("Tool call rejected: {reason}"));
            }
        }

        if let Some(server) = mcp_server_for_tool(name) {
            let Some(mcp) = &self.mcp else {
                return ToolOutcome::error(format!("no MCP manager available for {name}"));
            };
            match mcp.call_tool(name, Value::Object(args)).await {
                Ok(outcome) => {
                    if outcome.success {
                        mcp.invalidate_cache(server).await;
                    }
                    outcome
                }
                Err(e) => ToolOutcome::error(format!("MCP call failed: {e}")),
            }
        } else {
            self.registry.execute(name, Value::Object(args)).await
        }
    }

    async fn schema_for(&self, name: &str) -> Option<ToolSchema> {
        if let Some(schema) = self.registry.schema(name) {
            return Some(schema);
        }
        let mcp = self.mcp.as_ref()?;
        match mcp.get_tools().await {
            Ok(schemas) => schemas.into_iter().find(|s| s.name == name),
            Err(_) => None,
        }
    }

    /// Run the usage ladder. Returns true when a clear happened.
    async fn evaluate_tokens(&self, state: &mut SharedState) -> bool {
        let mut cleared = false;
        for event in state.tokens.evaluate(&state.messages) {
            match event {
                UsageEvent::Warning(text) => {
                    state.push_system_now(text.clone());
                    self.events.send(LoopEvent::SystemNotice { message: text }).ok();
                }
                UsageEvent::ClearRequired => {
                    if let Err(e) = self.persistence.backup_history().await {
                        warn!("history backup before auto-clear failed: {}", e);
                    }
                    let prompt = self.system_prompt.clone();
                    state.clear_context(&prompt);
                    if let Err(e) = self
                        .persistence
                        .save_context(&self.system_prompt, &state.history, &state.session)
                        .await
                    {
                        warn!("context save after auto-clear failed: {}", e);
                    }
                    self.events.send(LoopEvent::CacheCleared).ok();
                    cleared = true;
                }
            }
        }
        state.session.token_usage = state.tokens.usage_percent() as usize;
        cleared
    }

    /// Explicit context clear, with a history backup first.
    pub async fn clear_cache(&mut self) -> Result<()> {
        if let Err(e) = self.persistence.backup_history().await {
            warn!("history backup failed: {}", e);
        }
        let mut state = self.state.lock().await;
        let prompt = self.system_prompt.clone();
        state.clear_context(&prompt);
        state.session.token_usage = 0;
        self.persistence
            .save_context(&self.system_prompt, &state.history, &state.session)
            .await?;
        self.events.send(LoopEvent::CacheCleared).ok();
        Ok(())
    }

    pub async fn set_persona(&mut self, value: &str) -> Result<bool> {
        self.change_session_value("set_persona", "OTTO_PERSONA", value, SessionField::Persona)
            .await
    }

    pub async fn set_mood(&mut self, value: &str) -> Result<bool> {
        self.change_session_value("set_mood", "OTTO_MOOD", value, SessionField::Mood)
            .await
    }

    pub async fn set_active_task(&mut self, value: &str) -> Result<bool> {
        self.change_session_value(
            "set_active_task",
            "OTTO_ACTIVE_TASK",
            value,
            SessionField::ActiveTask,
        )
        .await
    }

    /// Gate a session-state change through the state-change hook. The
    /// hook can reject it, transform the value by assigning the watched
    /// env key, or piggyback a backend/model switch; the change itself
    /// commits only if everything the hook asked for succeeded.
    async fn change_session_value(
        &mut self,
        operation: &str,
        env_key: &str,
        value: &str,
        field: SessionField,
    ) -> Result<bool> {
        let mut committed = value.to_string();

        if let Some(hook) = self.config.hooks.state_change.clone() {
            // Session env first so the explicit params win on collision.
            let mut params = {
                let state = self.state.lock().await;
                session_env_params(&state.session.env)
            };
            params.push(("OTTO_STATE_KEY".to_string(), env_key.to_string()));
            params.push(("OTTO_NEW_VALUE".to_string(), value.to_string()));
            let result = run_operation_hook(
                &hook,
                operation,
                &params,
                self.config.hook_timeout(),
                false,
            )
            .await;
            let outcome = self
                .hooks
                .apply_hook_result(&result, Some(env_key), new_executed_calls(), 0)
                .await;

            if !result.approved {
                let reason = result.reason.unwrap_or_else(|| "rejected".to_string());
                let notice = format!("{operation} rejected: {reason}");
                let mut state = self.state.lock().await;
                state.flush_pending_system();
                state.push_system_now(notice.clone());
                self.events.send(LoopEvent::SystemNotice { message: notice }).ok();
                return Ok(false);
            }
            if !outcome.success {
                // The hook coupled this change to a switch that failed
                // validation; the pending change must not apply.
                let mut state = self.state.lock().await;
                state.flush_pending_system();
                return Ok(false);
            }
            if let Some(transformed) = outcome.transformed_value {
                committed = transformed;
            }
        }

        let mut state = self.state.lock().await;
        match field {
            SessionField::Persona => state.session.persona = Some(committed.clone()),
            SessionField::Mood => state.session.mood = Some(committed.clone()),
            SessionField::ActiveTask => {
                state.session.active_task = Some(committed.clone());
                state.session.task_status = TaskStatus::Active;
            }
        }
        state.session.env.insert(env_key.to_string(), committed);
        state.flush_pending_system();
        Ok(true)
    }

    /// Run the startup hook once, applying anything it emits.
    pub async fn run_startup_hook(&mut self) -> Result<()> {
        let Some(hook) = self.config.hooks.startup.clone() else {
            return Ok(());
        };
        let params = {
            let state = self.state.lock().await;
            session_env_params(&state.session.env)
        };
        let result =
            run_operation_hook(&hook, "startup", &params, self.config.hook_timeout(), false).await;
        let outcome = self
            .hooks
            .apply_hook_result(&result, None, new_executed_calls(), 0)
            .await;
        if let Some(output) = outcome.output {
            self.events.send(LoopEvent::SystemNotice { message: output }).ok();
        }
        let mut state = self.state.lock().await;
        state.flush_pending_system();
        Ok(())
    }

    /// Redo the last assistant response with an instruction, tracking
    /// which entry is being replaced until the new one lands.
    pub async fn rephrase_last(&mut self, instruction: &str) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            let Some(original) = state
                .history
                .iter()
                .rposition(|entry| entry.kind == EntryKind::Assistant)
            else {
                anyhow::bail!("no assistant response to rephrase");
            };
            state.rephrase = Some(RephraseState {
                original_assistant_index: original,
                rephrase_request_index: state.history.len(),
                new_response_index: None,
                message_kind: EntryKind::Assistant,
            });
        }
        self.send_message(instruction).await
    }

    /// Persist everything; called on graceful shutdown.
    pub async fn shutdown(&self) -> Result<()> {
        let state = self.state.lock().await;
        self.persistence.save_messages(&state.messages).await?;
        self.persistence
            .save_context(&self.system_prompt, &state.history, &state.session)
            .await?;
        Ok(())
    }
}

fn complete_history_entry(state: &mut SharedState, call_id: &str, outcome: &ToolOutcome) {
    let entry = state
        .history
        .iter_mut()
        .rev()
        .find(|entry| entry.kind == EntryKind::ToolCall && entry.tool_call_id.as_deref() == Some(call_id));
    if let Some(entry) = entry {
        entry.complete_tool(ToolResultInfo {
            success: outcome.success,
            output: outcome.output.clone(),
            error: outcome.error.clone(),
            display_output: outcome.display_output.clone(),
        });
    }
}
