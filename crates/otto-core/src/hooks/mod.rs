//! User hooks: external executables that gate and extend agent
//! operations through an env-in/stdout-out command protocol.

pub mod commands;
pub mod orchestrator;
pub mod switch;

pub use commands::{AppliedCommands, ConditionKind, HookCommand};
pub use orchestrator::{
    dispatch_calls, new_executed_calls, run_operation_hook, run_tool_approval_hook,
    session_env_params, ApplyOutcome, ExecutedCalls, HookOrchestrator, HookResult, MAX_CALL_DEPTH,
};
pub use switch::{SwitchOutcome, SwitchRequest, SwitchValidator};
