//! otto-core: the conversation engine behind the otto coding assistant.
//!
//! The engine drives a multi-round tool-calling loop over any
//! OpenAI-compatible backend, with external hook scripts gating tool
//! approval and session-state changes, transactional backend/model
//! switching, and token-budget monitoring with automatic context
//! clearing.

pub mod agent;
pub mod ai;
pub mod config;
pub mod hooks;
pub mod mcp;
pub mod persist;
pub mod session;
pub mod tools;

pub use agent::{Engine, LoopEvent};
pub use config::EngineConfig;
pub use session::SessionState;
