//! Agent loop and its supporting pieces.

pub mod accumulator;
pub mod engine;
pub mod events;
pub mod failure;
pub mod history;
pub mod sanitizer;
pub mod state;
pub mod tokens;

pub use engine::{Engine, CANCELLED_RESULT};
pub use events::LoopEvent;
pub use history::{ChatEntry, EntryKind, RephraseState, ToolResultInfo};
pub use state::{Shared, SharedState};
pub use tokens::{TokenAccounting, UsageEvent};
