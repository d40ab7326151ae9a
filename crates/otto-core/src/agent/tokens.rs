//! Context-window accounting
//!
//! Tracks approximate token usage of the message list against a fixed
//! per-backend window and drives the 80/90/95/100 percent warning
//! ladder. The 80 and 90 percent warnings fire once per epoch; an epoch
//! ends at every cache clear.

use crate::ai::types::ChatMessage;

/// Fixed context windows per backend. No dynamic negotiation.
const CONTEXT_WINDOWS: &[(&str, usize)] = &[
    ("openai", 128_000),
    ("anthropic", 200_000),
    ("mistral", 128_000),
    ("groq", 131_072),
    ("ollama", 32_768),
];

const DEFAULT_CONTEXT_WINDOW: usize = 128_000;

/// Rough chars-per-token divisor plus fixed per-item overheads.
const CHARS_PER_TOKEN: usize = 4;
const PER_MESSAGE_OVERHEAD: usize = 4;
const PER_TOOL_CALL_OVERHEAD: usize = 8;

/// What the engine must do after a usage evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageEvent {
    /// Append this warning as a system message to both lists.
    Warning(String),
    /// Usage reached 100%: clear the cache now. No duplicate warning is
    /// emitted for this evaluation.
    ClearRequired,
}

pub struct TokenAccounting {
    max_tokens: usize,
    current: usize,
    warned_80: bool,
    warned_90: bool,
}

impl TokenAccounting {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            current: 0,
            warned_80: false,
            warned_90: false,
        }
    }

    pub fn for_backend(backend: &str) -> Self {
        Self::new(context_window_for(backend))
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn set_max_tokens(&mut self, max_tokens: usize) {
        self.max_tokens = max_tokens.max(1);
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn usage_percent(&self) -> f64 {
        self.current as f64 / self.max_tokens as f64 * 100.0
    }

    /// Heuristic token count for a message list.
    pub fn count_message_tokens(messages: &[ChatMessage]) -> usize {
        messages
            .iter()
            .map(|m| {
                let mut chars = m.content_text().len();
                for call in &m.tool_calls {
                    chars += call.function.name.len() + call.function.arguments.len();
                    chars += PER_TOOL_CALL_OVERHEAD * CHARS_PER_TOKEN;
                }
                chars / CHARS_PER_TOKEN + PER_MESSAGE_OVERHEAD
            })
            .sum()
    }

    /// Recount usage and report what crossed. Called after every mutation
    /// of the message list.
    pub fn evaluate(&mut self, messages: &[ChatMessage]) -> Vec<UsageEvent> {
        self.current = Self::count_message_tokens(messages);
        let percent = self.usage_percent();
        let mut events = Vec::new();

        if percent >= 100.0 {
            events.push(UsageEvent::ClearRequired);
            return events;
        }

        if percent >= 80.0 && !self.warned_80 {
            self.warned_80 = true;
            events.push(UsageEvent::Warning(format!(
                "Context window at {:.0}% ({} of {} tokens). Older history will be cleared at 100%.",
                percent, self.current, self.max_tokens
            )));
        }
        if percent >= 90.0 && !self.warned_90 {
            self.warned_90 = true;
            events.push(UsageEvent::Warning(format!(
                "Context window at {:.0}%: approaching the limit, consider wrapping up.",
                percent
            )));
        }
        if percent >= 95.0 {
            events.push(UsageEvent::Warning(format!(
                "Context window critically full ({:.1}%). The next few messages may trigger an automatic clear.",
                percent
            )));
        }

        events
    }

    /// Epoch boundary: a cache clear resets the one-shot flags.
    pub fn note_cleared(&mut self) {
        self.warned_80 = false;
        self.warned_90 = false;
        self.current = 0;
    }
}

pub fn context_window_for(backend: &str) -> usize {
    let lower = backend.to_ascii_lowercase();
    CONTEXT_WINDOWS
        .iter()
        .find(|(name, _)| lower.contains(name))
        .map(|(_, window)| *window)
        .unwrap_or(DEFAULT_CONTEXT_WINDOW)
}
