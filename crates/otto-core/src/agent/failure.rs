//! Repeated tool failure detection.
//!
//! Tracks tool error signatures across rounds and triggers a fail-fast
//! when the same tool keeps failing with the same error, preventing
//! infinite retry loops.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::tools::ToolOutcome;

/// Stop after this many identical failures.
pub const REPEATED_FAILURE_THRESHOLD: usize = 2;

/// Feed one round's results in. Returns a diagnostic message when the
/// same tool+error signature has been seen `REPEATED_FAILURE_THRESHOLD`
/// or more times. On any success, all counters clear (the agent
/// recovered).
pub fn detect_repeated_failures(
    counters: &mut HashMap<String, usize>,
    executions: &[(String, String, ToolOutcome)],
) -> Option<String> {
    let mut saw_success = false;
    let mut diagnostic = None;

    for (name, arguments, outcome) in executions {
        if outcome.success {
            saw_success = true;
            continue;
        }

        let error = outcome.error.as_deref().unwrap_or("");
        let signature = format!(
            "{}|{}|{}",
            name,
            fingerprint(error),
            fingerprint(arguments)
        );
        let count = counters
            .entry(signature)
            .and_modify(|c| *c += 1)
            .or_insert(1);

        if *count >= REPEATED_FAILURE_THRESHOLD && diagnostic.is_none() {
            diagnostic = Some(format!(
                "Stopping tool loop: '{}' failed {} times with the same error. A different strategy is required.",
                name, *count
            ));
        }
    }

    if saw_success {
        counters.clear();
        return None;
    }
    diagnostic
}

fn fingerprint(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    // First line is the stable part of most error strings.
    text.lines().next().unwrap_or("").hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(name: &str, error: &str) -> (String, String, ToolOutcome) {
        (
            name.to_string(),
            "{}".to_string(),
            ToolOutcome::error(error),
        )
    }

    #[test]
    fn identical_failures_trip_the_detector() {
        let mut counters = HashMap::new();
        assert!(detect_repeated_failures(&mut counters, &[failure("edit", "no such file")]).is_none());
        let diagnostic =
            detect_repeated_failures(&mut counters, &[failure("edit", "no such file")]);
        assert!(diagnostic.unwrap().contains("edit"));
    }

    #[test]
    fn success_resets_counters() {
        let mut counters = HashMap::new();
        detect_repeated_failures(&mut counters, &[failure("edit", "no such file")]);
        detect_repeated_failures(
            &mut counters,
            &[(
                "edit".to_string(),
                "{}".to_string(),
                ToolOutcome::success("ok"),
            )],
        );
        assert!(counters.is_empty());
    }

    #[test]
    fn different_errors_do_not_accumulate() {
        let mut counters = HashMap::new();
        detect_repeated_failures(&mut counters, &[failure("edit", "no such file")]);
        let diagnostic = detect_repeated_failures(&mut counters, &[failure("edit", "permission denied")]);
        assert!(diagnostic.is_none());
    }
}
