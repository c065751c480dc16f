//! Context window budgeting (SPEC_FULL supplement #1/#2): a token estimator
//! the Compaction engine uses to decide what to summarize, and an optional
//! per-turn execution-limits guard layered under the Agent Loop.

use crate::types::{Message, Part};

/// Rough token estimate: ~4 chars per token. Good enough for budgeting, not
/// for precision — a real tokenizer is a host-binary concern.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() + 3) / 4
}

pub fn message_tokens(msg: &Message) -> usize {
    let parts_tokens: usize = msg
        .parts
        .iter()
        .map(|p| match p {
            Part::Text { text } => estimate_tokens(text),
            Part::Image { .. } => 1000,
            Part::ToolCall { name, arguments, .. } => {
                estimate_tokens(name) + estimate_tokens(&arguments.to_string()) + 8
            }
            Part::ToolResult { output, .. } => estimate_tokens(&serde_json::to_string(output).unwrap_or_default()),
        })
        .sum();
    parts_tokens + 4
}

pub fn total_tokens(messages: &[Message]) -> usize {
    messages.iter().map(message_tokens).sum()
}

/// Naive, dependency-free summary of a message slice: one line per message
/// carrying text, truncated. The Compaction engine and `switchBranch`'s
/// `summarize` option both call this rather than a real model — the
/// core has no opinion on summarization quality, only on where the summary
/// is plugged in (the Checkpoint's `summary` field, or the peer branch's
/// `summary` field).
pub fn summarize_messages(messages: &[Message]) -> String {
    messages
        .iter()
        .filter_map(|m| {
            let text = m.text();
            if text.is_empty() {
                None
            } else {
                let first_line: String = text.lines().next().unwrap_or("").chars().take(200).collect();
                Some(format!("{}: {}", m.role, first_line))
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Picks the prefix of `messages` (from the end) the Compaction engine
/// should keep verbatim, given a token budget for the kept tail. Everything
/// before the returned index is a candidate for summarization.
pub fn first_kept_index(messages: &[Message], keep_tokens_budget: usize) -> usize {
    let mut budget = keep_tokens_budget;
    let mut index = messages.len();
    for msg in messages.iter().rev() {
        let tokens = message_tokens(msg);
        if tokens > budget && index < messages.len() {
            break;
        }
        budget = budget.saturating_sub(tokens);
        index -= 1;
    }
    index
}

/// Optional, opt-in safety net layered under the Agent Loop's per-turn
/// algorithm (checked alongside the steering drain at the top of each
/// inner-loop iteration). There is no turn-level timeout by default;
/// this is a guard the caller opts into.
#[derive(Debug, Clone)]
pub struct ExecutionLimits {
    pub max_turns: usize,
    pub max_total_tokens: usize,
    pub max_duration: std::time::Duration,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_turns: 50,
            max_total_tokens: 1_000_000,
            max_duration: std::time::Duration::from_secs(600),
        }
    }
}

pub struct ExecutionTracker {
    limits: ExecutionLimits,
    turns: usize,
    tokens_used: usize,
    started_at: std::time::Instant,
}

impl ExecutionTracker {
    pub fn new(limits: ExecutionLimits) -> Self {
        Self {
            limits,
            turns: 0,
            tokens_used: 0,
            started_at: std::time::Instant::now(),
        }
    }

    pub fn record_turn(&mut self, tokens: usize) {
        self.turns += 1;
        self.tokens_used += tokens;
    }

    pub fn check_limits(&self) -> Option<String> {
        if self.turns >= self.limits.max_turns {
            return Some(format!("max turns reached ({}/{})", self.turns, self.limits.max_turns));
        }
        if self.tokens_used >= self.limits.max_total_tokens {
            return Some(format!(
                "max tokens reached ({}/{})",
                self.tokens_used, self.limits.max_total_tokens
            ));
        }
        let elapsed = self.started_at.elapsed();
        if elapsed >= self.limits.max_duration {
            return Some(format!(
                "max duration reached ({:.0}s/{:.0}s)",
                elapsed.as_secs_f64(),
                self.limits.max_duration.as_secs_f64()
            ));
        }
        None
    }
}
