//! Token estimation and turn-atomic context truncation.
//!
//! The estimator is a deliberate over-approximation: UTF-8 bytes divided by a
//! fixed ratio, rounded up, plus a flat per-message overhead. It does not
//! match any real tokenizer; it only needs to bound the worst case so a
//! truncated context never overflows the upstream window.

use relay_types::Message;

/// Conservative bytes-per-token ratio for the estimate.
const BYTES_PER_TOKEN: u32 = 4;

/// Flat overhead per message for role markers and delimiters.
const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

/// Extra framing cost charged for the pinned system anchor.
const SYSTEM_ANCHOR_OVERHEAD_TOKENS: u32 = 8;

pub const MIN_CONTEXT_BUDGET: u32 = 256;
pub const MAX_CONTEXT_BUDGET: u32 = 1_000_000;

/// Vendor-agnostic token estimator.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenEstimator;

impl TokenEstimator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// ceil(UTF-8 byte length / ratio).
    #[must_use]
    pub fn estimate_str(&self, text: &str) -> u32 {
        let bytes = u32::try_from(text.len()).unwrap_or(u32::MAX);
        bytes.div_ceil(BYTES_PER_TOKEN)
    }

    /// Content plus role plus serialized tool payloads plus flat overhead.
    #[must_use]
    pub fn estimate_message(&self, msg: &Message) -> u32 {
        let role_tokens = self.estimate_str(msg.role_str());
        let content_tokens = self.estimate_str(msg.content());
        let tool_tokens: u32 = msg
            .tool_calls()
            .iter()
            .map(|call| {
                let args = serde_json::to_string(&call.arguments).unwrap_or_default();
                self.estimate_str(&call.name)
                    + self.estimate_str(&call.id)
                    + self.estimate_str(&args)
            })
            .sum();

        role_tokens + content_tokens + tool_tokens + MESSAGE_OVERHEAD_TOKENS
    }
}

#[derive(Debug)]
pub struct Truncation {
    pub messages: Vec<Message>,
    pub used_tokens: u32,
    /// Messages dropped from the front, for observability.
    pub dropped: usize,
}

/// Select a trailing, turn-atomic subset of `history` that fits `budget`.
///
/// The most recent `system` message is pinned as an anchor and always
/// included. The rest is partitioned into turns - a turn starts at a `user`
/// message and runs until the next one, keeping an assistant's
/// tool-call/tool-result chain atomic (splitting it would produce an invalid
/// upstream request). Turns are kept newest-first while they fit; the newest
/// turn is kept unconditionally so there is always something to send.
#[must_use]
pub fn truncate(history: &[Message], budget: u32) -> Truncation {
    let budget = budget.clamp(MIN_CONTEXT_BUDGET, MAX_CONTEXT_BUDGET);
    let estimator = TokenEstimator::new();

    let anchor_index = history.iter().rposition(Message::is_system);
    let anchor = anchor_index.map(|i| &history[i]);

    let remaining: Vec<&Message> = history
        .iter()
        .enumerate()
        .filter(|(i, _)| Some(*i) != anchor_index)
        .map(|(_, msg)| msg)
        .collect();

    let turns = partition_turns(&remaining);

    let mut used: u32 = anchor.map_or(0, |msg| {
        estimator.estimate_message(msg) + SYSTEM_ANCHOR_OVERHEAD_TOKENS
    });

    // Walk newest to oldest; the newest turn is unconditional, older turns
    // are kept only while the running total stays within budget. No
    // backfilling past the first overflow.
    let mut included = Vec::new();
    for (i, turn) in turns.iter().enumerate().rev() {
        let cost: u32 = turn
            .iter()
            .map(|msg| estimator.estimate_message(msg))
            .sum();
        let is_newest = i == turns.len() - 1;
        if !is_newest && used.saturating_add(cost) > budget {
            break;
        }
        used = used.saturating_add(cost);
        included.push(i);
    }
    included.reverse();

    let mut messages = Vec::new();
    if let Some(anchor) = anchor {
        messages.push(anchor.clone());
    }
    for i in &included {
        messages.extend(turns[*i].iter().map(|msg| (*msg).clone()));
    }

    let kept: usize = included.iter().map(|i| turns[*i].len()).sum();
    let dropped = remaining.len() - kept;

    Truncation {
        messages,
        used_tokens: used,
        dropped,
    }
}

/// Group messages into turns: each `user` message opens a turn that absorbs
/// every following non-`user` message. Anything before the first `user`
/// message forms its own leading group.
fn partition_turns<'a>(messages: &[&'a Message]) -> Vec<Vec<&'a Message>> {
    let mut turns: Vec<Vec<&'a Message>> = Vec::new();
    for msg in messages {
        if msg.is_user() || turns.is_empty() {
            turns.push(vec![msg]);
        } else {
            turns.last_mut().expect("non-empty turns").push(msg);
        }
    }
    turns
}
