//! Context assembly under a token budget.
//!
//! Assembly order is fixed: [system prompt] → [recalled memory block] →
//! [summary, when present] → [preserved head] → [middle] → [preserved tail]
//! → [current user turn]. The summary and any pruning come from the
//! compressor; this module owns budgeting, token estimation, and the
//! oversize-user-message ellipsis.

use rv_domain::config::ContextConfig;
use rv_domain::error::Result;
use rv_domain::message::{Message, Role};
use rv_domain::state::AgentState;

use crate::compress::{region, Compressor};
use crate::score::score_message;

/// One canonical approximation: ~4 chars per token plus per-message overhead.
pub fn estimate_tokens(text: &str) -> u32 {
    ((text.len() + 3) / 4) as u32
}

/// Token estimate for a message, cached on the message itself.
pub fn message_tokens(msg: &mut Message) -> u32 {
    if let Some(cached) = msg.token_count {
        return cached;
    }
    let mut chars = msg.text().len();
    for tc in &msg.tool_calls {
        chars += tc.name.len() + tc.arguments.to_string().len();
    }
    let tokens = ((chars + 3) / 4) as u32 + 4;
    msg.token_count = Some(tokens);
    tokens
}

/// Result of one BUILD_CONTEXT pass.
pub struct BuiltContext {
    pub prompt: Vec<Message>,
    pub tokens: u32,
    pub truncated: bool,
}

pub struct ContextManager {
    config: ContextConfig,
}

impl ContextManager {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    /// Prompt budget: context window minus the output reservation.
    pub fn budget(&self) -> u32 {
        self.config
            .context_window_tokens
            .saturating_sub(self.config.output_reserve_tokens)
    }

    /// Token budget for the recalled-memory block.
    pub fn recall_budget(&self) -> u32 {
        let after_reserve = self.budget().saturating_sub(self.config.system_reserve_tokens);
        (after_reserve as f32 * self.config.recall_budget_ratio) as u32
    }

    /// Assemble the prompt for the next LLM call. May invoke the compressor
    /// (one summarization LLM call) when the estimate crosses the trigger
    /// ratio; compression mutates `state`, everything else is prompt-local.
    pub async fn build(
        &self,
        state: &mut AgentState,
        compressor: &Compressor,
        model: &str,
    ) -> Result<BuiltContext> {
        let budget = self.budget();
        let mut truncated = false;

        // ── Compression trigger ───────────────────────────────────
        let recall_tokens = self.recalled_block_tokens(state);
        let history_tokens: u32 = state.messages.iter_mut().map(message_tokens).sum();
        let estimate = history_tokens + recall_tokens;
        let trigger = (budget as f32 * self.config.compression_trigger_ratio) as u32;
        if estimate > trigger {
            match compressor.compress(state, model).await {
                Ok(did) => truncated |= did,
                Err(e) => {
                    tracing::warn!(error = %e, "compression failed, continuing with full history");
                }
            }
        }

        // ── Assembly ──────────────────────────────────────────────
        // state.messages[0] is the system prompt; the last message is the
        // current user turn when the model hasn't answered it yet.
        let mut prompt: Vec<Message> = Vec::with_capacity(state.messages.len() + 1);
        prompt.push(state.messages[0].clone());

        if let Some(block) = self.recall_block(state) {
            prompt.push(block);
        }

        let has_current_user = state
            .messages
            .last()
            .map(|m| m.role == Role::User)
            .unwrap_or(false)
            && state.messages.len() > 1;
        let history_end = if has_current_user {
            state.messages.len() - 1
        } else {
            state.messages.len()
        };

        let mut history: Vec<Message> = state.messages[1..history_end].to_vec();

        // ── Current user turn: ensured fit ────────────────────────
        let mut current_user = if has_current_user {
            state.messages.last().cloned()
        } else {
            None
        };
        if let Some(user_msg) = &mut current_user {
            let fixed: u32 = prompt.iter_mut().map(message_tokens).sum();
            let user_budget = budget
                .saturating_sub(fixed)
                .saturating_sub(self.config.system_reserve_tokens / 2);
            if message_tokens(user_msg) > user_budget {
                let text = user_msg.text().to_owned();
                user_msg.content = Some(truncate_middle(&text, user_budget));
                user_msg.token_count = None;
                truncated = true;
            }
        }

        // ── History fit: drop middle by score, then tail-inward ───
        let fixed: u32 = prompt.iter_mut().map(message_tokens).sum::<u32>()
            + current_user.as_mut().map(message_tokens).unwrap_or(0);
        let history_budget = budget.saturating_sub(fixed);
        truncated |= self.fit_history(&mut history, history_budget);

        prompt.extend(history);
        if let Some(user_msg) = current_user {
            prompt.push(user_msg);
        }

        let tokens: u32 = prompt.iter_mut().map(message_tokens).sum();
        Ok(BuiltContext {
            prompt,
            tokens,
            truncated,
        })
    }

    /// Drop middle messages (lowest score first) until the history fits.
    ///
    /// Compression never touches the protected head or tail. When those
    /// alone still exceed the budget — the middle is gone and the prompt is
    /// still oversized — the only move left is to drop protected messages,
    /// tail-inward first, then head. Both last-resort paths are logged:
    /// they trade the head/tail guarantee for a prompt the model will
    /// actually accept.
    fn fit_history(&self, history: &mut Vec<Message>, budget: u32) -> bool {
        let total = |msgs: &mut Vec<Message>| -> u32 { msgs.iter_mut().map(message_tokens).sum() };
        if total(history) <= budget {
            return false;
        }

        // Indices here are conversation-relative; prepend a placeholder so
        // region() sees the same shape it does over state.messages.
        let with_system = |h: &Vec<Message>| {
            let mut v = vec![Message::system("")];
            v.extend_from_slice(h);
            v
        };

        // Phase 1: drop middle messages, lowest score first.
        loop {
            let shaped = with_system(history);
            let r = region(
                &shaped,
                self.config.head_preserve_turns,
                self.config.tail_preserve_messages,
            );
            // Map back to history-relative indices.
            let mid_start = r.head_end.saturating_sub(1);
            let mid_end = r.tail_start.saturating_sub(1);
            if mid_start >= mid_end || total(history) <= budget {
                break;
            }

            let victim = (mid_start..mid_end)
                .min_by_key(|&i| {
                    score_message(&history[i], false, false, &self.config.score_keywords)
                })
                .unwrap_or(mid_start);
            history.remove(victim);
        }

        // Phase 2: the protected head and tail alone overflow the budget.
        if total(history) > budget {
            tracing::warn!(
                budget,
                tokens = total(history),
                messages = history.len(),
                "protected head and tail exceed the context budget; \
                 dropping tail-inward as a last resort"
            );
        }
        while total(history) > budget && history.len() > 1 {
            let shaped = with_system(history);
            let r = region(
                &shaped,
                self.config.head_preserve_turns,
                self.config.tail_preserve_messages,
            );
            let tail_start = r.tail_start.saturating_sub(1).min(history.len() - 1);
            history.remove(tail_start);
        }

        if total(history) > budget {
            tracing::warn!(budget, "head alone exceeds the context budget; dropping oldest first");
        }
        while total(history) > budget && !history.is_empty() {
            history.remove(0);
        }
        true
    }

    fn recalled_block_tokens(&self, state: &AgentState) -> u32 {
        state
            .recalled_memories
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .sum()
    }

    /// Render recalled memories as one system message after the prompt.
    fn recall_block(&self, state: &AgentState) -> Option<Message> {
        if state.recalled_memories.is_empty() {
            return None;
        }
        let mut text = String::from("Relevant memories from prior sessions:\n");
        for mem in &state.recalled_memories {
            text.push_str("- ");
            text.push_str(&mem.content);
            text.push('\n');
        }
        Some(Message::system(text))
    }
}

/// Keep the first and last quarters of the allowed size, elide the middle.
fn truncate_middle(text: &str, max_tokens: u32) -> String {
    let max_chars = (max_tokens as usize) * 4;
    if text.len() <= max_chars {
        return text.to_owned();
    }

    let quarter = max_chars / 4;
    let mut head_end = quarter.min(text.len());
    while !text.is_char_boundary(head_end) && head_end > 0 {
        head_end -= 1;
    }
    let mut tail_start = text.len().saturating_sub(quarter);
    while !text.is_char_boundary(tail_start) && tail_start < text.len() {
        tail_start += 1;
    }

    format!(
        "{}\n[... {} chars elided ...]\n{}",
        &text[..head_end],
        text.len() - head_end - (text.len() - tail_start),
        &text[tail_start..]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimates_are_cached_on_the_message() {
        let mut msg = Message::user("abcdefgh");
        let first = message_tokens(&mut msg);
        assert_eq!(first, 2 + 4);
        assert_eq!(msg.token_count, Some(first));
        assert_eq!(message_tokens(&mut msg), first);
    }

    #[test]
    fn truncate_middle_keeps_both_ends() {
        let text = format!("START{}END", "x".repeat(4000));
        let out = truncate_middle(&text, 100); // 400 chars allowed
        assert!(out.starts_with("START"));
        assert!(out.ends_with("END"));
        assert!(out.contains("elided"));
        assert!(out.len() < 600);
    }

    #[test]
    fn truncate_middle_is_identity_under_budget() {
        assert_eq!(truncate_middle("short", 100), "short");
    }

    #[test]
    fn budget_subtracts_output_reservation() {
        let cm = ContextManager::new(ContextConfig {
            context_window_tokens: 10_000,
            output_reserve_tokens: 2_000,
            ..Default::default()
        });
        assert_eq!(cm.budget(), 8_000);
        assert!(cm.recall_budget() < cm.budget());
    }
}
