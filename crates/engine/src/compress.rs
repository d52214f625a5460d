//! Smart history compression.
//!
//! When the assembled context crosses the trigger ratio, the middle slice of
//! the conversation (everything between the preserved head and tail except
//! CRITICAL/HIGH messages) is replaced by a single summary system message
//! produced by a low-temperature LLM call. The summary may also be persisted
//! as a `session_summary` memory item.

use std::sync::Arc;

use rv_domain::config::ContextConfig;
use rv_domain::error::Result;
use rv_domain::message::{Message, Role};
use rv_domain::state::AgentState;

use rv_memory::{Embedder, MemoryItem, MemoryKind, MemoryStore, MemoryTier};
use rv_providers::{ChatRequest, LlmGateway};

use crate::score::{bucket, score_message, Bucket};

/// Content prefix marking an injected summary message.
pub const SUMMARY_MARKER: &str = "[Conversation summary]";

const SESSION_SUMMARY_IMPORTANCE: f32 = 7.0;

/// Boundaries of the conversation region inside `state.messages`:
/// `[head_start, head_end)` is protected head, `[tail_start, len)` is
/// protected tail, and `[head_end, tail_start)` is the compressible middle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub head_end: usize,
    pub tail_start: usize,
}

/// Compute the protected region over `messages`. Index 0 (the system
/// prompt) is never part of the conversation; the head covers the first
/// `head_turns` user turns and the tail the last `tail_messages` messages.
pub fn region(messages: &[Message], head_turns: usize, tail_messages: usize) -> Region {
    let len = messages.len();

    // Head: walk forward counting user turns; the head ends where turn
    // head_turns + 1 begins.
    let mut user_turns = 0usize;
    let mut head_end = len;
    for (i, msg) in messages.iter().enumerate().skip(1) {
        if msg.role == Role::User {
            user_turns += 1;
            if user_turns > head_turns {
                head_end = i;
                break;
            }
        }
    }

    let tail_start = len.saturating_sub(tail_messages).max(head_end);
    Region {
        head_end,
        tail_start,
    }
}

/// Produces and injects summaries.
pub struct Compressor {
    gateway: Arc<LlmGateway>,
    long_term: Option<Arc<dyn MemoryStore>>,
    embedder: Arc<dyn Embedder>,
    config: ContextConfig,
}

impl Compressor {
    pub fn new(
        gateway: Arc<LlmGateway>,
        long_term: Option<Arc<dyn MemoryStore>>,
        embedder: Arc<dyn Embedder>,
        config: ContextConfig,
    ) -> Self {
        Self {
            gateway,
            long_term,
            embedder,
            config,
        }
    }

    /// Compress `state` in place. Returns `true` when a summary replaced a
    /// middle slice. Head and tail bytes are never touched.
    pub async fn compress(&self, state: &mut AgentState, model: &str) -> Result<bool> {
        let Region {
            head_end,
            tail_start,
        } = region(
            &state.messages,
            self.config.head_preserve_turns,
            self.config.tail_preserve_messages,
        );

        if head_end >= tail_start {
            return Ok(false);
        }

        // Partition the middle by importance bucket.
        let mut kept: Vec<Message> = Vec::new();
        let mut removed: Vec<Message> = Vec::new();
        for msg in &state.messages[head_end..tail_start] {
            let score = score_message(msg, false, false, &self.config.score_keywords);
            if matches!(bucket(score), Bucket::Critical | Bucket::High) {
                kept.push(msg.clone());
            } else {
                removed.push(msg.clone());
            }
        }

        if removed.is_empty() {
            return Ok(false);
        }

        let summary = self.summarize(&removed, model).await?;
        let summary_msg = Message::system(format!("{SUMMARY_MARKER} {summary}"));

        self.persist_summary(state, &summary).await;

        // Splice: summary takes the position of the removed slice, kept
        // CRITICAL/HIGH messages follow it in their original order.
        let mut rebuilt = Vec::with_capacity(head_end + 1 + kept.len() + (state.messages.len() - tail_start));
        rebuilt.extend_from_slice(&state.messages[..head_end]);
        rebuilt.push(summary_msg);
        rebuilt.extend(kept);
        rebuilt.extend_from_slice(&state.messages[tail_start..]);

        tracing::info!(
            removed = removed.len(),
            before = state.messages.len(),
            after = rebuilt.len(),
            "history compressed"
        );
        state.messages = rebuilt;
        Ok(true)
    }

    async fn summarize(&self, removed: &[Message], model: &str) -> Result<String> {
        let mut conversation = String::new();
        for msg in removed {
            let label = match msg.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::Tool => "Tool",
                Role::System => "System",
            };
            conversation.push_str(label);
            conversation.push_str(": ");
            conversation.push_str(msg.text());
            if msg.has_tool_calls() {
                for tc in &msg.tool_calls {
                    conversation.push_str(&format!(" [called {}]", tc.name));
                }
            }
            conversation.push('\n');
        }

        let prompt = format!(
            "Summarize this conversation slice into a compact paragraph. \
             Retain decisions, user preferences, key facts, and open todos. \
             Omit pleasantries. Write in present tense.\n\n{conversation}"
        );

        let req = ChatRequest {
            messages: vec![Message::user(prompt)],
            temperature: Some(0.1),
            max_tokens: Some(1024),
            model: Some(model.to_owned()),
            ..Default::default()
        };

        let resp = self.gateway.chat(req).await?;
        Ok(resp.content)
    }

    /// Best-effort persistence of the summary as a session_summary item.
    async fn persist_summary(&self, state: &AgentState, summary: &str) {
        let Some(store) = &self.long_term else {
            return;
        };
        if summary.is_empty() {
            return;
        }

        let embedding = match self.embedder.embed(summary).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "summary embedding failed, skipping memory write");
                return;
            }
        };

        let mut item = MemoryItem::new(
            state.owner.clone(),
            MemoryTier::Long,
            MemoryKind::SessionSummary,
            summary,
            SESSION_SUMMARY_IMPORTANCE,
        )
        .with_metadata("source_session", serde_json::json!(state.session_id));
        item.embedding = embedding;

        if let Err(e) = store.put(item).await {
            tracing::warn!(error = %e, "session summary memory write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msgs(turns: usize) -> Vec<Message> {
        let mut v = vec![Message::system("sys")];
        for i in 0..turns {
            v.push(Message::user(format!("question {i}")));
            v.push(Message::assistant(format!("answer {i}")));
        }
        v
    }

    #[test]
    fn region_protects_two_turns_and_six_messages() {
        let messages = msgs(10); // 1 system + 20 conversation
        let r = region(&messages, 2, 6);
        // Head covers system + 2 full turns = indices 0..5.
        assert_eq!(r.head_end, 5);
        assert_eq!(r.tail_start, messages.len() - 6);
    }

    #[test]
    fn short_histories_have_no_middle() {
        let messages = msgs(3); // 7 messages
        let r = region(&messages, 2, 6);
        assert!(r.head_end >= r.tail_start);
    }

    #[test]
    fn tail_never_reaches_into_head() {
        let messages = msgs(4); // 9 messages, tail 6 would start at 3 < head_end 5
        let r = region(&messages, 2, 6);
        assert!(r.tail_start >= r.head_end);
    }
}
