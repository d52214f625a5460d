//! Memory consolidation — extracts durable items from a finished round.
//!
//! One low-temperature, JSON-constrained LLM call looks at the latest
//! user/assistant exchange (plus fresh tool outputs) and proposes typed
//! candidates. Each candidate is rated, deduplicated against the long tier,
//! and persisted with its embedding when it clears the importance threshold.

use std::sync::Arc;

use serde::Deserialize;

use rv_domain::config::MemoryConfig;
use rv_domain::error::{Error, Result};
use rv_domain::message::{Message, Role};
use rv_domain::state::OwnerId;

use rv_providers::{ChatRequest, LlmGateway};

use crate::embedder::Embedder;
use crate::item::{MemoryItem, MemoryKind, MemoryTier};
use crate::store::MemoryStore;

const EXTRACTION_PROMPT: &str = "\
You extract durable memories from a conversation round. Return a JSON array \
(possibly empty) of objects with exactly these fields:\n\
  \"type\": one of \"fact\", \"preference\", \"procedure\", \"episode\"\n\
  \"content\": a single self-contained sentence\n\
  \"importance\": a number from 0 to 10\n\
Extract only durable information: stable facts about the user, stated \
preferences, reusable procedures, and notable episodes. Skip small talk, \
transient task state, and anything already generic knowledge. Return the \
JSON array and nothing else.";

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(rename = "type")]
    kind: String,
    content: String,
    importance: f32,
}

fn parse_kind(s: &str) -> Option<MemoryKind> {
    match s {
        "fact" => Some(MemoryKind::Fact),
        "preference" => Some(MemoryKind::Preference),
        "procedure" => Some(MemoryKind::Procedure),
        "episode" => Some(MemoryKind::Episode),
        _ => None,
    }
}

/// Consolidates one round of conversation into long-term memory.
pub struct Consolidator {
    gateway: Arc<LlmGateway>,
    store: Arc<dyn MemoryStore>,
    embedder: Arc<dyn Embedder>,
    config: MemoryConfig,
    /// Model used for extraction; `None` uses the gateway default.
    model: Option<String>,
}

impl Consolidator {
    pub fn new(
        gateway: Arc<LlmGateway>,
        store: Arc<dyn MemoryStore>,
        embedder: Arc<dyn Embedder>,
        config: MemoryConfig,
        model: Option<String>,
    ) -> Self {
        Self {
            gateway,
            store,
            embedder,
            config,
            model,
        }
    }

    /// Render the last round (final user message onward) as extraction input.
    fn round_text(messages: &[Message]) -> String {
        let start = messages
            .iter()
            .rposition(|m| m.role == Role::User)
            .unwrap_or(0);
        let mut buf = String::new();
        for msg in &messages[start..] {
            let label = match msg.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::Tool => "Tool",
                Role::System => "System",
            };
            buf.push_str(label);
            buf.push_str(": ");
            // Long tool outputs get clipped to keep the extraction prompt sane.
            let text = msg.text();
            if text.len() > 2000 {
                let mut end = 1000;
                while !text.is_char_boundary(end) && end > 0 {
                    end -= 1;
                }
                buf.push_str(&text[..end]);
                buf.push_str(" [...] ");
            } else {
                buf.push_str(text);
            }
            buf.push('\n');
        }
        buf
    }

    /// Run extraction and persistence for one round. Returns the ids of the
    /// items written or reinforced. Failures are the caller's to log; the
    /// engine treats them as non-fatal.
    pub async fn consolidate(&self, owner: &OwnerId, messages: &[Message]) -> Result<Vec<String>> {
        let round = Self::round_text(messages);
        if round.trim().is_empty() {
            return Ok(Vec::new());
        }

        let req = ChatRequest {
            messages: vec![
                Message::system(EXTRACTION_PROMPT),
                Message::user(round),
            ],
            temperature: Some(0.1),
            max_tokens: Some(1024),
            model: self.model.clone(),
            ..Default::default()
        };

        let resp = self.gateway.chat(req).await?;
        let candidates = parse_candidates(&resp.content)?;

        let threshold = self.config.long_term_threshold;
        let dedup_cutoff = self.config.dedup_similarity_clamped();
        let mut written = Vec::new();

        for cand in candidates {
            let Some(kind) = parse_kind(&cand.kind) else {
                tracing::debug!(kind = %cand.kind, "skipping candidate with unknown type");
                continue;
            };
            let importance = cand.importance.clamp(0.0, 10.0);
            if importance < threshold {
                tracing::debug!(
                    importance,
                    threshold,
                    "candidate below long-term threshold, not promoted"
                );
                continue;
            }

            let embedding = self.embedder.embed(&cand.content).await?;

            // Near-duplicate of the same kind and owner: reinforce instead.
            let existing = self
                .store
                .search(owner, &embedding, 1, Some(kind))
                .await?;
            if let Some(hit) = existing.first() {
                if hit.similarity >= dedup_cutoff {
                    self.store.reinforce(&hit.item.id, 0.5).await?;
                    tracing::debug!(id = %hit.item.id, similarity = hit.similarity, "reinforced near-duplicate memory");
                    written.push(hit.item.id.clone());
                    continue;
                }
            }

            let mut item = MemoryItem::new(
                owner.clone(),
                MemoryTier::Long,
                kind,
                cand.content,
                importance,
            );
            item.embedding = embedding;
            let id = self.store.put(item).await?;
            written.push(id);
        }

        tracing::info!(count = written.len(), "consolidation complete");
        Ok(written)
    }
}

/// Parse the model's JSON output, tolerating a fenced code block around it.
fn parse_candidates(content: &str) -> Result<Vec<Candidate>> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.trim_end_matches("```").trim())
        .unwrap_or(trimmed);

    if body.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(body)
        .map_err(|e| Error::Memory(format!("extraction output is not a candidate array: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_arrays_and_fenced_blocks() {
        let plain = r#"[{"type":"fact","content":"x","importance":7}]"#;
        assert_eq!(parse_candidates(plain).unwrap().len(), 1);

        let fenced = "```json\n[{\"type\":\"preference\",\"content\":\"y\",\"importance\":8}]\n```";
        let parsed = parse_candidates(fenced).unwrap();
        assert_eq!(parsed[0].kind, "preference");
    }

    #[test]
    fn garbage_output_is_a_memory_error() {
        let err = parse_candidates("I could not find any memories.").unwrap_err();
        assert_eq!(err.kind(), "memory_failed");
    }

    #[test]
    fn round_text_starts_at_last_user_message() {
        let messages = vec![
            Message::user("old question"),
            Message::assistant("old answer"),
            Message::user("My name is Zhang San."),
            Message::assistant("Nice to meet you, Zhang San."),
        ];
        let text = Consolidator::round_text(&messages);
        assert!(text.contains("Zhang San"));
        assert!(!text.contains("old question"));
    }
}
