//! Step-granular state persistence for the Reverie runtime.
//!
//! The engine treats the checkpointer as a capability: an append-mostly
//! store keyed by checkpoint id, secondarily indexed by session and step.
//! Backends are interchangeable; both an ephemeral in-memory store and a
//! durable JSONL store ship here.

pub mod jsonl;
pub mod memory;

pub use jsonl::JsonlCheckpointer;
pub use memory::InMemoryCheckpointer;

use async_trait::async_trait;
use uuid::Uuid;

use rv_domain::error::Result;
use rv_domain::state::{AgentState, Checkpoint, CheckpointDiff, CheckpointMeta};

/// The checkpoint capability.
///
/// Writes for the same session are serialized by the implementation; step
/// indices are monotone per session along any branch.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Persist a snapshot. `parent` links branches: resuming from or editing
    /// a past checkpoint passes its id here.
    async fn save(
        &self,
        state: &AgentState,
        step: u32,
        parent: Option<Uuid>,
    ) -> Result<Uuid>;

    async fn load(&self, id: Uuid) -> Result<Checkpoint>;

    /// The most recently saved checkpoint for a session.
    async fn latest(&self, session_id: &str) -> Result<Option<Checkpoint>>;

    /// Newest-first listing, capped at `limit`.
    async fn list(&self, session_id: &str, limit: usize) -> Result<Vec<CheckpointMeta>>;

    /// Structural difference between two checkpoints.
    async fn diff(&self, a: Uuid, b: Uuid) -> Result<CheckpointDiff> {
        let a = self.load(a).await?;
        let b = self.load(b).await?;
        Ok(diff_states(&a, &b))
    }
}

/// Compute the diff between two checkpoints: how many messages `b` added
/// over `a`, the token delta, and the new messages themselves.
pub fn diff_states(a: &Checkpoint, b: &Checkpoint) -> CheckpointDiff {
    let a_len = a.state.messages.len();
    let b_len = b.state.messages.len();
    let new_messages = if b_len > a_len {
        b.state.messages[a_len..].to_vec()
    } else {
        Vec::new()
    };
    CheckpointDiff {
        messages_added: b_len as i64 - a_len as i64,
        tokens_delta: b.state.cumulative_tokens as i64 - a.state.cumulative_tokens as i64,
        new_messages,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rv_domain::message::Message;
    use rv_domain::state::OwnerId;

    fn checkpoint(messages: Vec<Message>, tokens: u64) -> Checkpoint {
        let mut state = AgentState::new("s1", OwnerId::user("u1"));
        state.messages = messages;
        state.cumulative_tokens = tokens;
        Checkpoint {
            id: Uuid::new_v4(),
            session_id: "s1".into(),
            step: 1,
            state,
            parent_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn diff_reports_added_messages_and_token_delta() {
        let a = checkpoint(vec![Message::user("q")], 100);
        let b = checkpoint(
            vec![Message::user("q"), Message::assistant("a")],
            160,
        );
        let d = diff_states(&a, &b);
        assert_eq!(d.messages_added, 1);
        assert_eq!(d.tokens_delta, 60);
        assert_eq!(d.new_messages.len(), 1);
        assert_eq!(d.new_messages[0].text(), "a");
    }

    #[test]
    fn reversed_diff_is_negative_with_no_new_messages() {
        let a = checkpoint(vec![Message::user("q"), Message::assistant("a")], 160);
        let b = checkpoint(vec![Message::user("q")], 100);
        let d = diff_states(&a, &b);
        assert_eq!(d.messages_added, -1);
        assert!(d.new_messages.is_empty());
    }
}
