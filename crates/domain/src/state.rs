//! Engine-owned run state and its persisted snapshot form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::{Message, ToolCall};

/// Owner of a session: a real user id or a minted anonymous id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub String);

impl OwnerId {
    pub fn user(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn anonymous() -> Self {
        Self(format!("anon_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Phase of the execution state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Recall,
    BuildContext,
    LlmCall,
    ToolDispatch,
    Finalize,
    Consolidate,
    Interrupt,
    Terminated,
    Done,
}

/// A memory item snapshot attached to the state for the current turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecalledMemory {
    pub id: String,
    pub content: String,
    pub score: f32,
}

/// The in-flight state of one agent run.
///
/// The message sequence is append-only within an iteration; compression
/// replaces a contiguous middle slice with a single summary system message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub session_id: String,
    pub owner: OwnerId,
    pub messages: Vec<Message>,
    pub iteration: u32,
    pub cumulative_tokens: u64,
    pub phase: Phase,
    /// Set only while the run is suspended awaiting a human decision.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_tool_call: Option<ToolCall>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recalled_memories: Vec<RecalledMemory>,
}

impl AgentState {
    pub fn new(session_id: impl Into<String>, owner: OwnerId) -> Self {
        Self {
            session_id: session_id.into(),
            owner,
            messages: Vec::new(),
            iteration: 0,
            cumulative_tokens: 0,
            phase: Phase::Init,
            pending_tool_call: None,
            recalled_memories: Vec::new(),
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// The most recent user message, if any.
    pub fn last_user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == crate::message::Role::User)
            .map(|m| m.text())
    }

    /// Tool calls of the last assistant turn that have no matching tool-role
    /// result yet, in their original order.
    pub fn unanswered_tool_calls(&self) -> Vec<ToolCall> {
        let Some(assistant) = self
            .messages
            .iter()
            .rev()
            .find(|m| m.role == crate::message::Role::Assistant)
        else {
            return Vec::new();
        };
        assistant
            .tool_calls
            .iter()
            .filter(|tc| {
                !self.messages.iter().any(|m| {
                    m.role == crate::message::Role::Tool
                        && m.tool_call_id.as_deref() == Some(tc.id.as_str())
                })
            })
            .cloned()
            .collect()
    }
}

/// A persisted snapshot of [`AgentState`] keyed by (session, step).
///
/// `parent_id` links checkpoints into a per-session DAG: resuming or editing
/// a past checkpoint creates a branch rather than rewriting history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub session_id: String,
    pub step: u32,
    pub state: AgentState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Lightweight listing form of a checkpoint (no state payload).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub id: Uuid,
    pub session_id: String,
    pub step: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl From<&Checkpoint> for CheckpointMeta {
    fn from(cp: &Checkpoint) -> Self {
        Self {
            id: cp.id,
            session_id: cp.session_id.clone(),
            step: cp.step,
            parent_id: cp.parent_id,
            created_at: cp.created_at,
        }
    }
}

/// Difference between two checkpoints of the same session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointDiff {
    pub messages_added: i64,
    pub tokens_delta: i64,
    pub new_messages: Vec<Message>,
}
