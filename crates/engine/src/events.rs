//! Run events — the observable contract of the engine.
//!
//! Events are emitted in order over the run's channel. Exactly one of
//! `run_completed`, `terminated`, `cancelled`, `error`, or `interrupt`
//! terminates a stream.

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use rv_domain::message::ToolCall;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum RunEvent {
    #[serde(rename = "run_started")]
    RunStarted { run_id: Uuid, session_id: String },

    #[serde(rename = "memories_recalled")]
    MemoriesRecalled { count: usize, ids: Vec<String> },

    #[serde(rename = "context_built")]
    ContextBuilt { tokens: u32, truncated: bool },

    #[serde(rename = "llm_called")]
    LlmCalled { model: String },

    #[serde(rename = "text_delta")]
    TextDelta { chunk: String },

    #[serde(rename = "tool_called")]
    ToolCalled {
        id: String,
        name: String,
        args: Value,
    },

    #[serde(rename = "tool_returned")]
    ToolReturned {
        id: String,
        success: bool,
        output: Value,
        duration_ms: u64,
    },

    /// The run is suspended awaiting a human decision on `pending`.
    #[serde(rename = "interrupt")]
    Interrupt {
        checkpoint_id: Uuid,
        pending: ToolCall,
        reason: String,
    },

    #[serde(rename = "final_message")]
    FinalMessage { content: String, tokens: u32 },

    #[serde(rename = "terminated")]
    Terminated { reason: String, iterations: u32 },

    #[serde(rename = "error")]
    Error { kind: String, message: String },

    #[serde(rename = "cancelled")]
    Cancelled,

    #[serde(rename = "run_completed")]
    RunCompleted,
}

impl RunEvent {
    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunEvent::RunCompleted
                | RunEvent::Terminated { .. }
                | RunEvent::Cancelled
                | RunEvent::Error { .. }
                | RunEvent::Interrupt { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_canonical_tags() {
        let e = RunEvent::TextDelta {
            chunk: "hi".into(),
        };
        let v: Value = serde_json::from_str(&serde_json::to_string(&e).unwrap()).unwrap();
        assert_eq!(v["type"], "text_delta");
        assert_eq!(v["chunk"], "hi");

        let e = RunEvent::Terminated {
            reason: "max_iterations_exceeded".into(),
            iterations: 2,
        };
        let v: Value = serde_json::from_str(&serde_json::to_string(&e).unwrap()).unwrap();
        assert_eq!(v["type"], "terminated");
        assert_eq!(v["iterations"], 2);
    }

    #[test]
    fn terminal_classification_matches_the_contract() {
        assert!(RunEvent::RunCompleted.is_terminal());
        assert!(RunEvent::Cancelled.is_terminal());
        assert!(!RunEvent::LlmCalled { model: "m".into() }.is_terminal());
        assert!(!RunEvent::ContextBuilt {
            tokens: 1,
            truncated: false
        }
        .is_terminal());
    }
}
