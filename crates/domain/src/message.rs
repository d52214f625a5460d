use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Internal tool call format (provider-agnostic).
/// Every adapter converts provider-specific tool calls to/from this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Engine-assigned unique id.
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: format!("tc_{}", uuid::Uuid::new_v4().simple()),
            name: name.into(),
            arguments,
        }
    }
}

/// Outcome of one tool invocation. Exactly one result is produced per
/// [`ToolCall`] before the next LLM turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub success: bool,
    pub output: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ToolResult {
    pub fn ok(tool_call_id: impl Into<String>, output: serde_json::Value, duration_ms: u64) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            success: true,
            output,
            error: None,
            duration_ms,
        }
    }

    pub fn err(tool_call_id: impl Into<String>, error: impl Into<String>, duration_ms: u64) -> Self {
        let error = error.into();
        Self {
            tool_call_id: tool_call_id.into(),
            success: false,
            output: serde_json::json!({ "error": error }),
            error: Some(error),
            duration_ms,
        }
    }
}

/// Tool definition exposed to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in the conversation.
///
/// Invariants: a `tool` message always carries `tool_call_id` matching an
/// assistant-issued [`ToolCall`]; an assistant message with tool calls has no
/// content obligation beyond those calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Cached token estimate, filled by the context manager.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

// ── Convenience constructors ───────────────────────────────────────

impl Message {
    fn base(role: Role) -> Self {
        Self {
            role,
            content: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
            token_count: None,
            timestamp: Utc::now(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Self::base(Role::System)
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Self::base(Role::User)
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Self::base(Role::Assistant)
        }
    }

    /// Assistant message carrying tool calls (text may be empty).
    pub fn assistant_with_tools(text: &str, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content: if text.is_empty() {
                None
            } else {
                Some(text.to_owned())
            },
            tool_calls,
            ..Self::base(Role::Assistant)
        }
    }

    /// Tool-role message correlating a result back to its originating call.
    pub fn tool_result(result: &ToolResult) -> Self {
        let content = serde_json::to_string(&result.output)
            .unwrap_or_else(|_| String::from("null"));
        Self {
            content: Some(content),
            tool_call_id: Some(result.tool_call_id.clone()),
            ..Self::base(Role::Tool)
        }
    }

    /// The plain-text content, or `""` when absent.
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_result_message_carries_call_id() {
        let result = ToolResult::ok("tc_1", serde_json::json!(5), 12);
        let msg = Message::tool_result(&result);
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("tc_1"));
        assert_eq!(msg.text(), "5");
    }

    #[test]
    fn assistant_with_tools_drops_empty_text() {
        let calls = vec![ToolCall::new("add", serde_json::json!({"a": 1, "b": 2}))];
        let msg = Message::assistant_with_tools("", calls);
        assert!(msg.content.is_none());
        assert!(msg.has_tool_calls());
    }

    #[test]
    fn tool_call_ids_are_unique() {
        let a = ToolCall::new("x", serde_json::json!({}));
        let b = ToolCall::new("x", serde_json::json!({}));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn error_result_mirrors_message_into_output() {
        let result = ToolResult::err("tc_9", "unknown_tool", 0);
        assert!(!result.success);
        assert_eq!(result.output["error"], "unknown_tool");
        assert_eq!(result.error.as_deref(), Some("unknown_tool"));
    }

    #[test]
    fn message_roundtrips_through_json() {
        let msg = Message::user("hello");
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.role, Role::User);
        assert_eq!(back.text(), "hello");
    }
}
