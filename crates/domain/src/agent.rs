//! Declarative agent definitions — immutable within a run.

use serde::{Deserialize, Serialize};

/// Human-in-the-loop policy: glob patterns over tool names.
///
/// A tool call requires approval when it matches a `require` pattern and no
/// `auto_approve` pattern. Auto-approve wins on overlap, so hosts can write
/// `require = ["fs.*"]`, `auto_approve = ["fs.read"]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HitlPolicy {
    #[serde(default)]
    pub require_patterns: Vec<String>,
    #[serde(default)]
    pub auto_approve_patterns: Vec<String>,
}

/// Everything a host supplies to describe an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    pub system_prompt: String,
    /// Model id, e.g. `"claude-sonnet-4"` or `"deepseek-chat"`.
    pub model: String,
    /// Names of tools this agent may call (must exist in the registry).
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default = "d_temperature")]
    pub temperature: f32,
    /// Max output tokens per individual LLM call.
    #[serde(default = "d_max_tokens_per_call")]
    pub max_tokens_per_call: u32,
    #[serde(default = "d_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "d_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub hitl: HitlPolicy,
}

fn d_temperature() -> f32 {
    0.2
}
fn d_max_tokens_per_call() -> u32 {
    4096
}
fn d_max_iterations() -> u32 {
    10
}
fn d_timeout_seconds() -> u64 {
    120
}

impl AgentDefinition {
    /// Minimal definition for tests and quick starts.
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            model: model.into(),
            tools: Vec::new(),
            temperature: d_temperature(),
            max_tokens_per_call: d_max_tokens_per_call(),
            max_iterations: d_max_iterations(),
            timeout_seconds: d_timeout_seconds(),
            hitl: HitlPolicy::default(),
        }
    }
}
