//! Tool registry — maps tool names to specs and handlers.
//!
//! Names may be namespaced (`<server>.<tool>`) for external tools. The
//! registry is populated at startup and effectively read-only afterwards;
//! the specs' JSON schemas are serialized into LLM gateway calls so the
//! model can structure its invocations.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use rv_domain::error::Result;
use rv_domain::message::ToolDefinition;

/// Execution routing class for a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    /// Pure function: runs in-process under a timeout.
    Pure,
    /// Arbitrary code execution: sandboxed.
    Code,
    /// Shell commands: sandboxed.
    Shell,
    /// Writes to the filesystem: sandboxed.
    FilesystemWrite,
    /// Network access: sandboxed.
    Network,
}

impl ToolCategory {
    pub fn needs_sandbox(self) -> bool {
        !matches!(self, ToolCategory::Pure)
    }
}

/// Boxed async handler: `(args, workspace_command) -> output`.
///
/// Pure tools receive the validated args and return JSON output. Sandboxed
/// tools instead produce the command the executor runs inside the sandbox
/// (see [`ToolSpec::command_builder`]).
pub type ToolHandler = Arc<
    dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync,
>;

/// Builds the sandbox command line for a sandboxed tool from its args.
pub type CommandBuilder = Arc<dyn Fn(&Value) -> Result<String> + Send + Sync>;

/// Everything the executor needs to know about one tool.
#[derive(Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the parameters.
    pub schema: Value,
    pub category: ToolCategory,
    /// Marks the tool as approval-gated by default; the engine's HITL policy
    /// may extend or override this per agent.
    pub hitl_required: bool,
    /// Handler for `Pure` tools.
    pub handler: Option<ToolHandler>,
    /// Command builder for sandboxed tools.
    pub command_builder: Option<CommandBuilder>,
}

impl ToolSpec {
    /// A pure, in-process tool.
    pub fn pure<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            category: ToolCategory::Pure,
            hitl_required: false,
            handler: Some(Arc::new(move |args| Box::pin(handler(args)))),
            command_builder: None,
        }
    }

    /// A sandboxed tool that turns its args into a command line.
    pub fn sandboxed<F>(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        category: ToolCategory,
        command_builder: F,
    ) -> Self
    where
        F: Fn(&Value) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            category,
            hitl_required: false,
            handler: None,
            command_builder: Some(Arc::new(command_builder)),
        }
    }

    pub fn with_hitl(mut self) -> Self {
        self.hitl_required = true;
        self
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.schema.clone(),
        }
    }
}

/// Read-mostly registry of tool specs.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolSpec>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: ToolSpec) {
        if self.tools.contains_key(&spec.name) {
            tracing::warn!(name = %spec.name, "tool registered twice, replacing");
        }
        self.tools.insert(spec.name.clone(), spec);
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Tools under an external server namespace (`<server>.<tool>`).
    pub fn namespace(&self, server: &str) -> Vec<&ToolSpec> {
        let prefix = format!("{server}.");
        let mut specs: Vec<&ToolSpec> = self
            .tools
            .values()
            .filter(|s| s.name.starts_with(&prefix))
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Build the tool definitions exposed to the LLM, restricted to the
    /// given allow-list (the agent's tool names). Unknown names are skipped
    /// with a warning so a stale agent definition cannot crash a run.
    pub fn definitions_for(&self, allowed: &[String]) -> Vec<ToolDefinition> {
        allowed
            .iter()
            .filter_map(|name| match self.tools.get(name) {
                Some(spec) => Some(spec.definition()),
                None => {
                    tracing::warn!(name = %name, "agent references unregistered tool");
                    None
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
