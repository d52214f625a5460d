//! Tool executor — validate, route, cap, and time every call.
//!
//! Error absorption is the rule: whatever goes wrong becomes a failed
//! [`ToolResult`] the model can see and react to. Nothing here terminates
//! a run.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use rv_domain::config::{SandboxConfig, ToolsConfig};
use rv_domain::message::ToolResult;

use crate::registry::{ToolRegistry, ToolSpec};
use crate::sandbox::{Sandbox, SandboxHandle};
use crate::schema::validate_args;

/// Per-call session context.
#[derive(Debug, Clone)]
pub struct SessionCtx {
    pub session_id: String,
}

/// Dispatches validated tool calls to in-process handlers or the sandbox.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    sandbox: Arc<dyn Sandbox>,
    tools_config: ToolsConfig,
    sandbox_config: SandboxConfig,
    /// Long-lived sandbox handles when `sandbox.per_session` is set.
    session_handles: Mutex<HashMap<String, SandboxHandle>>,
}

impl ToolExecutor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        sandbox: Arc<dyn Sandbox>,
        tools_config: ToolsConfig,
        sandbox_config: SandboxConfig,
    ) -> Self {
        Self {
            registry,
            sandbox,
            tools_config,
            sandbox_config,
            session_handles: Mutex::new(HashMap::new()),
        }
    }

    /// Execute one tool call. All failure modes land in the returned
    /// [`ToolResult`]; `Err` never escapes.
    pub async fn execute(&self, call_id: &str, name: &str, args: &Value, ctx: &SessionCtx) -> ToolResult {
        let started = std::time::Instant::now();

        // 1. Resolve.
        let Some(spec) = self.registry.get(name) else {
            tracing::debug!(tool = name, "unknown tool requested");
            return ToolResult::err(call_id, "unknown_tool", elapsed_ms(started));
        };

        // 2. Validate.
        if let Err(detail) = validate_args(&spec.schema, args) {
            tracing::debug!(tool = name, detail = %detail, "tool arguments failed validation");
            return ToolResult::err(call_id, format!("invalid arguments: {detail}"), elapsed_ms(started));
        }

        // 3. Route by category.
        let mut result = if spec.category.needs_sandbox() {
            self.run_sandboxed(call_id, spec, args, ctx, started).await
        } else {
            self.run_pure(call_id, spec, args, started).await
        };

        // 4. Uniform output cap.
        self.cap_output(&mut result);

        // 5. Wall time.
        result.duration_ms = elapsed_ms(started);

        tracing::info!(
            tool = name,
            success = result.success,
            duration_ms = result.duration_ms,
            "tool executed"
        );
        result
    }

    async fn run_pure(
        &self,
        call_id: &str,
        spec: &ToolSpec,
        args: &Value,
        started: std::time::Instant,
    ) -> ToolResult {
        let Some(handler) = &spec.handler else {
            return ToolResult::err(call_id, "tool has no handler", elapsed_ms(started));
        };

        let timeout = std::time::Duration::from_secs(self.tools_config.timeout_seconds);
        match tokio::time::timeout(timeout, handler(args.clone())).await {
            Ok(Ok(output)) => ToolResult::ok(call_id, output, elapsed_ms(started)),
            Ok(Err(e)) => ToolResult::err(call_id, e.to_string(), elapsed_ms(started)),
            Err(_) => ToolResult::err(call_id, "timeout", elapsed_ms(started)),
        }
    }

    async fn run_sandboxed(
        &self,
        call_id: &str,
        spec: &ToolSpec,
        args: &Value,
        ctx: &SessionCtx,
        started: std::time::Instant,
    ) -> ToolResult {
        let Some(builder) = &spec.command_builder else {
            return ToolResult::err(call_id, "tool has no command builder", elapsed_ms(started));
        };
        let command = match builder(args) {
            Ok(c) => c,
            Err(e) => return ToolResult::err(call_id, e.to_string(), elapsed_ms(started)),
        };

        let (handle, ephemeral) = match self.handle_for(ctx).await {
            Ok(pair) => pair,
            Err(e) => return ToolResult::err(call_id, e.to_string(), elapsed_ms(started)),
        };

        let outcome = self.sandbox.exec(&handle, &command, None).await;

        // Ephemeral environments are torn down on every exit path.
        if ephemeral {
            if let Err(e) = self.sandbox.release(&handle).await {
                tracing::warn!(error = %e, "sandbox release failed");
            }
        }

        match outcome {
            Ok(o) if o.timed_out => ToolResult::err(call_id, "timeout", elapsed_ms(started)),
            Ok(o) => {
                let success = o.exit == Some(0);
                let output = serde_json::json!({
                    "stdout": o.stdout,
                    "stderr": o.stderr,
                    "exit": o.exit,
                });
                if success {
                    ToolResult::ok(call_id, output, elapsed_ms(started))
                } else {
                    ToolResult {
                        tool_call_id: call_id.to_owned(),
                        success: false,
                        output,
                        error: Some(format!("exit status {:?}", o.exit)),
                        duration_ms: elapsed_ms(started),
                    }
                }
            }
            Err(e) => ToolResult::err(call_id, e.to_string(), elapsed_ms(started)),
        }
    }

    /// Resolve the sandbox handle for this call: a leased per-session
    /// environment, or a fresh one released after the call.
    async fn handle_for(&self, ctx: &SessionCtx) -> rv_domain::error::Result<(SandboxHandle, bool)> {
        if self.sandbox_config.per_session {
            if let Some(handle) = self.session_handles.lock().get(&ctx.session_id).cloned() {
                return Ok((handle, false));
            }
            let handle = self.sandbox.acquire(&self.sandbox_config).await?;
            self.session_handles
                .lock()
                .insert(ctx.session_id.clone(), handle.clone());
            Ok((handle, false))
        } else {
            let handle = self.sandbox.acquire(&self.sandbox_config).await?;
            Ok((handle, true))
        }
    }

    /// Release a session's leased sandbox, if any. Called at session end.
    pub async fn end_session(&self, session_id: &str) {
        let handle = self.session_handles.lock().remove(session_id);
        if let Some(handle) = handle {
            if let Err(e) = self.sandbox.release(&handle).await {
                tracing::warn!(error = %e, session_id, "session sandbox release failed");
            }
        }
    }

    fn cap_output(&self, result: &mut ToolResult) {
        let cap = self.tools_config.output_cap_chars;
        let serialized = result.output.to_string();
        if serialized.len() <= cap {
            return;
        }

        let mut end = cap;
        while !serialized.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        let total = serialized.len();
        result.output = Value::String(format!(
            "{}\n[output truncated: {total} chars exceeded the {cap} char cap]",
            &serialized[..end]
        ));
    }
}

fn elapsed_ms(started: std::time::Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ToolCategory, ToolSpec};
    use crate::sandbox::ProcessSandbox;
    use rv_domain::error::Error;

    fn executor(registry: ToolRegistry) -> ToolExecutor {
        ToolExecutor::new(
            Arc::new(registry),
            Arc::new(ProcessSandbox::new()),
            ToolsConfig::default(),
            SandboxConfig {
                timeout_seconds: 5,
                ..Default::default()
            },
        )
    }

    fn ctx() -> SessionCtx {
        SessionCtx {
            session_id: "s1".into(),
        }
    }

    fn add_registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(ToolSpec::pure(
            "add",
            "Add two integers.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "a": { "type": "integer" },
                    "b": { "type": "integer" }
                },
                "required": ["a", "b"]
            }),
            |args| async move {
                let a = args["a"].as_i64().unwrap_or(0);
                let b = args["b"].as_i64().unwrap_or(0);
                Ok(serde_json::json!(a + b))
            },
        ));
        reg
    }

    #[tokio::test]
    async fn pure_tool_round_trip() {
        let ex = executor(add_registry());
        let result = ex
            .execute("tc_1", "add", &serde_json::json!({"a": 2, "b": 3}), &ctx())
            .await;
        assert!(result.success);
        assert_eq!(result.output, serde_json::json!(5));
        assert_eq!(result.tool_call_id, "tc_1");
    }

    #[tokio::test]
    async fn unknown_tool_becomes_a_failed_result() {
        let ex = executor(ToolRegistry::new());
        let result = ex.execute("tc_1", "nope", &serde_json::json!({}), &ctx()).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("unknown_tool"));
    }

    #[tokio::test]
    async fn invalid_args_carry_the_validation_detail() {
        let ex = executor(add_registry());
        let result = ex
            .execute("tc_1", "add", &serde_json::json!({"a": 2}), &ctx())
            .await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("missing required property 'b'"));
    }

    #[tokio::test]
    async fn handler_errors_are_absorbed() {
        let mut reg = ToolRegistry::new();
        reg.register(ToolSpec::pure(
            "boom",
            "Always fails.",
            serde_json::json!({"type": "object"}),
            |_| async move { Err::<Value, _>(Error::ToolFailed("kaput".into())) },
        ));
        let ex = executor(reg);
        let result = ex.execute("tc_1", "boom", &serde_json::json!({}), &ctx()).await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("kaput"));
    }

    #[tokio::test]
    async fn shell_tool_runs_in_the_sandbox() {
        let mut reg = ToolRegistry::new();
        reg.register(ToolSpec::sandboxed(
            "shell.exec",
            "Run a shell command.",
            serde_json::json!({
                "type": "object",
                "properties": { "command": { "type": "string" } },
                "required": ["command"]
            }),
            ToolCategory::Shell,
            |args| Ok(args["command"].as_str().unwrap_or("").to_owned()),
        ));
        let ex = executor(reg);

        let result = ex
            .execute(
                "tc_1",
                "shell.exec",
                &serde_json::json!({"command": "echo hi"}),
                &ctx(),
            )
            .await;
        assert!(result.success);
        assert_eq!(result.output["stdout"].as_str().unwrap().trim(), "hi");
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_tool_failure_with_output() {
        let mut reg = ToolRegistry::new();
        reg.register(ToolSpec::sandboxed(
            "shell.exec",
            "Run a shell command.",
            serde_json::json!({"type": "object", "properties": {"command": {"type": "string"}}, "required": ["command"]}),
            ToolCategory::Shell,
            |args| Ok(args["command"].as_str().unwrap_or("").to_owned()),
        ));
        let ex = executor(reg);

        let result = ex
            .execute(
                "tc_1",
                "shell.exec",
                &serde_json::json!({"command": "echo oops >&2; exit 3"}),
                &ctx(),
            )
            .await;
        assert!(!result.success);
        assert_eq!(result.output["exit"], 3);
        assert!(result.output["stderr"].as_str().unwrap().contains("oops"));
    }

    #[tokio::test]
    async fn oversized_output_is_capped_and_annotated() {
        let mut reg = ToolRegistry::new();
        reg.register(ToolSpec::pure(
            "spam",
            "Emit a lot of output.",
            serde_json::json!({"type": "object"}),
            |_| async move { Ok(Value::String("x".repeat(50_000))) },
        ));
        let ex = executor(reg);

        let result = ex.execute("tc_1", "spam", &serde_json::json!({}), &ctx()).await;
        assert!(result.success);
        let text = result.output.as_str().unwrap();
        assert!(text.len() < 11_000);
        assert!(text.contains("output truncated"));
    }
}
