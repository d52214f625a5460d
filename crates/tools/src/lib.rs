//! Tool registry and sandboxed executor for the Reverie runtime.
//!
//! The registry maps tool names to specs (schema, category, HITL flag,
//! handler); the executor validates, routes, caps, and times each call.
//! Sandbox backends live behind the [`sandbox::Sandbox`] trait.

pub mod executor;
pub mod registry;
pub mod sandbox;
pub mod schema;

pub use executor::{SessionCtx, ToolExecutor};
pub use registry::{ToolCategory, ToolHandler, ToolRegistry, ToolSpec};
pub use sandbox::{ExecOutcome, ProcessSandbox, Sandbox, SandboxHandle};
