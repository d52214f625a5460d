//! The Reverie execution engine.
//!
//! Given a user message and a declarative [`AgentDefinition`], the engine
//! drives a bounded reasoning loop over the LLM gateway, tool executor,
//! tiered memory, and checkpointer, and emits an ordered event stream.
//!
//! Entry points: [`Engine::run`] for a user turn, [`Engine::resume`] for a
//! human decision on a suspended checkpoint.

pub mod cancel;
pub mod compress;
pub mod context;
pub mod embed;
pub mod events;
pub mod hitl;
pub mod run;
pub mod score;
pub mod session;
pub mod transcript;

pub use events::RunEvent;
pub use hitl::Decision;
pub use run::RunRequest;
pub use transcript::{InMemoryMessageStore, JsonlMessageStore, MessageStore};

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use rv_checkpoint::{Checkpointer, InMemoryCheckpointer};
use rv_domain::agent::AgentDefinition;
use rv_domain::config::EngineConfig;
use rv_domain::error::Result;
use rv_domain::state::{AgentState, CheckpointDiff, CheckpointMeta};
use rv_memory::{Embedder, HashEmbedder, InMemoryStore, MemoryStore, WorkingMemory};
use rv_providers::{CacheStatsSnapshot, LlmGateway};
use rv_tools::{ProcessSandbox, Sandbox, ToolExecutor, ToolRegistry};

use crate::cancel::CancelMap;
use crate::compress::Compressor;
use crate::context::ContextManager;
use crate::run::{spawn_run, Entry};
use crate::session::SessionLockMap;

/// Shared internals for all runs. Constructed once at startup; no module
/// state beyond the gateway's monotonic cache counters.
pub(crate) struct Inner {
    pub(crate) config: EngineConfig,
    pub(crate) gateway: Arc<LlmGateway>,
    pub(crate) registry: Arc<ToolRegistry>,
    pub(crate) executor: Arc<ToolExecutor>,
    pub(crate) checkpointer: Arc<dyn Checkpointer>,
    pub(crate) messages: Arc<dyn MessageStore>,
    pub(crate) working: Arc<WorkingMemory>,
    pub(crate) long_term: Arc<dyn MemoryStore>,
    pub(crate) embedder: Arc<dyn Embedder>,
    pub(crate) context: ContextManager,
    pub(crate) compressor: Compressor,
    pub(crate) locks: SessionLockMap,
    pub(crate) cancels: CancelMap,
    /// Session -> agent definition, so `resume` can rebuild the run
    /// environment from just a checkpoint id.
    pub(crate) agent_defs: Mutex<HashMap<String, AgentDefinition>>,
}

/// The engine facade handed to hosts.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Wire the engine from explicit capabilities.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        gateway: Arc<LlmGateway>,
        registry: Arc<ToolRegistry>,
        sandbox: Arc<dyn Sandbox>,
        checkpointer: Arc<dyn Checkpointer>,
        messages: Arc<dyn MessageStore>,
        long_term: Arc<dyn MemoryStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        let executor = Arc::new(ToolExecutor::new(
            registry.clone(),
            sandbox,
            config.tools.clone(),
            config.sandbox.clone(),
        ));
        let context = ContextManager::new(config.context.clone());
        let compressor = Compressor::new(
            gateway.clone(),
            Some(long_term.clone()),
            embedder.clone(),
            config.context.clone(),
        );

        Self {
            inner: Arc::new(Inner {
                config,
                gateway,
                registry,
                executor,
                checkpointer,
                messages,
                working: Arc::new(WorkingMemory::new()),
                long_term,
                embedder,
                context,
                compressor,
                locks: SessionLockMap::new(),
                cancels: CancelMap::new(),
                agent_defs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// All-ephemeral wiring: in-memory stores, process sandbox, hash
    /// embedder. The default for tests and single-process hosts.
    pub fn in_memory(
        config: EngineConfig,
        gateway: Arc<LlmGateway>,
        registry: Arc<ToolRegistry>,
    ) -> Self {
        Self::new(
            config,
            gateway,
            registry,
            Arc::new(ProcessSandbox::new()),
            Arc::new(InMemoryCheckpointer::new()),
            Arc::new(InMemoryMessageStore::new()),
            Arc::new(InMemoryStore::new()),
            Arc::new(HashEmbedder::new()),
        )
    }

    // ── Run lifecycle ──────────────────────────────────────────────

    /// Process one user turn. Returns the run id and the event stream.
    pub fn run(&self, req: RunRequest) -> (Uuid, mpsc::Receiver<RunEvent>) {
        spawn_run(self.inner.clone(), Entry::Fresh(req))
    }

    /// Apply a human decision to a suspended checkpoint and continue.
    pub fn resume(
        &self,
        checkpoint_id: Uuid,
        decision: Decision,
    ) -> (Uuid, mpsc::Receiver<RunEvent>) {
        spawn_run(
            self.inner.clone(),
            Entry::Decision {
                checkpoint_id,
                decision,
            },
        )
    }

    /// Request cooperative cancellation of an active run.
    pub fn cancel(&self, run_id: &Uuid) -> bool {
        self.inner.cancels.cancel(run_id)
    }

    /// End a session: clears working memory and releases any leased
    /// sandbox. Long-term memory and checkpoints are unaffected.
    pub async fn end_session(&self, session_id: &str) {
        self.inner.working.clear_session(session_id);
        self.inner.executor.end_session(session_id).await;
        self.inner.agent_defs.lock().remove(session_id);
        self.inner.locks.prune_idle();
    }

    // ── Introspection ──────────────────────────────────────────────

    pub async fn list_checkpoints(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<CheckpointMeta>> {
        self.inner.checkpointer.list(session_id, limit).await
    }

    pub async fn get_checkpoint_state(&self, checkpoint_id: Uuid) -> Result<AgentState> {
        Ok(self.inner.checkpointer.load(checkpoint_id).await?.state)
    }

    pub async fn diff_checkpoints(&self, a: Uuid, b: Uuid) -> Result<CheckpointDiff> {
        self.inner.checkpointer.diff(a, b).await
    }

    /// Prompt-cache counters aggregated across all runs.
    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        self.inner.gateway.cache_stats()
    }
}
