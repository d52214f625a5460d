//! The execution loop — one bounded state machine per run.
//!
//! INIT → RECALL → BUILD_CONTEXT → LLM_CALL → (TOOL_DISPATCH | FINALIZE) →
//! CONSOLIDATE → DONE, with INTERRUPT (HITL suspension) and TERMINATED
//! (limit hit) side paths. Entry point [`spawn_run`] starts the loop on a
//! tokio task and returns a channel of [`RunEvent`]s; the caller drains
//! events as they arrive.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use rv_domain::agent::AgentDefinition;
use rv_domain::error::{Error, Result};
use rv_domain::message::{Message, ToolCall, ToolResult};
use rv_domain::state::{AgentState, OwnerId, Phase, RecalledMemory};
use rv_domain::stream::{StreamEvent, Usage};

use rv_memory::{Consolidator, RecallRequest, TieredRecall};
use rv_providers::ChatRequest;
use rv_tools::SessionCtx;

use crate::cancel::CancelToken;
use crate::context::{estimate_tokens, BuiltContext};
use crate::events::RunEvent;
use crate::hitl::{Decision, HitlGate};
use crate::Inner;

/// Input to a fresh run.
pub struct RunRequest {
    pub agent: AgentDefinition,
    pub session_id: String,
    pub owner: OwnerId,
    pub user_message: String,
    /// Continue from a prior checkpoint (session history) instead of a
    /// blank state.
    pub resume_from: Option<Uuid>,
}

/// How a run begins: a fresh user turn, or a human decision on a suspended
/// checkpoint.
pub(crate) enum Entry {
    Fresh(RunRequest),
    Decision {
        checkpoint_id: Uuid,
        decision: Decision,
    },
}

/// Spawn the run loop. Mirrors the channel shape of the public API: the
/// receiver yields events until one terminal event closes the stream.
pub(crate) fn spawn_run(inner: Arc<Inner>, entry: Entry) -> (Uuid, mpsc::Receiver<RunEvent>) {
    let (tx, rx) = mpsc::channel::<RunEvent>(64);
    let run_id = Uuid::new_v4();
    let cancel = inner.cancels.register(run_id);

    tokio::spawn(async move {
        let result = run_inner(&inner, entry, &tx, &cancel, run_id).await;
        inner.cancels.remove(&run_id);

        if let Err(e) = result {
            tracing::error!(run_id = %run_id, error = %e, "run failed");
            let _ = tx
                .send(RunEvent::Error {
                    kind: e.kind().to_owned(),
                    message: e.to_string(),
                })
                .await;
        }
    });

    (run_id, rx)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The state machine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Result of dispatching one batch of tool calls.
enum Dispatch {
    Completed,
    Interrupted,
    Cancelled,
}

struct RunCtx {
    run_id: Uuid,
    agent: AgentDefinition,
    gate: HitlGate,
    started: std::time::Instant,
    /// Parent for the next checkpoint save; links saves into a chain and
    /// records the branch point after a resume.
    prev_checkpoint: Option<Uuid>,
    /// `state.iteration` at entry. The iteration counter (and checkpoint
    /// step) is monotone across a session; the per-run limit counts from
    /// this base.
    base_iteration: u32,
}

async fn run_inner(
    inner: &Arc<Inner>,
    entry: Entry,
    tx: &mpsc::Sender<RunEvent>,
    cancel: &CancelToken,
    run_id: Uuid,
) -> Result<()> {
    // ── INIT: resolve state and agent ─────────────────────────────
    let (mut state, agent, pending_decision, branch_from, is_fresh) = match entry {
        Entry::Fresh(req) => {
            let (state, seeded) = init_fresh_state(inner, &req).await?;
            inner
                .agent_defs
                .lock()
                .insert(req.session_id.clone(), req.agent.clone());
            (state, req.agent, None::<Decision>, seeded, true)
        }
        Entry::Decision {
            checkpoint_id,
            decision,
        } => {
            let checkpoint = inner.checkpointer.load(checkpoint_id).await?;
            let agent = inner
                .agent_defs
                .lock()
                .get(&checkpoint.session_id)
                .cloned()
                .ok_or_else(|| {
                    Error::Config(format!(
                        "no agent definition registered for session {}; \
                         start the session with run() before resuming",
                        checkpoint.session_id
                    ))
                })?;
            (
                checkpoint.state,
                agent,
                Some(decision),
                Some(checkpoint_id),
                false,
            )
        }
    };

    // ── Per-session exclusivity ───────────────────────────────────
    let _permit = match inner
        .locks
        .acquire(&state.session_id, inner.config.session.busy_policy)
        .await
    {
        Ok(permit) => permit,
        Err(busy) => {
            let _ = tx
                .send(RunEvent::Error {
                    kind: "invalid_input".into(),
                    message: busy.to_string(),
                })
                .await;
            return Ok(());
        }
    };

    let gate = HitlGate::compile(&inner.config.hitl, &agent.hitl)?;
    // A decision resume continues the interrupted iteration; a fresh run
    // (including session continuation) gets a full iteration budget.
    let base_iteration = if is_fresh {
        state.iteration
    } else {
        state.iteration.saturating_sub(1)
    };
    let mut ctx = RunCtx {
        run_id,
        agent,
        gate,
        started: std::time::Instant::now(),
        prev_checkpoint: branch_from,
        base_iteration,
    };

    let _ = tx
        .send(RunEvent::RunStarted {
            run_id,
            session_id: state.session_id.clone(),
        })
        .await;

    // Persist the seeding messages now that the run owns the session.
    if is_fresh {
        let seeded_count = if ctx.prev_checkpoint.is_some() { 1 } else { 2 };
        let from = state.messages.len() - seeded_count;
        for msg in &state.messages[from..] {
            if let Err(e) = inner.messages.append(&state.session_id, msg).await {
                tracing::warn!(error = %e, "transcript append failed");
            }
        }
    }

    // ── Resume: apply the human decision, then drain the turn ─────
    if let Some(decision) = pending_decision {
        match apply_decision(inner, &mut state, &mut ctx, decision, tx, cancel).await? {
            Dispatch::Completed => {}
            Dispatch::Interrupted => return Ok(()),
            Dispatch::Cancelled => return Ok(()),
        }
    }

    // ── RECALL ────────────────────────────────────────────────────
    if is_fresh {
        recall_phase(inner, &mut state, tx).await;
    }

    // ── The iteration loop ────────────────────────────────────────
    let max_iterations = ctx.agent.max_iterations.min(inner.config.limits.max_iterations);
    let timeout_seconds = ctx
        .agent
        .timeout_seconds
        .min(inner.config.limits.timeout_seconds);

    loop {
        // TERMINATED is checked before BUILD_CONTEXT.
        let run_iterations = state.iteration - ctx.base_iteration;
        let limit = if run_iterations >= max_iterations {
            Some("max_iterations_exceeded")
        } else if state.cumulative_tokens > inner.config.limits.max_tokens_per_run {
            Some("max_tokens_exceeded")
        } else if ctx.started.elapsed().as_secs() > timeout_seconds {
            Some("timeout")
        } else {
            None
        };
        if let Some(reason) = limit {
            return finish_terminated(inner, &mut state, &mut ctx, tx, reason).await;
        }

        state.iteration += 1;

        // Checkpoint at the start of each iteration (step = iteration).
        state.phase = Phase::BuildContext;
        save_checkpoint(inner, &mut state, &mut ctx).await;

        if cancel.is_cancelled() {
            return finish_cancelled(inner, &mut state, &ctx, tx).await;
        }

        // ── BUILD_CONTEXT ─────────────────────────────────────────
        let built = inner
            .context
            .build(&mut state, &inner.compressor, &ctx.agent.model)
            .await?;
        let _ = tx
            .send(RunEvent::ContextBuilt {
                tokens: built.tokens,
                truncated: built.truncated,
            })
            .await;

        // ── LLM_CALL ──────────────────────────────────────────────
        state.phase = Phase::LlmCall;
        let turn = match llm_call(inner, &ctx, built, tx, cancel).await? {
            LlmTurn::Completed(turn) => turn,
            LlmTurn::Cancelled => return finish_cancelled(inner, &mut state, &ctx, tx).await,
            LlmTurn::Failed => return Ok(()), // error event already emitted
        };

        state.cumulative_tokens += turn.tokens as u64;

        if turn.tool_calls.is_empty() {
            // ── FINALIZE ──────────────────────────────────────────
            state.phase = Phase::Finalize;
            let assistant = Message::assistant(turn.text.clone());
            append_message(inner, &mut state, assistant).await;

            let _ = tx
                .send(RunEvent::FinalMessage {
                    content: turn.text.clone(),
                    tokens: turn.completion_tokens,
                })
                .await;

            // ── CONSOLIDATE: completes before run_completed ───────
            consolidate(inner, &ctx, &state).await;

            state.phase = Phase::Done;
            save_checkpoint(inner, &mut state, &mut ctx).await;

            let _ = tx.send(RunEvent::RunCompleted).await;
            return Ok(());
        }

        // ── TOOL_DISPATCH ─────────────────────────────────────────
        state.phase = Phase::ToolDispatch;
        let assistant = Message::assistant_with_tools(&turn.text, turn.tool_calls.clone());
        append_message(inner, &mut state, assistant).await;

        match dispatch_tools(inner, &mut state, &mut ctx, &turn.tool_calls, tx, cancel).await? {
            Dispatch::Completed => {} // loop back to BUILD_CONTEXT
            Dispatch::Interrupted => return Ok(()),
            Dispatch::Cancelled => return Ok(()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// INIT helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build the starting state for a fresh run: either a brand-new state
/// seeded with the system prompt, or a prior checkpoint's state with the
/// new user message appended. Transcript persistence happens after the
/// session lock is held.
async fn init_fresh_state(
    inner: &Arc<Inner>,
    req: &RunRequest,
) -> Result<(AgentState, Option<Uuid>)> {
    if let Some(checkpoint_id) = req.resume_from {
        let checkpoint = inner.checkpointer.load(checkpoint_id).await?;
        let mut state = checkpoint.state;
        if state.pending_tool_call.is_some() {
            return Err(Error::InvalidInput(
                "checkpoint is suspended on a tool call; resume it with a decision".into(),
            ));
        }
        state.push(Message::user(&req.user_message));
        state.recalled_memories.clear();
        Ok((state, Some(checkpoint_id)))
    } else {
        let mut state = AgentState::new(&req.session_id, req.owner.clone());
        state.push(Message::system(&req.agent.system_prompt));
        state.push(Message::user(&req.user_message));
        Ok((state, None))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RECALL
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn has_prior_assistant_turn(state: &AgentState) -> bool {
    state
        .messages
        .iter()
        .any(|m| m.role == rv_domain::message::Role::Assistant)
}

async fn recall_phase(inner: &Arc<Inner>, state: &mut AgentState, tx: &mpsc::Sender<RunEvent>) {
    use rv_domain::config::RecallPolicy;

    state.phase = Phase::Recall;
    let skip = match inner.config.memory.recall_policy {
        RecallPolicy::FirstTurn => has_prior_assistant_turn(state),
        RecallPolicy::EveryTurn => false,
    };

    let mut recalled: Vec<RecalledMemory> = Vec::new();
    if !skip {
        let query = state.last_user_text().unwrap_or("").to_owned();
        let recall = TieredRecall::new(
            inner.working.clone(),
            inner.long_term.clone(),
            inner.embedder.clone(),
            inner.config.memory.clone(),
        );
        match recall
            .recall(RecallRequest {
                owner: &state.owner,
                session_id: &state.session_id,
                query: &query,
                token_budget: inner.context.recall_budget(),
                short_term: &[],
            })
            .await
        {
            Ok(hits) => {
                recalled = hits
                    .into_iter()
                    .map(|h| RecalledMemory {
                        id: h.id,
                        content: h.content,
                        score: h.score,
                    })
                    .collect();
            }
            Err(e) => {
                // Recall failures degrade to an empty block.
                tracing::warn!(error = %e, "memory recall failed");
            }
        }
    }

    let ids = recalled.iter().map(|m| m.id.clone()).collect();
    state.recalled_memories = recalled;
    let _ = tx
        .send(RunEvent::MemoriesRecalled {
            count: state.recalled_memories.len(),
            ids,
        })
        .await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM_CALL
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct CompletedTurn {
    text: String,
    tool_calls: Vec<ToolCall>,
    /// Total tokens of this call (reported usage, or estimate).
    tokens: u32,
    completion_tokens: u32,
}

enum LlmTurn {
    Completed(CompletedTurn),
    Cancelled,
    /// The error event has already been sent.
    Failed,
}

async fn llm_call(
    inner: &Arc<Inner>,
    ctx: &RunCtx,
    built: BuiltContext,
    tx: &mpsc::Sender<RunEvent>,
    cancel: &CancelToken,
) -> Result<LlmTurn> {
    let prompt_tokens_estimate = built.tokens;
    let req = ChatRequest {
        messages: built.prompt,
        tools: inner.registry.definitions_for(&ctx.agent.tools),
        temperature: Some(ctx.agent.temperature),
        max_tokens: Some(ctx.agent.max_tokens_per_call),
        model: Some(ctx.agent.model.clone()),
        ..Default::default()
    };

    let _ = tx
        .send(RunEvent::LlmCalled {
            model: ctx.agent.model.clone(),
        })
        .await;

    let mut stream = match inner.gateway.chat_stream(req).await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = tx
                .send(RunEvent::Error {
                    kind: e.kind().to_owned(),
                    message: e.to_string(),
                })
                .await;
            return Ok(LlmTurn::Failed);
        }
    };

    let mut text = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut usage: Option<Usage> = None;
    // call_id -> (name, partial args); some providers only stream
    // start + deltas without a finished event.
    let mut partial: std::collections::HashMap<String, (String, String)> =
        std::collections::HashMap::new();

    while let Some(event) = stream.next().await {
        if cancel.is_cancelled() {
            return Ok(LlmTurn::Cancelled);
        }
        match event {
            Ok(StreamEvent::Token { text: chunk }) => {
                let _ = tx
                    .send(RunEvent::TextDelta {
                        chunk: chunk.clone(),
                    })
                    .await;
                text.push_str(&chunk);
            }
            Ok(StreamEvent::ToolCallStarted { call_id, tool_name }) => {
                partial.insert(call_id, (tool_name, String::new()));
            }
            Ok(StreamEvent::ToolCallDelta { call_id, delta }) => {
                if let Some((_, args)) = partial.get_mut(&call_id) {
                    args.push_str(&delta);
                }
            }
            Ok(StreamEvent::ToolCallFinished {
                call_id,
                tool_name,
                arguments,
            }) => {
                partial.remove(&call_id);
                tool_calls.push(ToolCall {
                    id: ensure_call_id(call_id),
                    name: tool_name,
                    arguments,
                });
            }
            Ok(StreamEvent::Done { usage: u, .. }) => {
                usage = u;
            }
            Ok(StreamEvent::Error { message }) => {
                let _ = tx
                    .send(RunEvent::Error {
                        kind: "llm_failed".into(),
                        message,
                    })
                    .await;
                return Ok(LlmTurn::Failed);
            }
            Err(e) => {
                let _ = tx
                    .send(RunEvent::Error {
                        kind: e.kind().to_owned(),
                        message: e.to_string(),
                    })
                    .await;
                return Ok(LlmTurn::Failed);
            }
        }
    }

    // Assemble calls that streamed start/deltas but never finished.
    for (call_id, (name, args_str)) in partial.drain() {
        let arguments = if args_str.trim().is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            serde_json::from_str(&args_str).unwrap_or_else(|e| {
                tracing::warn!(
                    call_id = %call_id,
                    tool = %name,
                    error = %e,
                    "tool call arguments are not valid JSON; defaulting to empty object"
                );
                serde_json::Value::Object(Default::default())
            })
        };
        tool_calls.push(ToolCall {
            id: ensure_call_id(call_id),
            name,
            arguments,
        });
    }

    let (tokens, completion_tokens) = match &usage {
        Some(u) => (u.total_tokens, u.completion_tokens),
        None => {
            let completion = estimate_tokens(&text);
            (prompt_tokens_estimate + completion, completion)
        }
    };

    Ok(LlmTurn::Completed(CompletedTurn {
        text,
        tool_calls,
        tokens,
        completion_tokens,
    }))
}

fn ensure_call_id(call_id: String) -> String {
    if call_id.is_empty() {
        format!("tc_{}", Uuid::new_v4().simple())
    } else {
        call_id
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TOOL_DISPATCH and HITL
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Dispatch calls sequentially in model order, each gated by the HITL
/// policy. A human-approved call never passes through here — `apply_decision`
/// dispatches it directly via [`run_one_tool`].
async fn dispatch_tools(
    inner: &Arc<Inner>,
    state: &mut AgentState,
    ctx: &mut RunCtx,
    calls: &[ToolCall],
    tx: &mpsc::Sender<RunEvent>,
    cancel: &CancelToken,
) -> Result<Dispatch> {
    for tc in calls {
        if cancel.is_cancelled() {
            finish_cancelled(inner, state, ctx, tx).await?;
            return Ok(Dispatch::Cancelled);
        }

        let spec_flagged = inner
            .registry
            .get(&tc.name)
            .map(|s| s.hitl_required)
            .unwrap_or(false);
        if ctx.gate.requires_approval(&tc.name, spec_flagged) {
            // ── INTERRUPT: suspend to a checkpoint ────────────────
            state.pending_tool_call = Some(tc.clone());
            state.phase = Phase::Interrupt;
            let parent = ctx.prev_checkpoint;
            match inner
                .checkpointer
                .save(state, state.iteration, parent)
                .await
            {
                Ok(checkpoint_id) => {
                    ctx.prev_checkpoint = Some(checkpoint_id);
                    let _ = tx
                        .send(RunEvent::Interrupt {
                            checkpoint_id,
                            pending: tc.clone(),
                            reason: format!("approval required for tool '{}'", tc.name),
                        })
                        .await;
                    return Ok(Dispatch::Interrupted);
                }
                Err(e) => {
                    // A suspension without a checkpoint cannot be resumed.
                    let _ = tx
                        .send(RunEvent::Error {
                            kind: "checkpoint_failed".into(),
                            message: format!("cannot suspend for approval: {e}"),
                        })
                        .await;
                    return Ok(Dispatch::Interrupted);
                }
            }
        }

        run_one_tool(inner, state, tc, tx).await;
    }
    Ok(Dispatch::Completed)
}

async fn run_one_tool(
    inner: &Arc<Inner>,
    state: &mut AgentState,
    tc: &ToolCall,
    tx: &mpsc::Sender<RunEvent>,
) {
    let _ = tx
        .send(RunEvent::ToolCalled {
            id: tc.id.clone(),
            name: tc.name.clone(),
            args: tc.arguments.clone(),
        })
        .await;

    let session_ctx = SessionCtx {
        session_id: state.session_id.clone(),
    };
    let result = inner
        .executor
        .execute(&tc.id, &tc.name, &tc.arguments, &session_ctx)
        .await;

    // Tool outputs land in working memory as current-task scratch.
    let scratch = format!("{} -> {}", tc.name, clip(&result.output.to_string(), 500));
    inner.working.remember(
        &state.session_id,
        state.owner.clone(),
        rv_memory::MemoryKind::Episode,
        scratch,
        3.0,
    );

    append_message(inner, state, Message::tool_result(&result)).await;

    let _ = tx
        .send(RunEvent::ToolReturned {
            id: result.tool_call_id.clone(),
            success: result.success,
            output: result.output.clone(),
            duration_ms: result.duration_ms,
        })
        .await;
}

/// Apply a human decision to the suspended state, then drain the rest of
/// the interrupted turn's tool calls.
async fn apply_decision(
    inner: &Arc<Inner>,
    state: &mut AgentState,
    ctx: &mut RunCtx,
    decision: Decision,
    tx: &mpsc::Sender<RunEvent>,
    cancel: &CancelToken,
) -> Result<Dispatch> {
    let Some(mut pending) = state.pending_tool_call.take() else {
        return Err(Error::InvalidInput(
            "checkpoint has no pending tool call".into(),
        ));
    };
    state.phase = Phase::ToolDispatch;

    match decision {
        Decision::Approve => {
            run_one_tool(inner, state, &pending, tx).await;
        }
        Decision::Modify { args } => {
            pending.arguments = args;
            run_one_tool(inner, state, &pending, tx).await;
        }
        Decision::Reject => {
            let result = ToolResult::err(&pending.id, "rejected by user", 0);
            append_message(inner, state, Message::tool_result(&result)).await;
            let _ = tx
                .send(RunEvent::ToolReturned {
                    id: result.tool_call_id.clone(),
                    success: false,
                    output: result.output.clone(),
                    duration_ms: 0,
                })
                .await;
        }
    }

    // The interrupted assistant turn may have further calls after the
    // pending one; they run now, each subject to HITL again.
    let remaining = state.unanswered_tool_calls();
    if remaining.is_empty() {
        return Ok(Dispatch::Completed);
    }
    dispatch_tools(inner, state, ctx, &remaining, tx, cancel).await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Terminal paths
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn finish_terminated(
    inner: &Arc<Inner>,
    state: &mut AgentState,
    ctx: &mut RunCtx,
    tx: &mpsc::Sender<RunEvent>,
    reason: &str,
) -> Result<()> {
    state.phase = Phase::Terminated;
    consolidate(inner, ctx, state).await;
    save_checkpoint(inner, state, ctx).await;

    let iterations = state.iteration - ctx.base_iteration;
    tracing::info!(
        run_id = %ctx.run_id,
        reason,
        iterations,
        "run terminated by limit"
    );
    let _ = tx
        .send(RunEvent::Terminated {
            reason: reason.to_owned(),
            iterations,
        })
        .await;
    Ok(())
}

async fn finish_cancelled(
    inner: &Arc<Inner>,
    state: &mut AgentState,
    ctx: &RunCtx,
    tx: &mpsc::Sender<RunEvent>,
) -> Result<()> {
    // Consolidation is best-effort on the cancellation path.
    consolidate(inner, ctx, state).await;
    let _ = tx.send(RunEvent::Cancelled).await;
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Save a checkpoint; failures are logged and never block progress.
async fn save_checkpoint(inner: &Arc<Inner>, state: &mut AgentState, ctx: &mut RunCtx) {
    let parent = ctx.prev_checkpoint;
    match inner
        .checkpointer
        .save(state, state.iteration, parent)
        .await
    {
        Ok(id) => ctx.prev_checkpoint = Some(id),
        Err(e) => {
            tracing::warn!(
                run_id = %ctx.run_id,
                error = %e,
                "checkpoint write failed, continuing"
            );
        }
    }
}

/// Push to state and append to the transcript store.
async fn append_message(inner: &Arc<Inner>, state: &mut AgentState, message: Message) {
    if let Err(e) = inner.messages.append(&state.session_id, &message).await {
        tracing::warn!(error = %e, "transcript append failed");
    }
    state.push(message);
}

/// Run extraction into long-term memory; failures never block the run.
async fn consolidate(inner: &Arc<Inner>, ctx: &RunCtx, state: &AgentState) {
    let consolidator = Consolidator::new(
        inner.gateway.clone(),
        inner.long_term.clone(),
        inner.embedder.clone(),
        inner.config.memory.clone(),
        Some(ctx.agent.model.clone()),
    );
    match consolidator.consolidate(&state.owner, &state.messages).await {
        Ok(ids) if !ids.is_empty() => {
            tracing::debug!(run_id = %ctx.run_id, items = ids.len(), "memories consolidated");
        }
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(run_id = %ctx.run_id, error = %e, "consolidation failed");
        }
    }
}

fn clip(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_owned();
    }
    let mut end = max;
    while !s.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
