use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub hitl: HitlConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run limits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Hard cap on LLM turns per run.
    #[serde(default = "d_10")]
    pub max_iterations: u32,
    /// Cumulative token budget triggering termination.
    #[serde(default = "d_64000")]
    pub max_tokens_per_run: u64,
    /// Wall-clock cap per run.
    #[serde(default = "d_120")]
    pub timeout_seconds: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_tokens_per_run: 64_000,
            timeout_seconds: 120,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context assembly / compression
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "d_32000")]
    pub context_window_tokens: u32,
    /// Tokens reserved for model output when computing the prompt budget.
    #[serde(default = "d_4096")]
    pub output_reserve_tokens: u32,
    /// Fraction of the budget above which the middle slice is summarized.
    #[serde(default = "d_ratio_07")]
    pub compression_trigger_ratio: f32,
    /// Leading turns never pruned or summarized.
    #[serde(default = "d_2")]
    pub head_preserve_turns: usize,
    /// Trailing messages never pruned or summarized.
    #[serde(default = "d_6")]
    pub tail_preserve_messages: usize,
    /// Tokens reserved for the system prompt + any summary block.
    #[serde(default = "d_2000")]
    pub system_reserve_tokens: u32,
    /// Recalled-memory block cap, as a fraction of the post-reserve budget.
    #[serde(default = "d_ratio_02")]
    pub recall_budget_ratio: f32,
    /// Keywords that raise a message's importance score.
    #[serde(default = "d_keywords")]
    pub score_keywords: Vec<String>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            context_window_tokens: 32_000,
            output_reserve_tokens: 4096,
            compression_trigger_ratio: 0.7,
            head_preserve_turns: 2,
            tail_preserve_messages: 6,
            system_reserve_tokens: 2000,
            recall_budget_ratio: 0.2,
            score_keywords: d_keywords(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tiered memory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Importance cutoff below which items never reach the long tier.
    #[serde(default = "d_threshold")]
    pub long_term_threshold: f32,
    /// Max items returned per recall.
    #[serde(default = "d_5")]
    pub recall_top_k: usize,
    /// Cosine similarity above which a new item merges into an existing one.
    /// Clamped to [0.85, 0.95] at load.
    #[serde(default = "d_dedup")]
    pub dedup_similarity: f32,
    #[serde(default)]
    pub recall_policy: RecallPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecallPolicy {
    /// Recall only on the first turn of a session within an invocation.
    #[default]
    FirstTurn,
    /// Recall before every LLM turn.
    EveryTurn,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            long_term_threshold: 6.0,
            recall_top_k: 5,
            dedup_similarity: 0.9,
            recall_policy: RecallPolicy::FirstTurn,
        }
    }
}

impl MemoryConfig {
    /// Dedup similarity with the conformant clamp applied.
    pub fn dedup_similarity_clamped(&self) -> f32 {
        self.dedup_similarity.clamp(0.85, 0.95)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HITL (host-level defaults; agent definitions may extend)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HitlConfig {
    /// Glob patterns over tool names requiring approval.
    #[serde(default)]
    pub require_patterns: Vec<String>,
    /// Glob patterns that bypass a matching require pattern.
    #[serde(default)]
    pub auto_approve_patterns: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM gateway
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "d_true")]
    pub prompt_cache_enabled: bool,
    /// Base delay before the single transient retry.
    #[serde(default = "d_500")]
    pub retry_backoff_ms: u64,
    /// Cap on rate-limit waits when the provider gives no hint.
    #[serde(default = "d_5000")]
    pub rate_limit_max_wait_ms: u64,
    #[serde(default = "d_req_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            prompt_cache_enabled: true,
            retry_backoff_ms: 500,
            rate_limit_max_wait_ms: 5000,
            request_timeout_seconds: 120,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tools & sandbox
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Uniform cap on tool output length; overruns are annotated.
    #[serde(default = "d_10000")]
    pub output_cap_chars: usize,
    /// Wall-clock timeout per tool call.
    #[serde(default = "d_30")]
    pub timeout_seconds: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            output_cap_chars: 10_000,
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Backend image/profile identifier (backend-specific).
    #[serde(default = "d_image")]
    pub image: String,
    #[serde(default = "d_512")]
    pub memory_mb: u64,
    #[serde(default = "d_cpus")]
    pub cpus: f32,
    /// Host network access. Off by default.
    #[serde(default)]
    pub network: bool,
    #[serde(default = "d_30")]
    pub timeout_seconds: u64,
    /// Lease one long-lived sandbox per session instead of one per call.
    #[serde(default)]
    pub per_session: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: d_image(),
            memory_mb: 512,
            cpus: 1.0,
            network: false,
            timeout_seconds: 30,
            per_session: false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionConfig {
    #[serde(default)]
    pub busy_policy: BusyPolicy,
}

/// What happens when a second run arrives for a session mid-turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    /// Wait behind the in-flight run (single waiter).
    #[default]
    Queue,
    /// Reject immediately with a busy error.
    FailFast,
}

// ── serde default helpers ──────────────────────────────────────────

fn d_2() -> usize {
    2
}
fn d_5() -> usize {
    5
}
fn d_6() -> usize {
    6
}
fn d_10() -> u32 {
    10
}
fn d_30() -> u64 {
    30
}
fn d_120() -> u64 {
    120
}
fn d_500() -> u64 {
    500
}
fn d_512() -> u64 {
    512
}
fn d_2000() -> u32 {
    2000
}
fn d_4096() -> u32 {
    4096
}
fn d_5000() -> u64 {
    5000
}
fn d_10000() -> usize {
    10_000
}
fn d_32000() -> u32 {
    32_000
}
fn d_64000() -> u64 {
    64_000
}
fn d_ratio_07() -> f32 {
    0.7
}
fn d_ratio_02() -> f32 {
    0.2
}
fn d_threshold() -> f32 {
    6.0
}
fn d_dedup() -> f32 {
    0.9
}
fn d_true() -> bool {
    true
}
fn d_cpus() -> f32 {
    1.0
}
fn d_req_timeout() -> u64 {
    120
}
fn d_image() -> String {
    "local/process".into()
}
fn d_keywords() -> Vec<String> {
    [
        "decision", "decided", "todo", "must", "always", "never", "prefer",
        "important", "error", "fix", "plan",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let cfg: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.limits.max_iterations, 10);
        assert_eq!(cfg.context.compression_trigger_ratio, 0.7);
        assert_eq!(cfg.context.head_preserve_turns, 2);
        assert_eq!(cfg.context.tail_preserve_messages, 6);
        assert_eq!(cfg.memory.long_term_threshold, 6.0);
        assert_eq!(cfg.tools.output_cap_chars, 10_000);
        assert!(cfg.gateway.prompt_cache_enabled);
        assert!(!cfg.sandbox.network);
        assert_eq!(cfg.session.busy_policy, BusyPolicy::Queue);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let cfg: EngineConfig = toml::from_str(
            r#"
            [limits]
            max_iterations = 3

            [memory]
            dedup_similarity = 0.99
            recall_policy = "every_turn"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.limits.max_iterations, 3);
        assert_eq!(cfg.limits.timeout_seconds, 120);
        assert_eq!(cfg.memory.recall_policy, RecallPolicy::EveryTurn);
        // Out-of-range dedup thresholds clamp into the conformant band.
        assert_eq!(cfg.memory.dedup_similarity_clamped(), 0.95);
    }
}
