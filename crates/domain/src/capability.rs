use serde::{Deserialize, Serialize};

/// LLM model capabilities — every {provider, model} advertises these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCapabilities {
    pub supports_tools: bool,
    pub supports_streaming: bool,
    pub prompt_cache: PromptCacheSupport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

impl Default for LlmCapabilities {
    fn default() -> Self {
        Self {
            supports_tools: false,
            supports_streaming: false,
            prompt_cache: PromptCacheSupport::None,
            context_window_tokens: None,
            max_output_tokens: None,
        }
    }
}

/// How a provider participates in prompt caching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptCacheSupport {
    /// No caching reported or requestable.
    None,
    /// Explicit cache markers on message blocks (Anthropic, DeepSeek).
    Explicit {
        /// Minimum cacheable prefix length in tokens.
        min_prefix_tokens: u32,
    },
    /// Automatic prefix caching; relies on stable ordering (OpenAI).
    Automatic,
}
