//! LLM gateway for the Reverie runtime.
//!
//! One canonical request/response shape, adapter-per-provider wire
//! translation, SSE streaming, prompt-cache accounting, and a single-retry
//! failure policy. No provider-native objects leak past this crate.

pub mod anthropic;
pub mod gateway;
pub mod openai_compat;
pub mod sse;
pub mod traits;
pub mod util;

pub use gateway::{CacheStatsSnapshot, LlmGateway, ProviderEndpoint};
pub use traits::{ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse, LlmProvider};
