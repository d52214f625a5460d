//! The LLM gateway — single entry point for all model calls.
//!
//! Responsibilities: pick the adapter from the model id, toggle prompt-cache
//! markers, apply the one-retry failure policy, and account cache hits.
//! Callers never see provider-native shapes; adapters never see each other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rv_domain::config::GatewayConfig;
use rv_domain::error::{Error, Result};
use rv_domain::stream::{BoxStream, StreamEvent, Usage};

use crate::traits::{ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse, LlmProvider};
use crate::util::parse_retry_hint_ms;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cache statistics
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Monotonic prompt-cache counters. Shared across runs; no ordering
/// requirement beyond atomicity.
#[derive(Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    saved_tokens: AtomicU64,
}

/// Point-in-time view of the gateway's cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub saved_tokens: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Gateway
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A registered adapter plus the model-id prefixes it serves.
pub struct ProviderEndpoint {
    pub prefixes: Vec<String>,
    pub provider: Arc<dyn LlmProvider>,
}

/// Multi-provider gateway with prompt caching and a single-retry policy.
pub struct LlmGateway {
    endpoints: Vec<ProviderEndpoint>,
    config: GatewayConfig,
    stats: CacheStats,
}

impl LlmGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            endpoints: Vec::new(),
            config,
            stats: CacheStats::default(),
        }
    }

    /// Register an adapter for the given model-id prefixes
    /// (e.g. `["claude", "anthropic/"]`). Later registrations never shadow
    /// earlier ones; the first match wins.
    pub fn register(&mut self, prefixes: &[&str], provider: Arc<dyn LlmProvider>) {
        tracing::info!(
            provider_id = provider.provider_id(),
            prefixes = ?prefixes,
            "registered LLM provider"
        );
        self.endpoints.push(ProviderEndpoint {
            prefixes: prefixes.iter().map(|s| s.to_string()).collect(),
            provider,
        });
    }

    /// Resolve the adapter for a model id.
    ///
    /// A `provider/model` spec matches on the provider id; a bare model id
    /// matches on registered prefixes; otherwise the first registered
    /// provider serves as the default.
    pub fn resolve(&self, model: &str) -> Result<Arc<dyn LlmProvider>> {
        if let Some((provider_id, _)) = model.split_once('/') {
            if let Some(ep) = self
                .endpoints
                .iter()
                .find(|ep| ep.provider.provider_id() == provider_id)
            {
                return Ok(ep.provider.clone());
            }
        }

        for ep in &self.endpoints {
            if ep.prefixes.iter().any(|p| model.starts_with(p.as_str())) {
                return Ok(ep.provider.clone());
            }
        }

        self.endpoints
            .first()
            .map(|ep| ep.provider.clone())
            .ok_or_else(|| Error::Config("no LLM providers registered".into()))
    }

    /// Strip a `provider/` prefix so adapters see the bare model name.
    fn effective_model(model: &str) -> String {
        model
            .split_once('/')
            .map(|(_, m)| m.to_owned())
            .unwrap_or_else(|| model.to_owned())
    }

    fn prepare(&self, req: &mut ChatRequest) {
        req.cache_markers = self.config.prompt_cache_enabled;
        if let Some(model) = &req.model {
            req.model = Some(Self::effective_model(model));
        }
    }

    /// Delay before the single retry: provider hint when present (capped),
    /// else the configured backoff doubled from the base.
    fn retry_delay(&self, err: &Error, attempt: u32) -> std::time::Duration {
        let hinted = parse_retry_hint_ms(&err.to_string())
            .map(|ms| ms.min(self.config.rate_limit_max_wait_ms));
        let ms = hinted.unwrap_or(self.config.retry_backoff_ms * 2u64.pow(attempt));
        std::time::Duration::from_millis(ms)
    }

    fn record_usage(&self, usage: &Usage) {
        if usage.cache_read_tokens > 0 {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            self.stats
                .saved_tokens
                .fetch_add(usage.cache_read_tokens as u64, Ordering::Relaxed);
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            saved_tokens: self.stats.saved_tokens.load(Ordering::Relaxed),
        }
    }

    // ── Entry points ───────────────────────────────────────────────

    /// Non-streaming chat completion with the one-retry policy.
    pub async fn chat(&self, mut req: ChatRequest) -> Result<ChatResponse> {
        let model = req.model.clone().unwrap_or_default();
        let provider = self.resolve(&model)?;
        self.prepare(&mut req);

        match provider.chat(&req).await {
            Ok(resp) => {
                if let Some(usage) = &resp.usage {
                    self.record_usage(usage);
                }
                Ok(resp)
            }
            Err(e) if e.is_retryable() => {
                let delay = self.retry_delay(&e, 0);
                tracing::warn!(
                    provider = provider.provider_id(),
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "transient LLM error, retrying once"
                );
                tokio::time::sleep(delay).await;
                match provider.chat(&req).await {
                    Ok(resp) => {
                        if let Some(usage) = &resp.usage {
                            self.record_usage(usage);
                        }
                        Ok(resp)
                    }
                    Err(e2) => Err(exhaust(provider.provider_id(), e2)),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Streaming chat completion. The connect is retried once on transient
    /// failure; mid-stream errors are surfaced as stream events. Usage from
    /// the terminal `Done` event feeds the cache counters.
    pub async fn chat_stream(
        self: &Arc<Self>,
        mut req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let model = req.model.clone().unwrap_or_default();
        let provider = self.resolve(&model)?;
        self.prepare(&mut req);

        let inner = match provider.chat_stream(&req).await {
            Ok(stream) => stream,
            Err(e) if e.is_retryable() => {
                let delay = self.retry_delay(&e, 0);
                tracing::warn!(
                    provider = provider.provider_id(),
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "transient LLM stream error, retrying once"
                );
                tokio::time::sleep(delay).await;
                provider
                    .chat_stream(&req)
                    .await
                    .map_err(|e2| exhaust(provider.provider_id(), e2))?
            }
            Err(e) => return Err(e),
        };

        // Observe Done events for cache accounting without disturbing order.
        let gateway = Arc::clone(self);
        let stream = async_stream::stream! {
            let mut inner = inner;
            while let Some(event) = futures_util::StreamExt::next(&mut inner).await {
                if let Ok(StreamEvent::Done { usage: Some(usage), .. }) = &event {
                    gateway.record_usage(usage);
                }
                yield event;
            }
        };
        Ok(Box::pin(stream))
    }

    /// Embeddings, routed like chat. No retry: embedding callers degrade
    /// gracefully (empty recall) per the memory failure policy.
    pub async fn embeddings(
        &self,
        model: Option<String>,
        input: Vec<String>,
    ) -> Result<EmbeddingsResponse> {
        let spec = model.clone().unwrap_or_default();
        let provider = self.resolve(&spec)?;
        provider
            .embeddings(EmbeddingsRequest {
                input,
                model: model.map(|m| Self::effective_model(&m)),
            })
            .await
    }
}

/// Fold a second consecutive failure into the terminal error kind.
fn exhaust(provider: &str, err: Error) -> Error {
    match err {
        Error::LlmTransient { message, .. } | Error::Http(message) => Error::LlmFailed {
            provider: provider.to_owned(),
            message: format!("retries exhausted: {message}"),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rv_domain::capability::LlmCapabilities;
    use rv_domain::message::Message;
    use std::sync::atomic::AtomicU32;

    /// Provider that fails N times before succeeding.
    struct FlakyProvider {
        id: String,
        failures: AtomicU32,
        caps: LlmCapabilities,
        usage: Usage,
    }

    impl FlakyProvider {
        fn new(id: &str, failures: u32, cache_read: u32) -> Self {
            Self {
                id: id.into(),
                failures: AtomicU32::new(failures),
                caps: LlmCapabilities::default(),
                usage: Usage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                    cache_read_tokens: cache_read,
                },
            }
        }
    }

    #[async_trait::async_trait]
    impl LlmProvider for FlakyProvider {
        async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::LlmTransient {
                    provider: self.id.clone(),
                    message: "rate limited (retry after 1ms): slow".into(),
                });
            }
            Ok(ChatResponse {
                content: "ok".into(),
                tool_calls: vec![],
                usage: Some(self.usage.clone()),
                model: "m".into(),
                finish_reason: Some("stop".into()),
            })
        }

        async fn chat_stream(
            &self,
            _req: &ChatRequest,
        ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
            let usage = self.usage.clone();
            Ok(Box::pin(async_stream::stream! {
                yield Ok(StreamEvent::Token { text: "ok".into() });
                yield Ok(StreamEvent::Done { usage: Some(usage), finish_reason: Some("stop".into()) });
            }))
        }

        async fn embeddings(&self, _req: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
            Ok(EmbeddingsResponse { embeddings: vec![] })
        }

        fn capabilities(&self) -> &LlmCapabilities {
            &self.caps
        }

        fn provider_id(&self) -> &str {
            &self.id
        }
    }

    fn gateway_with(provider: FlakyProvider) -> Arc<LlmGateway> {
        let mut gw = LlmGateway::new(GatewayConfig {
            retry_backoff_ms: 1,
            ..Default::default()
        });
        gw.register(&["m"], Arc::new(provider));
        Arc::new(gw)
    }

    fn request() -> ChatRequest {
        ChatRequest {
            messages: vec![Message::user("hi")],
            model: Some("m".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn one_transient_failure_is_retried() {
        let gw = gateway_with(FlakyProvider::new("p", 1, 0));
        let resp = gw.chat(request()).await.unwrap();
        assert_eq!(resp.content, "ok");
    }

    #[tokio::test]
    async fn two_failures_exhaust_retries() {
        let gw = gateway_with(FlakyProvider::new("p", 2, 0));
        let err = gw.chat(request()).await.unwrap_err();
        assert_eq!(err.kind(), "llm_failed");
    }

    #[tokio::test]
    async fn cache_hits_feed_the_counters() {
        let gw = gateway_with(FlakyProvider::new("p", 0, 8));
        gw.chat(request()).await.unwrap();
        let stats = gw.cache_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.saved_tokens, 8);

        // Streaming usage counts too.
        let mut stream = gw.chat_stream(request()).await.unwrap();
        while futures_util::StreamExt::next(&mut stream).await.is_some() {}
        assert_eq!(gw.cache_stats().hits, 2);
    }

    #[tokio::test]
    async fn provider_spec_resolves_by_id() {
        let gw = gateway_with(FlakyProvider::new("acme", 0, 0));
        assert!(gw.resolve("acme/some-model").is_ok());
        // Unknown specs fall back to the first registration.
        assert!(gw.resolve("mystery-model").is_ok());
    }

    #[test]
    fn empty_gateway_resolves_to_config_error() {
        let gw = LlmGateway::new(GatewayConfig::default());
        assert!(gw.resolve("anything").is_err());
    }
}
