//! Gateway-backed embedder.
//!
//! Adapts the gateway's embeddings endpoint to the memory crate's
//! [`Embedder`] capability, so hosts with a real embedding model can swap
//! out the deterministic hash embedder.

use std::sync::Arc;

use async_trait::async_trait;

use rv_domain::error::{Error, Result};
use rv_memory::Embedder;
use rv_providers::LlmGateway;

pub struct GatewayEmbedder {
    gateway: Arc<LlmGateway>,
    model: Option<String>,
}

impl GatewayEmbedder {
    pub fn new(gateway: Arc<LlmGateway>, model: Option<String>) -> Self {
        Self { gateway, model }
    }
}

#[async_trait]
impl Embedder for GatewayEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let resp = self
            .gateway
            .embeddings(self.model.clone(), vec![text.to_owned()])
            .await
            .map_err(|e| Error::Memory(format!("embedding call failed: {e}")))?;
        resp.embeddings
            .into_iter()
            .next()
            .ok_or_else(|| Error::Memory("embeddings response was empty".into()))
    }
}
