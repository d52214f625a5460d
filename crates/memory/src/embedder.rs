//! Embedding generation for the memory subsystem.
//!
//! Long-tier recall is vector-based, so every persisted item needs an
//! embedding. The built-in [`HashEmbedder`] is deterministic and offline;
//! hosts plug a real model in by implementing [`Embedder`].

use async_trait::async_trait;

use rv_domain::error::Result;

/// Embedding dimension used throughout the memory subsystem.
pub const EMBEDDING_DIM: usize = 384;

/// Async trait for computing fixed-dimension text embeddings.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Return a unit-normalised embedding vector for `text`.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Compute cosine similarity between two vectors.
///
/// Returns a value in `[0, 1]` for unit-normalised inputs; `0.0` when the
/// lengths differ or either vector is all-zeros.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        0.0
    } else {
        (dot / (mag_a * mag_b)).clamp(0.0, 1.0)
    }
}

/// Deterministic, hash-based embedding provider.
///
/// Identical texts always produce the same vector; different texts produce
/// different (but consistent) ones. Suitable for tests, offline use, and as
/// the dedup key space when no embedding model is configured.
#[derive(Debug, Default)]
pub struct HashEmbedder;

impl HashEmbedder {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut raw = vec![0.0f32; EMBEDDING_DIM];
        for (i, ch) in text.chars().enumerate() {
            let idx = (i + ch as usize) % EMBEDDING_DIM;
            raw[idx] += 1.0;
        }
        let mag: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        if mag > 0.0 {
            for v in &mut raw {
                *v /= mag;
            }
        }
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identical_texts_embed_identically() {
        let e = HashEmbedder::new();
        let a = e.embed("my name is Zhang San").await.unwrap();
        let b = e.embed("my name is Zhang San").await.unwrap();
        assert_eq!(a, b);
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn different_texts_diverge() {
        let e = HashEmbedder::new();
        let a = e.embed("the weather in Paris").await.unwrap();
        let b = e.embed("rust borrow checker internals").await.unwrap();
        assert!(cosine_similarity(&a, &b) < 0.99);
    }

    #[tokio::test]
    async fn vectors_are_unit_normalised() {
        let e = HashEmbedder::new();
        let v = e.embed("hello").await.unwrap();
        let mag: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((mag - 1.0).abs() < 1e-5);
    }

    #[test]
    fn cosine_handles_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[0.0, 0.0]), 0.0);
    }
}
