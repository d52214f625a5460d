//! Tiered memory for the Reverie runtime.
//!
//! Three tiers with distinct lifecycles: working memory is process-local and
//! dies with the session, short-term memory is the checkpointed message
//! history (not a store of its own), and long-term memory is per-owner,
//! persistent, and semantically indexed.

pub mod consolidate;
pub mod embedder;
pub mod item;
pub mod recall;
pub mod store;
pub mod working;

pub use consolidate::Consolidator;
pub use embedder::{cosine_similarity, Embedder, HashEmbedder, EMBEDDING_DIM};
pub use item::{MemoryItem, MemoryKind, MemoryTier};
pub use recall::{RecallRequest, Recalled, TieredRecall};
pub use store::{InMemoryStore, MemoryStore, ScoredItem};
pub use working::WorkingMemory;
