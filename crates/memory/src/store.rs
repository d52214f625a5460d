//! Long-term memory store.
//!
//! [`MemoryStore`] is the capability the engine consumes; [`InMemoryStore`]
//! is the bundled implementation. Writes are idempotent on
//! (owner, content-hash) so parallel consolidation never produces duplicates.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use rv_domain::error::{Error, Result};
use rv_domain::state::OwnerId;

use crate::embedder::cosine_similarity;
use crate::item::{MemoryItem, MemoryKind};

/// A search hit: the item plus its raw similarity to the query.
#[derive(Debug, Clone)]
pub struct ScoredItem {
    pub item: MemoryItem,
    pub similarity: f32,
}

/// The long-term memory capability.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Persist an item, returning its id. Must be idempotent on
    /// (owner, content-hash): re-putting identical content returns the
    /// existing id.
    async fn put(&self, item: MemoryItem) -> Result<String>;

    /// Vector search over one owner's items, optionally filtered by kind.
    /// Results are ordered by raw cosine similarity, best first.
    async fn search(
        &self,
        owner: &OwnerId,
        query_embedding: &[f32],
        k: usize,
        kind_filter: Option<MemoryKind>,
    ) -> Result<Vec<ScoredItem>>;

    /// Record an access: bumps `access_count` and `last_accessed_at`.
    async fn touch(&self, id: &str) -> Result<()>;

    /// Reinforce an existing item instead of inserting a near-duplicate.
    async fn reinforce(&self, id: &str, importance_delta: f32) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// InMemoryStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// HashMap-backed, thread-safe long-term store. Concurrent readers are fine;
/// each write takes the lock once.
#[derive(Default)]
pub struct InMemoryStore {
    items: RwLock<HashMap<String, MemoryItem>>,
    /// (owner, content-hash) -> item id, for idempotent writes.
    dedup_index: RwLock<HashMap<(String, String), String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// Fetch a single item by id (test/introspection helper).
    pub fn get(&self, id: &str) -> Option<MemoryItem> {
        self.items.read().get(id).cloned()
    }
}

fn content_hash(owner: &OwnerId, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(owner.as_str().as_bytes());
    hasher.update(b"\x00");
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn put(&self, item: MemoryItem) -> Result<String> {
        let key = (item.owner.as_str().to_owned(), content_hash(&item.owner, &item.content));

        {
            let index = self.dedup_index.read();
            if let Some(existing_id) = index.get(&key) {
                tracing::debug!(id = %existing_id, "memory put deduplicated by content hash");
                return Ok(existing_id.clone());
            }
        }

        let id = item.id.clone();
        self.items.write().insert(id.clone(), item);
        self.dedup_index.write().insert(key, id.clone());
        Ok(id)
    }

    async fn search(
        &self,
        owner: &OwnerId,
        query_embedding: &[f32],
        k: usize,
        kind_filter: Option<MemoryKind>,
    ) -> Result<Vec<ScoredItem>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let items = self.items.read();
        let mut scored: Vec<ScoredItem> = items
            .values()
            .filter(|item| &item.owner == owner)
            .filter(|item| kind_filter.map_or(true, |kind| item.kind == kind))
            .map(|item| ScoredItem {
                similarity: cosine_similarity(query_embedding, &item.embedding),
                item: item.clone(),
            })
            .collect();

        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn touch(&self, id: &str) -> Result<()> {
        let mut items = self.items.write();
        let item = items
            .get_mut(id)
            .ok_or_else(|| Error::Memory(format!("no such item: {id}")))?;
        item.access_count += 1;
        item.last_accessed_at = Utc::now();
        Ok(())
    }

    async fn reinforce(&self, id: &str, importance_delta: f32) -> Result<()> {
        let mut items = self.items.write();
        let item = items
            .get_mut(id)
            .ok_or_else(|| Error::Memory(format!("no such item: {id}")))?;
        item.importance = (item.importance + importance_delta).clamp(0.0, 10.0);
        item.access_count += 1;
        item.last_accessed_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let removed = self.items.write().remove(id);
        if let Some(item) = removed {
            let key = (item.owner.as_str().to_owned(), content_hash(&item.owner, &item.content));
            self.dedup_index.write().remove(&key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::{Embedder, HashEmbedder};
    use crate::item::MemoryTier;

    async fn item(owner: &OwnerId, content: &str, importance: f32) -> MemoryItem {
        let mut it = MemoryItem::new(
            owner.clone(),
            MemoryTier::Long,
            MemoryKind::Fact,
            content,
            importance,
        );
        it.embedding = HashEmbedder::new().embed(content).await.unwrap();
        it
    }

    #[tokio::test]
    async fn put_then_search_returns_the_item() {
        let store = InMemoryStore::new();
        let owner = OwnerId::user("u1");
        let it = item(&owner, "the user's name is Zhang San", 8.0).await;
        let id = store.put(it).await.unwrap();

        let query = HashEmbedder::new()
            .embed("the user's name is Zhang San")
            .await
            .unwrap();
        let hits = store.search(&owner, &query, 5, None).await.unwrap();
        assert_eq!(hits[0].item.id, id);
        assert!(hits[0].similarity > 0.99);
    }

    #[tokio::test]
    async fn identical_content_is_idempotent() {
        let store = InMemoryStore::new();
        let owner = OwnerId::user("u1");
        let a = store.put(item(&owner, "same fact", 7.0).await).await.unwrap();
        let b = store.put(item(&owner, "same fact", 7.0).await).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn owners_do_not_see_each_other() {
        let store = InMemoryStore::new();
        let u1 = OwnerId::user("u1");
        let u2 = OwnerId::user("u2");
        store.put(item(&u1, "private to u1", 7.0).await).await.unwrap();

        let query = HashEmbedder::new().embed("private to u1").await.unwrap();
        assert!(store.search(&u2, &query, 5, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn kind_filter_narrows_search() {
        let store = InMemoryStore::new();
        let owner = OwnerId::user("u1");
        store.put(item(&owner, "a fact", 7.0).await).await.unwrap();

        let query = HashEmbedder::new().embed("a fact").await.unwrap();
        let hits = store
            .search(&owner, &query, 5, Some(MemoryKind::Preference))
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn reinforce_bumps_importance_and_access() {
        let store = InMemoryStore::new();
        let owner = OwnerId::user("u1");
        let id = store.put(item(&owner, "x", 7.0).await).await.unwrap();

        store.reinforce(&id, 0.5).await.unwrap();
        let it = store.get(&id).unwrap();
        assert_eq!(it.importance, 7.5);
        assert_eq!(it.access_count, 1);
    }

    #[tokio::test]
    async fn delete_also_clears_the_dedup_key() {
        let store = InMemoryStore::new();
        let owner = OwnerId::user("u1");
        let id = store.put(item(&owner, "gone soon", 7.0).await).await.unwrap();
        store.delete(&id).await.unwrap();

        // Re-inserting the same content mints a fresh item.
        let id2 = store.put(item(&owner, "gone soon", 7.0).await).await.unwrap();
        assert_ne!(id, id2);
        assert_eq!(store.len(), 1);
    }
}
