//! Cross-tier recall with weighted ranking.
//!
//! Each tier returns candidates with a local score; the final ranking
//! multiplies per-tier weights (working 1.0, short 0.8, long 0.6) into the
//! local score and takes top-k subject to a token budget for the recalled
//! block. Long-tier local scores blend similarity, importance, and recency.

use std::sync::Arc;

use chrono::Utc;

use rv_domain::config::MemoryConfig;
use rv_domain::error::Result;
use rv_domain::state::OwnerId;

use crate::embedder::Embedder;
use crate::item::MemoryItem;
use crate::store::MemoryStore;
use crate::working::WorkingMemory;

const WEIGHT_WORKING: f32 = 1.0;
const WEIGHT_SHORT: f32 = 0.8;
const WEIGHT_LONG: f32 = 0.6;

/// A recall request for one turn.
pub struct RecallRequest<'a> {
    pub owner: &'a OwnerId,
    pub session_id: &'a str,
    pub query: &'a str,
    /// Token budget for the whole recalled block (chars/4 estimate).
    pub token_budget: u32,
    /// Short-tier candidates: recent history lines the caller wants scored
    /// alongside the stores. Usually empty — history is already in context.
    pub short_term: &'a [String],
}

/// One recalled item with its final weighted score.
#[derive(Debug, Clone)]
pub struct Recalled {
    pub id: String,
    pub content: String,
    pub score: f32,
}

/// Recall across the working and long tiers (plus caller-supplied short-term
/// lines), ranked by weighted score.
pub struct TieredRecall {
    working: Arc<WorkingMemory>,
    long_term: Arc<dyn MemoryStore>,
    embedder: Arc<dyn Embedder>,
    config: MemoryConfig,
}

impl TieredRecall {
    pub fn new(
        working: Arc<WorkingMemory>,
        long_term: Arc<dyn MemoryStore>,
        embedder: Arc<dyn Embedder>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            working,
            long_term,
            embedder,
            config,
        }
    }

    /// Long-tier local score: 0.5·similarity + 0.2·importance/10 + 0.3·recency,
    /// with recency = max(0, 1 − days_since_access/30).
    fn long_local_score(item: &MemoryItem, similarity: f32) -> f32 {
        let recency = (1.0 - item.days_since_access(Utc::now()) / 30.0).max(0.0);
        0.5 * similarity + 0.2 * (item.importance / 10.0) + 0.3 * recency
    }

    pub async fn recall(&self, req: RecallRequest<'_>) -> Result<Vec<Recalled>> {
        let k = self.config.recall_top_k;
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut candidates: Vec<Recalled> = Vec::new();

        // ── Working tier: linear scan ─────────────────────────────
        for (item, local) in self.working.recall(req.session_id, req.query, k) {
            candidates.push(Recalled {
                id: item.id,
                content: item.content,
                score: WEIGHT_WORKING * local,
            });
        }

        // ── Short tier: caller-supplied history lines ─────────────
        let query_words: Vec<String> = req
            .query
            .split_whitespace()
            .map(|w| w.to_lowercase())
            .collect();
        for (i, line) in req.short_term.iter().enumerate() {
            let lower = line.to_lowercase();
            let matches = query_words
                .iter()
                .filter(|w| lower.contains(w.as_str()))
                .count();
            if matches == 0 || query_words.is_empty() {
                continue;
            }
            let local = matches as f32 / query_words.len() as f32;
            candidates.push(Recalled {
                id: format!("short_{i}"),
                content: line.clone(),
                score: WEIGHT_SHORT * local,
            });
        }

        // ── Long tier: vector search; failures degrade to empty ──
        match self.embedder.embed(req.query).await {
            Ok(query_embedding) => {
                match self
                    .long_term
                    .search(req.owner, &query_embedding, k, None)
                    .await
                {
                    Ok(hits) => {
                        for hit in hits {
                            let local = Self::long_local_score(&hit.item, hit.similarity);
                            if let Err(e) = self.long_term.touch(&hit.item.id).await {
                                tracing::warn!(error = %e, id = %hit.item.id, "memory touch failed");
                            }
                            candidates.push(Recalled {
                                id: hit.item.id,
                                content: hit.item.content,
                                score: WEIGHT_LONG * local,
                            });
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "long-term recall failed, continuing without it");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed, skipping long-term recall");
            }
        }

        // ── Rank and fit the token budget ─────────────────────────
        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let mut selected = Vec::new();
        let mut spent: u32 = 0;
        for c in candidates {
            let cost = (c.content.len() as u32 + 3) / 4;
            if selected.len() >= k || spent + cost > req.token_budget {
                continue;
            }
            spent += cost;
            selected.push(c);
        }

        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::HashEmbedder;
    use crate::item::{MemoryKind, MemoryTier};
    use crate::store::InMemoryStore;

    async fn recaller(store: Arc<InMemoryStore>) -> TieredRecall {
        TieredRecall::new(
            Arc::new(WorkingMemory::new()),
            store,
            Arc::new(HashEmbedder::new()),
            MemoryConfig::default(),
        )
    }

    async fn seed(store: &InMemoryStore, owner: &OwnerId, content: &str, importance: f32) -> String {
        let mut item = MemoryItem::new(
            owner.clone(),
            MemoryTier::Long,
            MemoryKind::Fact,
            content,
            importance,
        );
        item.embedding = HashEmbedder::new().embed(content).await.unwrap();
        store.put(item).await.unwrap()
    }

    #[tokio::test]
    async fn exact_content_query_recalls_the_item() {
        let store = Arc::new(InMemoryStore::new());
        let owner = OwnerId::user("u1");
        let id = seed(&store, &owner, "the user's name is Zhang San", 8.0).await;

        let recall = recaller(store.clone()).await;
        let hits = recall
            .recall(RecallRequest {
                owner: &owner,
                session_id: "s1",
                query: "the user's name is Zhang San",
                token_budget: 1000,
                short_term: &[],
            })
            .await
            .unwrap();

        assert_eq!(hits[0].id, id);
        assert!(hits[0].content.contains("Zhang San"));
        // Recall touched the item.
        assert_eq!(store.get(&id).unwrap().access_count, 1);
    }

    #[tokio::test]
    async fn working_tier_outranks_long_tier_at_equal_local_score() {
        let store = Arc::new(InMemoryStore::new());
        let owner = OwnerId::user("u1");
        seed(&store, &owner, "deploy checklist step one", 8.0).await;

        let working = Arc::new(WorkingMemory::new());
        working.remember("s1", owner.clone(), MemoryKind::Episode, "deploy checklist step one", 3.0);

        let recall = TieredRecall::new(
            working,
            store,
            Arc::new(HashEmbedder::new()),
            MemoryConfig::default(),
        );
        let hits = recall
            .recall(RecallRequest {
                owner: &owner,
                session_id: "s1",
                query: "deploy checklist step one",
                token_budget: 1000,
                short_term: &[],
            })
            .await
            .unwrap();

        assert!(hits.len() >= 2);
        // Working weight 1.0 beats long weight 0.6 for the same content.
        assert!(hits[0].id.starts_with("mem_"));
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn token_budget_drops_overflowing_items() {
        let store = Arc::new(InMemoryStore::new());
        let owner = OwnerId::user("u1");
        seed(&store, &owner, &"long fact ".repeat(100), 8.0).await;

        let recall = recaller(store).await;
        let hits = recall
            .recall(RecallRequest {
                owner: &owner,
                session_id: "s1",
                query: "long fact",
                token_budget: 10,
                short_term: &[],
            })
            .await
            .unwrap();
        assert!(hits.is_empty());
    }
}
