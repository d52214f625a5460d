use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use rv_domain::state::OwnerId;

/// Which tier an item lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryTier {
    Working,
    Short,
    Long,
}

/// Semantic type of a memory item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Fact,
    Preference,
    Procedure,
    Episode,
    SessionSummary,
}

/// A single memory item. Long-tier items carry an embedding and are the only
/// ones that survive the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: String,
    pub owner: OwnerId,
    pub tier: MemoryTier,
    pub kind: MemoryKind,
    pub content: String,
    /// Importance in [0, 10]. Items below the configured threshold are never
    /// promoted to the long tier.
    pub importance: f32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u32,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl MemoryItem {
    pub fn new(
        owner: OwnerId,
        tier: MemoryTier,
        kind: MemoryKind,
        content: impl Into<String>,
        importance: f32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: format!("mem_{}", uuid::Uuid::new_v4().simple()),
            owner,
            tier,
            kind,
            content: content.into(),
            importance: importance.clamp(0.0, 10.0),
            embedding: Vec::new(),
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_owned(), value);
        self
    }

    /// Days since this item was last accessed.
    pub fn days_since_access(&self, now: DateTime<Utc>) -> f32 {
        let secs = (now - self.last_accessed_at).num_seconds().max(0) as f32;
        secs / 86_400.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn importance_clamps_into_range() {
        let owner = OwnerId::user("u1");
        let hi = MemoryItem::new(owner.clone(), MemoryTier::Long, MemoryKind::Fact, "x", 42.0);
        assert_eq!(hi.importance, 10.0);
        let lo = MemoryItem::new(owner, MemoryTier::Long, MemoryKind::Fact, "x", -1.0);
        assert_eq!(lo.importance, 0.0);
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&MemoryKind::SessionSummary).unwrap();
        assert_eq!(json, "\"session_summary\"");
    }
}
