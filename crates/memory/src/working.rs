//! Working memory — process-local scratch keyed by session id.
//!
//! Holds current-task material (tool outputs awaiting summarization,
//! intermediate plans). Lives only as long as the process and is cleared
//! when the session ends. Recall is a linear scan.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::item::{MemoryItem, MemoryKind, MemoryTier};
use rv_domain::state::OwnerId;

#[derive(Default)]
pub struct WorkingMemory {
    by_session: RwLock<HashMap<String, Vec<MemoryItem>>>,
}

impl WorkingMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember(
        &self,
        session_id: &str,
        owner: OwnerId,
        kind: MemoryKind,
        content: impl Into<String>,
        importance: f32,
    ) -> String {
        let item = MemoryItem::new(owner, MemoryTier::Working, kind, content, importance);
        let id = item.id.clone();
        self.by_session
            .write()
            .entry(session_id.to_owned())
            .or_default()
            .push(item);
        id
    }

    /// Linear-scan recall: local score is the fraction of query words found
    /// in the item's content.
    pub fn recall(&self, session_id: &str, query: &str, k: usize) -> Vec<(MemoryItem, f32)> {
        let query_words: Vec<String> = query
            .split_whitespace()
            .map(|w| w.to_lowercase())
            .collect();
        if query_words.is_empty() || k == 0 {
            return Vec::new();
        }

        let sessions = self.by_session.read();
        let Some(items) = sessions.get(session_id) else {
            return Vec::new();
        };

        let mut scored: Vec<(MemoryItem, f32)> = items
            .iter()
            .map(|item| {
                let content = item.content.to_lowercase();
                let matches = query_words.iter().filter(|w| content.contains(w.as_str())).count();
                (item.clone(), matches as f32 / query_words.len() as f32)
            })
            .filter(|(_, score)| *score > 0.0)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }

    /// Items currently held for a session (newest last).
    pub fn items(&self, session_id: &str) -> Vec<MemoryItem> {
        self.by_session
            .read()
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop everything for a session. Called at session end.
    pub fn clear_session(&self, session_id: &str) {
        self.by_session.write().remove(session_id);
    }

    pub fn session_count(&self) -> usize {
        self.by_session.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> OwnerId {
        OwnerId::user("u1")
    }

    #[test]
    fn recall_scores_by_word_overlap() {
        let wm = WorkingMemory::new();
        wm.remember("s1", owner(), MemoryKind::Episode, "grep output for main.rs", 3.0);
        wm.remember("s1", owner(), MemoryKind::Episode, "weather in Oslo", 3.0);

        let hits = wm.recall("s1", "output of grep", 5);
        assert_eq!(hits.len(), 1);
        assert!(hits[0].0.content.contains("grep"));
    }

    #[test]
    fn sessions_are_isolated_and_clearable() {
        let wm = WorkingMemory::new();
        wm.remember("s1", owner(), MemoryKind::Fact, "alpha beta", 3.0);
        assert!(wm.recall("s2", "alpha", 5).is_empty());

        wm.clear_session("s1");
        assert!(wm.recall("s1", "alpha", 5).is_empty());
        assert_eq!(wm.session_count(), 0);
    }

    #[test]
    fn zero_k_returns_nothing() {
        let wm = WorkingMemory::new();
        wm.remember("s1", owner(), MemoryKind::Fact, "alpha", 3.0);
        assert!(wm.recall("s1", "alpha", 0).is_empty());
    }
}
