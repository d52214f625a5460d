//! Ephemeral checkpoint store for tests and single-process hosts.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use rv_domain::error::{Error, Result};
use rv_domain::state::{AgentState, Checkpoint, CheckpointMeta};

use crate::Checkpointer;

/// In-memory checkpointer. One lock guards both indexes, which also
/// serializes same-session writes.
#[derive(Default)]
pub struct InMemoryCheckpointer {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<Uuid, Checkpoint>,
    /// session id -> checkpoint ids in save order.
    by_session: HashMap<String, Vec<Uuid>>,
}

impl InMemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().by_id.is_empty()
    }

    /// Number of checkpoints saved for one session.
    pub fn session_len(&self, session_id: &str) -> usize {
        self.inner
            .lock()
            .by_session
            .get(session_id)
            .map_or(0, |v| v.len())
    }
}

#[async_trait]
impl Checkpointer for InMemoryCheckpointer {
    async fn save(
        &self,
        state: &AgentState,
        step: u32,
        parent: Option<Uuid>,
    ) -> Result<Uuid> {
        let checkpoint = Checkpoint {
            id: Uuid::new_v4(),
            session_id: state.session_id.clone(),
            step,
            state: state.clone(),
            parent_id: parent,
            created_at: Utc::now(),
        };
        let id = checkpoint.id;

        let mut inner = self.inner.lock();
        if let Some(ids) = inner.by_session.get(&checkpoint.session_id) {
            if let Some(last) = ids.last().and_then(|last| inner.by_id.get(last)) {
                if step < last.step {
                    tracing::warn!(
                        session_id = %checkpoint.session_id,
                        step,
                        last_step = last.step,
                        "checkpoint step regressed"
                    );
                }
            }
        }
        inner
            .by_session
            .entry(checkpoint.session_id.clone())
            .or_default()
            .push(id);
        inner.by_id.insert(id, checkpoint);
        Ok(id)
    }

    async fn load(&self, id: Uuid) -> Result<Checkpoint> {
        self.inner
            .lock()
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::Checkpoint(format!("no such checkpoint: {id}")))
    }

    async fn latest(&self, session_id: &str) -> Result<Option<Checkpoint>> {
        let inner = self.inner.lock();
        Ok(inner
            .by_session
            .get(session_id)
            .and_then(|ids| ids.last())
            .and_then(|id| inner.by_id.get(id))
            .cloned())
    }

    async fn list(&self, session_id: &str, limit: usize) -> Result<Vec<CheckpointMeta>> {
        let inner = self.inner.lock();
        let Some(ids) = inner.by_session.get(session_id) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| inner.by_id.get(id))
            .map(CheckpointMeta::from)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rv_domain::message::Message;
    use rv_domain::state::OwnerId;

    fn state() -> AgentState {
        let mut s = AgentState::new("s1", OwnerId::user("u1"));
        s.push(Message::user("hi"));
        s
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let cp = InMemoryCheckpointer::new();
        let id = cp.save(&state(), 1, None).await.unwrap();
        let loaded = cp.load(id).await.unwrap();
        assert_eq!(loaded.step, 1);
        assert_eq!(loaded.state.messages.len(), 1);
        assert!(loaded.parent_id.is_none());
    }

    #[tokio::test]
    async fn latest_and_list_track_save_order() {
        let cp = InMemoryCheckpointer::new();
        let a = cp.save(&state(), 1, None).await.unwrap();
        let b = cp.save(&state(), 2, Some(a)).await.unwrap();

        let latest = cp.latest("s1").await.unwrap().unwrap();
        assert_eq!(latest.id, b);
        assert_eq!(latest.parent_id, Some(a));

        let list = cp.list("s1", 10).await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, b);
        assert_eq!(cp.list("s1", 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_id_is_a_checkpoint_error() {
        let cp = InMemoryCheckpointer::new();
        let err = cp.load(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind(), "checkpoint_failed");
    }

    #[tokio::test]
    async fn successive_checkpoints_always_add_messages() {
        // Property: for direct successor checkpoints, diff(a, b) adds >= 1.
        let cp = InMemoryCheckpointer::new();
        let mut s = state();
        let a = cp.save(&s, 1, None).await.unwrap();
        s.push(Message::assistant("reply"));
        let b = cp.save(&s, 2, Some(a)).await.unwrap();

        let d = cp.diff(a, b).await.unwrap();
        assert!(d.messages_added >= 1);
    }
}
