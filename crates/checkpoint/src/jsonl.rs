//! Durable checkpoint store — append-only JSONL, one file per session.
//!
//! Every save appends one JSON line to `<session_id>.jsonl` under the store
//! directory; an in-memory index over ids and sessions is rebuilt by
//! scanning the directory at open. Appends never rewrite history, so a
//! crashed process loses at most the line being written.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use rv_domain::error::{Error, Result};
use rv_domain::state::{AgentState, Checkpoint, CheckpointMeta};

use crate::Checkpointer;

pub struct JsonlCheckpointer {
    base_dir: PathBuf,
    inner: Mutex<Index>,
}

#[derive(Default)]
struct Index {
    by_id: HashMap<Uuid, Checkpoint>,
    by_session: HashMap<String, Vec<Uuid>>,
}

impl JsonlCheckpointer {
    /// Open (or create) a checkpoint directory and rebuild the index.
    pub fn open(base_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(base_dir).map_err(Error::Io)?;

        let mut index = Index::default();
        let mut sessions = 0usize;
        for entry in std::fs::read_dir(base_dir).map_err(Error::Io)? {
            let entry = entry.map_err(Error::Io)?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            sessions += 1;
            let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
            for line in raw.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Checkpoint>(line) {
                    Ok(cp) => {
                        index
                            .by_session
                            .entry(cp.session_id.clone())
                            .or_default()
                            .push(cp.id);
                        index.by_id.insert(cp.id, cp);
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "skipping malformed checkpoint line"
                        );
                    }
                }
            }
        }

        tracing::info!(
            checkpoints = index.by_id.len(),
            sessions,
            dir = %base_dir.display(),
            "checkpoint store loaded"
        );

        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            inner: Mutex::new(index),
        })
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(format!("{session_id}.jsonl"))
    }
}

#[async_trait]
impl Checkpointer for JsonlCheckpointer {
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
        let json = serde_json::to_string(&checkpoint)?;
        let path = self.session_path(&checkpoint.session_id);

        // The index lock doubles as the per-session write lock: appends for
        // one session are serialized through it.
        let mut inner = self.inner.lock();

        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(Error::Io)?;
        file.write_all(json.as_bytes()).map_err(Error::Io)?;
        file.write_all(b"\n").map_err(Error::Io)?;

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

    fn state(session: &str) -> AgentState {
        let mut s = AgentState::new(session, OwnerId::user("u1"));
        s.push(Message::user("hello"));
        s.cumulative_tokens = 12;
        s
    }

    #[tokio::test]
    async fn checkpoints_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let cp = JsonlCheckpointer::open(dir.path()).unwrap();
            cp.save(&state("s1"), 1, None).await.unwrap()
        };

        let reopened = JsonlCheckpointer::open(dir.path()).unwrap();
        let loaded = reopened.load(id).await.unwrap();
        assert_eq!(loaded.state.cumulative_tokens, 12);
        assert_eq!(loaded.state.messages[0].text(), "hello");
    }

    #[tokio::test]
    async fn sessions_get_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let cp = JsonlCheckpointer::open(dir.path()).unwrap();
        cp.save(&state("s1"), 1, None).await.unwrap();
        cp.save(&state("s2"), 1, None).await.unwrap();

        assert!(dir.path().join("s1.jsonl").exists());
        assert!(dir.path().join("s2.jsonl").exists());
        assert_eq!(cp.list("s1", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cp = JsonlCheckpointer::open(dir.path()).unwrap();
            cp.save(&state("s1"), 1, None).await.unwrap();
        }
        // Corrupt the tail of the file (simulated crash mid-write).
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("s1.jsonl"))
            .unwrap();
        writeln!(f, "{{\"partial\":").unwrap();

        let reopened = JsonlCheckpointer::open(dir.path()).unwrap();
        assert_eq!(reopened.list("s1", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn parent_links_survive_serialization() {
        let dir = tempfile::tempdir().unwrap();
        let cp = JsonlCheckpointer::open(dir.path()).unwrap();
        let a = cp.save(&state("s1"), 1, None).await.unwrap();
        let b = cp.save(&state("s1"), 2, Some(a)).await.unwrap();

        let loaded = cp.load(b).await.unwrap();
        assert_eq!(loaded.parent_id, Some(a));
    }
}
