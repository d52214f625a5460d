//! Append-only message transcripts.
//!
//! The `MessageStore` capability lets hosts keep a durable record of every
//! message the engine appends. Store failures never block the loop; they
//! degrade durability, not progress.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;

use rv_domain::error::{Error, Result};
use rv_domain::message::Message;

/// The transcript capability.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(&self, session_id: &str, message: &Message) -> Result<()>;
    async fn history(&self, session_id: &str) -> Result<Vec<Message>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct InMemoryMessageStore {
    by_session: RwLock<HashMap<String, Vec<Message>>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn append(&self, session_id: &str, message: &Message) -> Result<()> {
        self.by_session
            .write()
            .entry(session_id.to_owned())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn history(&self, session_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .by_session
            .read()
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// JSONL store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One `<session_id>.jsonl` file per session under the base directory.
pub struct JsonlMessageStore {
    base_dir: PathBuf,
}

impl JsonlMessageStore {
    pub fn open(base_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(base_dir).map_err(Error::Io)?;
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
        })
    }

    fn path(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(format!("{session_id}.jsonl"))
    }
}

#[async_trait]
impl MessageStore for JsonlMessageStore {
    async fn append(&self, session_id: &str, message: &Message) -> Result<()> {
        let json = serde_json::to_string(message)?;
        let path = self.path(session_id);

        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(Error::Io)?;
        file.write_all(json.as_bytes()).map_err(Error::Io)?;
        file.write_all(b"\n").map_err(Error::Io)?;
        Ok(())
    }

    async fn history(&self, session_id: &str) -> Result<Vec<Message>> {
        let path = self.path(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
        let mut messages = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(line) {
                Ok(m) => messages.push(m),
                Err(e) => {
                    tracing::warn!(
                        session_id,
                        error = %e,
                        "skipping malformed transcript line"
                    );
                }
            }
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_round_trip() {
        let store = InMemoryMessageStore::new();
        store.append("s1", &Message::user("q")).await.unwrap();
        store.append("s1", &Message::assistant("a")).await.unwrap();

        let history = store.history("s1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(store.history("s2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn jsonl_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonlMessageStore::open(dir.path()).unwrap();
            store.append("s1", &Message::user("persisted")).await.unwrap();
        }
        let store = JsonlMessageStore::open(dir.path()).unwrap();
        let history = store.history("s1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].text(), "persisted");
    }
}
