//! Per-run cancellation tokens.
//!
//! Each run registers a `CancelToken` under its run id. Cancellation is
//! cooperative: the loop observes it at the next suspension point, runs
//! best-effort consolidation, and emits `cancelled`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

/// A cancellation token checked by the runtime loop.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Tracks active cancellation tokens per run id.
#[derive(Default)]
pub struct CancelMap {
    tokens: Mutex<HashMap<Uuid, CancelToken>>,
}

impl CancelMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, run_id: Uuid) -> CancelToken {
        let token = CancelToken::new();
        self.tokens.lock().insert(run_id, token.clone());
        token
    }

    /// Request cancellation. Returns true if the run was active.
    pub fn cancel(&self, run_id: &Uuid) -> bool {
        match self.tokens.lock().get(run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, run_id: &Uuid) {
        self.tokens.lock().remove(run_id);
    }

    pub fn is_running(&self, run_id: &Uuid) -> bool {
        self.tokens.lock().contains_key(run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_lifecycle() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn map_register_cancel_remove() {
        let map = CancelMap::new();
        let id = Uuid::new_v4();
        let token = map.register(id);

        assert!(map.is_running(&id));
        assert!(map.cancel(&id));
        assert!(token.is_cancelled());

        map.remove(&id);
        assert!(!map.is_running(&id));
        assert!(!map.cancel(&id));
    }
}
