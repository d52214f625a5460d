//! Per-session concurrency control.
//!
//! At most one engine run is active per session. A second request either
//! waits behind the in-flight run or fails fast, per the configured policy.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use rv_domain::config::BusyPolicy;

/// Manages per-session run locks. Each session id maps to a `Semaphore(1)`;
/// holding the permit means owning the session for one run.
#[derive(Default)]
pub struct SessionLockMap {
    locks: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl SessionLockMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn semaphore(&self, session_id: &str) -> Arc<Semaphore> {
        self.locks
            .lock()
            .entry(session_id.to_owned())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    /// Acquire the run lock for a session. With `Queue` the caller waits its
    /// turn; with `FailFast` a busy session returns [`SessionBusy`]
    /// immediately. The permit releases on drop.
    pub async fn acquire(
        &self,
        session_id: &str,
        policy: BusyPolicy,
    ) -> Result<OwnedSemaphorePermit, SessionBusy> {
        let sem = self.semaphore(session_id);
        match policy {
            BusyPolicy::FailFast => sem.try_acquire_owned().map_err(|_| SessionBusy),
            BusyPolicy::Queue => sem.acquire_owned().await.map_err(|_| SessionBusy),
        }
    }

    pub fn session_count(&self) -> usize {
        self.locks.lock().len()
    }

    /// Drop locks for sessions with no active holder.
    pub fn prune_idle(&self) {
        self.locks.lock().retain(|_, sem| sem.available_permits() == 0);
    }
}

/// A turn is already in progress for this session.
#[derive(Debug)]
pub struct SessionBusy;

impl std::fmt::Display for SessionBusy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session is busy: a run is already in progress")
    }
}

impl std::error::Error for SessionBusy {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequential_acquire_works() {
        let map = SessionLockMap::new();
        let p1 = map.acquire("s1", BusyPolicy::Queue).await.unwrap();
        drop(p1);
        let p2 = map.acquire("s1", BusyPolicy::Queue).await.unwrap();
        drop(p2);
    }

    #[tokio::test]
    async fn fail_fast_rejects_while_held() {
        let map = SessionLockMap::new();
        let _held = map.acquire("s1", BusyPolicy::FailFast).await.unwrap();
        assert!(map.acquire("s1", BusyPolicy::FailFast).await.is_err());
    }

    #[tokio::test]
    async fn queue_waits_for_release() {
        let map = Arc::new(SessionLockMap::new());
        let held = map.acquire("s1", BusyPolicy::Queue).await.unwrap();

        let map2 = map.clone();
        let waiter = tokio::spawn(async move {
            let _p = map2.acquire("s1", BusyPolicy::Queue).await.unwrap();
            7
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        drop(held);
        assert_eq!(waiter.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn different_sessions_are_independent() {
        let map = SessionLockMap::new();
        let _a = map.acquire("s1", BusyPolicy::FailFast).await.unwrap();
        let _b = map.acquire("s2", BusyPolicy::FailFast).await.unwrap();
        assert_eq!(map.session_count(), 2);
    }

    #[tokio::test]
    async fn prune_drops_idle_locks() {
        let map = SessionLockMap::new();
        {
            let _p = map.acquire("s1", BusyPolicy::Queue).await.unwrap();
        }
        map.prune_idle();
        assert_eq!(map.session_count(), 0);
    }
}
