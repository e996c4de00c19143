//! Named shared/exclusive locks.
//!
//! The coordinator takes `storage-{key}` in [`LockMode::Shared`] for the lifetime of a read
//! session and in [`LockMode::Exclusive`] for write sessions and deletes. A lock is released by
//! dropping its [`LockGuard`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

pub fn storage_lock_name(key: &str) -> String {
    format!("storage-{key}")
}

/// Holds a lock until dropped.
pub struct LockGuard {
    _held: Box<dyn Send>,
}

impl LockGuard {
    pub fn new(held: impl Send + 'static) -> Self {
        Self {
            _held: Box::new(held),
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
pub trait LockService: Send + Sync {
    /// Wait until `name` can be held in `mode`, then hold it.
    async fn acquire(&self, name: &str, mode: LockMode) -> LockGuard;
}

#[derive(Debug, Default)]
struct Entry {
    lock: Arc<RwLock<()>>,
    holders: usize,
    waiters: usize,
}

impl Entry {
    fn unused(&self) -> bool {
        self.holders == 0 && self.waiters == 0
    }
}

/// Process-local lock service over `tokio::sync::RwLock`.
///
/// Waiters are served in FIFO order, so a queued exclusive request is not starved by a stream of
/// shared ones. An entry is pruned once nobody holds or waits for it, including a waiter whose
/// acquire was dropped before it got the lock.
#[derive(Debug, Clone, Default)]
pub struct MemLockService {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of guards currently held on `name`.
    pub fn holders(&self, name: &str) -> usize {
        self.lock().get(name).map_or(0, |e| e.holders)
    }

    /// Number of guards currently held across every name.
    pub fn total_holds(&self) -> usize {
        self.lock().values().map(|e| e.holders).sum()
    }

    /// Number of names with an entry (held or waited on).
    pub fn tracked_names(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, name: &str, f: impl FnOnce(&mut Entry)) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(name) {
            f(entry);
            if entry.unused() {
                entries.remove(name);
            }
        }
    }
}

/// Counts one waiter on `name` until dropped, whether or not the lock was granted.
struct Waiting<'a> {
    service: &'a MemLockService,
    name: &'a str,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.service
            .update(self.name, |e| e.waiters = e.waiters.saturating_sub(1));
    }
}

struct MemGuard {
    service: MemLockService,
    name: String,
    read: Option<OwnedRwLockReadGuard<()>>,
    write: Option<OwnedRwLockWriteGuard<()>>,
}

impl Drop for MemGuard {
    fn drop(&mut self) {
        // Let go of the lock itself before pruning.
        drop(self.read.take());
        drop(self.write.take());
        self.service
            .update(&self.name, |e| e.holders = e.holders.saturating_sub(1));
        tracing::trace!(name = %self.name, "lock released");
    }
}

#[async_trait::async_trait]
impl LockService for MemLockService {
    async fn acquire(&self, name: &str, mode: LockMode) -> LockGuard {
        let lock = {
            let mut entries = self.lock();
            let entry = entries.entry(name.to_string()).or_default();
            entry.waiters += 1;
            entry.lock.clone()
        };
        let waiting = Waiting {
            service: self,
            name,
        };
        let (read, write) = match mode {
            LockMode::Shared => (Some(lock.read_owned().await), None),
            LockMode::Exclusive => (None, Some(lock.write_owned().await)),
        };
        let guard = MemGuard {
            service: self.clone(),
            name: name.to_string(),
            read,
            write,
        };
        // Count the hold before the waiter goes away so the entry is never pruned in between.
        self.update(name, |e| e.holders += 1);
        drop(waiting);
        tracing::trace!(name, ?mode, "lock acquired");
        LockGuard::new(guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn shared_holders_coexist() {
        let locks = MemLockService::new();
        let a = locks.acquire("k", LockMode::Shared).await;
        let b = locks.acquire("k", LockMode::Shared).await;
        assert_eq!(locks.holders("k"), 2);
        drop(a);
        drop(b);
        assert_eq!(locks.holders("k"), 0);
        assert_eq!(locks.tracked_names(), 0);
    }

    #[tokio::test]
    async fn exclusive_waits_for_shared_holders() {
        let locks = MemLockService::new();
        let shared = locks.acquire("k", LockMode::Shared).await;

        let waiter = locks.clone();
        let pending = tokio::spawn(async move { waiter.acquire("k", LockMode::Exclusive).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());
        // The waiter keeps the entry alive.
        assert_eq!(locks.tracked_names(), 1);

        drop(shared);
        let exclusive = pending.await.unwrap();
        assert_eq!(locks.holders("k"), 1);

        // Different names never contend.
        let other = locks.acquire("other", LockMode::Exclusive).await;
        assert_eq!(locks.total_holds(), 2);
        drop(other);
        drop(exclusive);
        assert_eq!(locks.total_holds(), 0);
        assert_eq!(locks.tracked_names(), 0);
    }

    #[tokio::test]
    async fn dropped_waiter_does_not_leave_its_entry_behind() {
        let locks = MemLockService::new();
        let held = locks.acquire("k", LockMode::Exclusive).await;

        let mut waiter = locks.acquire("k", LockMode::Exclusive);
        let timed_out = tokio::time::timeout(Duration::from_millis(10), &mut waiter).await;
        assert!(timed_out.is_err());

        // Released while the waiter's acquire is still alive, then the waiter gives up.
        drop(held);
        assert_eq!(locks.holders("k"), 0);
        assert_eq!(locks.tracked_names(), 1);
        drop(waiter);
        assert_eq!(locks.tracked_names(), 0);

        let again = locks.acquire("k", LockMode::Shared).await;
        assert_eq!(locks.holders("k"), 1);
        drop(again);
        assert_eq!(locks.tracked_names(), 0);
    }

    #[test]
    fn lock_names_are_namespaced() {
        assert_eq!(storage_lock_name("a.bin"), "storage-a.bin");
    }
}
