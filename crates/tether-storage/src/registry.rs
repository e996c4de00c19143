use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::control::WorkerId;
use crate::file_handle::FileHandle;
use crate::lock::LockMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opening(LockMode),
    Open,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_final(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

#[derive(Debug)]
pub(crate) struct SessionEntry {
    pub owner: WorkerId,
    pub key: String,
    pub mode: LockMode,
    pub state: Rc<Cell<SessionState>>,
    pub slot: FileHandle,
}

/// Live sessions by fd. Fds start at 1 and are never handed out twice.
#[derive(Debug)]
pub(crate) struct SessionRegistry {
    next_fd: u32,
    sessions: HashMap<u32, SessionEntry>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self {
            next_fd: 1,
            sessions: HashMap::new(),
        }
    }
}

impl SessionRegistry {
    /// `None` once the fd space is used up.
    pub fn insert(&mut self, entry: SessionEntry) -> Option<u32> {
        let fd = self.next_fd;
        self.next_fd = fd.checked_add(1)?;
        self.sessions.insert(fd, entry);
        Some(fd)
    }

    /// The session `fd`, if it is live and owned by `worker`.
    pub fn lookup(&self, fd: u32, worker: WorkerId) -> Option<&SessionEntry> {
        self.sessions.get(&fd).filter(|s| s.owner == worker)
    }

    pub fn remove(&mut self, fd: u32) -> Option<SessionEntry> {
        self.sessions.remove(&fd)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(owner: WorkerId) -> SessionEntry {
        SessionEntry {
            owner,
            key: "k".to_string(),
            mode: LockMode::Shared,
            state: Rc::new(Cell::new(SessionState::Opening(LockMode::Shared))),
            slot: FileHandle::new(),
        }
    }

    #[test]
    fn fds_are_nonzero_and_never_reused() {
        let mut reg = SessionRegistry::default();
        let a = reg.insert(entry(1)).unwrap();
        let b = reg.insert(entry(1)).unwrap();
        assert_eq!((a, b), (1, 2));
        reg.remove(a);
        let c = reg.insert(entry(1)).unwrap();
        assert_eq!(c, 3);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn lookup_checks_owner() {
        let mut reg = SessionRegistry::default();
        let fd = reg.insert(entry(7)).unwrap();
        assert!(reg.lookup(fd, 7).is_some());
        assert!(reg.lookup(fd, 8).is_none());
        assert!(reg.lookup(fd + 1, 7).is_none());
    }
}
