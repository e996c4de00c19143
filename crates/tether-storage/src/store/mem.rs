use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{validate_key, BoxedReader, ByteStreamStore, StreamWriter};
use crate::error::StorageError;

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Vec<u8>>,
    quota: Option<u64>,
    /// Bytes accepted by live writers but not flushed yet.
    reserved: u64,
}

impl Inner {
    fn used(&self) -> u64 {
        self.entries.values().map(|v| v.len() as u64).sum()
    }
}

/// In-memory store with an optional total-size quota.
///
/// Writers buffer until flushed. The quota is checked on every write against stored bytes plus
/// the unflushed bytes of every live writer.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(bytes: u64) -> Self {
        let store = Self::default();
        store.lock().quota = Some(bytes);
        store
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().entries.get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.lock().entries.insert(key.into(), data.into());
    }

    pub fn used_bytes(&self) -> u64 {
        self.lock().used()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ByteStreamStore for MemStore {
    fn exists(&self, key: &str) -> Result<bool, StorageError> {
        validate_key(key)?;
        Ok(self.lock().entries.contains_key(key))
    }

    fn open_read(&self, key: &str) -> Result<BoxedReader, StorageError> {
        validate_key(key)?;
        let data = self.get(key).ok_or(StorageError::NotFound)?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn open_write(&self, key: &str) -> Result<Box<dyn StreamWriter>, StorageError> {
        validate_key(key)?;
        self.lock().entries.insert(key.to_string(), Vec::new());
        Ok(Box::new(MemWriter {
            store: self.clone(),
            key: key.to_string(),
            buffered: Vec::new(),
        }))
    }

    fn remove(&self, key: &str) -> Result<bool, StorageError> {
        validate_key(key)?;
        Ok(self.lock().entries.remove(key).is_some())
    }
}

struct MemWriter {
    store: MemStore,
    key: String,
    buffered: Vec<u8>,
}

impl StreamWriter for MemWriter {
    fn write(&mut self, data: &[u8]) -> Result<(), StorageError> {
        let mut inner = self.store.lock();
        if let Some(quota) = inner.quota {
            let wanted = inner.used() + inner.reserved + data.len() as u64;
            if wanted > quota {
                return Err(StorageError::QuotaExceeded);
            }
        }
        inner.reserved += data.len() as u64;
        drop(inner);
        self.buffered.extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        let mut inner = self.store.lock();
        inner.reserved = inner.reserved.saturating_sub(self.buffered.len() as u64);
        inner
            .entries
            .entry(self.key.clone())
            .or_default()
            .append(&mut self.buffered);
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<(), StorageError> {
        self.flush()
    }
}

impl Drop for MemWriter {
    fn drop(&mut self) {
        // Unflushed bytes of an abandoned writer are discarded.
        if !self.buffered.is_empty() {
            let mut inner = self.store.lock();
            inner.reserved = inner.reserved.saturating_sub(self.buffered.len() as u64);
        }
    }
}
