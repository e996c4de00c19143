mod dir;
mod mem;

use std::io::Read;

pub use dir::DirStore;
pub use mem::MemStore;

use crate::error::StorageError;

pub const MAX_KEY_LEN: usize = 255;

/// Sequential writer returned by [`ByteStreamStore::open_write`].
pub trait StreamWriter: Send {
    /// Append `data`. On failure none of `data` is accepted.
    fn write(&mut self, data: &[u8]) -> Result<(), StorageError>;

    /// Make every accepted byte durable.
    fn flush(&mut self) -> Result<(), StorageError>;

    /// Flush and release the writer.
    fn close(self: Box<Self>) -> Result<(), StorageError>;
}

pub type BoxedReader = Box<dyn Read + Send>;

/// Keyed byte-stream storage the coordinator mediates access to.
///
/// Calls are synchronous and run on the coordinator thread. Concurrency control is the
/// coordinator's job (through its lock service), not the store's.
pub trait ByteStreamStore: Send + Sync {
    fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Open a sequential reader. `Err(NotFound)` if the key is absent.
    fn open_read(&self, key: &str) -> Result<BoxedReader, StorageError>;

    /// Open a writer over an emptied entry, creating it if absent.
    fn open_write(&self, key: &str) -> Result<Box<dyn StreamWriter>, StorageError>;

    /// Remove the entry. Returns whether it existed.
    fn remove(&self, key: &str) -> Result<bool, StorageError>;
}

/// Reject keys that cannot be used as a single path component.
pub(crate) fn validate_key(key: &str) -> Result<(), StorageError> {
    let bad = key.is_empty()
        || key.len() > MAX_KEY_LEN
        || key == "."
        || key == ".."
        || key.bytes().any(|b| matches!(b, b'/' | b'\\' | 0));
    if bad {
        return Err(StorageError::InvalidKey(truncate_for_error(key, MAX_KEY_LEN)));
    }
    Ok(())
}

fn truncate_for_error(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        return value.to_string();
    }
    let mut end = max_len;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &value[..end])
}
