use std::io;

use tether_ipc::MemoryError;
use thiserror::Error;

use crate::control::WorkerId;

/// Errors surfaced to storage callers and returned by store backends.
///
/// [`StorageError::Io`] carries a message rather than `std::io::Error` so backends that are not
/// file-based can report failures too, and so the type stays `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("key not found")]
    NotFound,

    #[error("storage quota exceeded")]
    QuotaExceeded,

    #[error("invalid storage key: {0:?}")]
    InvalidKey(String),

    #[error("bad file handle {0}")]
    BadHandle(u32),

    #[error("io error: {0}")]
    Io(String),

    #[error("worker is disconnected from the storage coordinator")]
    Disconnected,

    #[error("storage coordinator stopped after a protocol violation")]
    Fault,

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound,
            io::ErrorKind::StorageFull | io::ErrorKind::FileTooLarge => {
                StorageError::QuotaExceeded
            }
            _ => StorageError::Io(err.to_string()),
        }
    }
}

/// Fatal coordinator failures. Any of these stops the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinatorError {
    #[error("worker {worker}: unknown request opcode {opcode}")]
    UnknownOpcode { worker: WorkerId, opcode: i32 },

    #[error("worker {worker}: storage key is not valid UTF-8")]
    InvalidKeyUtf8 { worker: WorkerId },

    #[error("worker {worker}: {source}")]
    Memory {
        worker: WorkerId,
        #[source]
        source: MemoryError,
    },

    #[error("failed to start coordinator: {0}")]
    Spawn(String),

    #[error("coordinator thread panicked")]
    Panicked,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_structured_variants() {
        let not_found = io::Error::from(io::ErrorKind::NotFound);
        assert_eq!(StorageError::from(not_found), StorageError::NotFound);

        let full = io::Error::from(io::ErrorKind::StorageFull);
        assert_eq!(StorageError::from(full), StorageError::QuotaExceeded);

        let other = io::Error::new(io::ErrorKind::Other, "disk on fire");
        assert_eq!(
            StorageError::from(other),
            StorageError::Io("disk on fire".to_string())
        );
    }
}
