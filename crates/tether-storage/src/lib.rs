//! Mediated, lock-protected file storage for worker threads.
//!
//! Workers never touch the backend. A [`StorageClient`] publishes requests in a small word
//! buffer; the [`StorageCoordinator`] thread serves them against a [`ByteStreamStore`], taking
//! `storage-{key}` locks from a [`LockService`] for the lifetime of each session.

pub mod client;
pub mod control;
pub mod coordinator;
pub mod error;
pub mod file_handle;
pub mod lock;
pub mod protocol;
mod registry;
mod session;
pub mod store;

pub use client::{Fd, ReadChunk, StorageClient};
pub use control::{ControlMessage, ControlSender, WorkerId};
pub use coordinator::{CoordinatorHandle, CoordinatorStats, StorageConfig, StorageCoordinator};
pub use error::{CoordinatorError, StorageError};
pub use lock::{LockGuard, LockMode, LockService, MemLockService};
pub use registry::SessionState;
pub use store::{ByteStreamStore, DirStore, MemStore, StreamWriter};
