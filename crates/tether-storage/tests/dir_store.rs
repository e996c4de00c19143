use std::sync::Arc;

use tether_ipc::SharedMemory;
use tether_storage::{
    DirStore, MemLockService, StorageClient, StorageConfig, StorageCoordinator, StorageError,
};

#[test]
fn coordinator_round_trips_through_a_directory() {
    let dir = tempfile::tempdir().unwrap();
    let store = DirStore::new(dir.path()).unwrap();
    let memory = SharedMemory::new(64 * 1024).unwrap();
    let handle = StorageCoordinator::spawn(
        StorageConfig::default(),
        Arc::new(store),
        Arc::new(MemLockService::new()),
        memory.clone(),
    )
    .unwrap();
    let mut c = StorageClient::connect(handle.control(), memory, 1, 4096).unwrap();

    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 253) as u8).collect();
    let fd = c.open_write("blob.bin").unwrap();
    c.write(fd, &payload).unwrap();
    c.close(fd).unwrap();
    assert_eq!(std::fs::read(dir.path().join("blob.bin")).unwrap(), payload);

    assert_eq!(c.read_to_end("blob.bin").unwrap(), Some(payload));

    assert_eq!(
        c.open_write("../escape"),
        Err(StorageError::InvalidKey("../escape".to_string()))
    );
    assert_eq!(
        c.delete("a/b"),
        Err(StorageError::InvalidKey("a/b".to_string()))
    );

    c.delete("blob.bin").unwrap();
    assert!(!dir.path().join("blob.bin").exists());
    assert_eq!(c.open_read("blob.bin").unwrap(), None);

    drop(c);
    handle.shutdown().unwrap();
}

#[test]
fn directory_quota_is_reported_as_quota_exceeded() {
    let dir = tempfile::tempdir().unwrap();
    let store = DirStore::with_quota(dir.path(), 16).unwrap();
    let memory = SharedMemory::new(4096).unwrap();
    let handle = StorageCoordinator::spawn(
        StorageConfig::default(),
        Arc::new(store),
        Arc::new(MemLockService::new()),
        memory.clone(),
    )
    .unwrap();
    let mut c = StorageClient::connect(handle.control(), memory, 1, 64).unwrap();

    let fd = c.open_write("k").unwrap();
    c.write(fd, &[1; 10]).unwrap();
    assert_eq!(c.write(fd, &[2; 10]), Err(StorageError::QuotaExceeded));
    assert_eq!(c.read_to_end("k").unwrap(), Some(vec![1; 10]));

    drop(c);
    handle.shutdown().unwrap();
}
