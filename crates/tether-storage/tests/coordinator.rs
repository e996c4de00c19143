use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tether_ipc::{SharedMemory, WordBuffer};
use tether_storage::{
    CoordinatorError, CoordinatorHandle, Fd, MemLockService, MemStore, ReadChunk, StorageClient,
    StorageConfig, StorageCoordinator, StorageError, WorkerId,
};

struct Harness {
    handle: CoordinatorHandle,
    store: MemStore,
    locks: MemLockService,
    memory: SharedMemory,
}

fn start(store: MemStore) -> Harness {
    let memory = SharedMemory::new(1 << 20).unwrap();
    let locks = MemLockService::new();
    let handle = StorageCoordinator::spawn(
        StorageConfig::default(),
        Arc::new(store.clone()),
        Arc::new(locks.clone()),
        memory.clone(),
    )
    .unwrap();
    Harness {
        handle,
        store,
        locks,
        memory,
    }
}

impl Harness {
    fn client(&self, worker: WorkerId) -> StorageClient {
        StorageClient::connect(self.handle.control(), self.memory.clone(), worker, 256).unwrap()
    }
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn write_flush_close_then_read_back() {
    let h = start(MemStore::new());
    let mut c = h.client(1);

    let fd = c.open_write("a").unwrap();
    c.write(fd, &[1, 2, 3]).unwrap();
    c.flush(fd).unwrap();
    c.close(fd).unwrap();
    assert_eq!(h.store.get("a"), Some(vec![1, 2, 3]));

    let fd = c.open_read("a").unwrap().expect("key exists");
    let mut buf = [0u8; 3];
    assert_eq!(c.read(fd, &mut buf).unwrap(), ReadChunk { len: 3, done: false });
    assert_eq!(buf, [1, 2, 3]);
    assert_eq!(c.read(fd, &mut buf).unwrap(), ReadChunk { len: 0, done: true });
    c.close(fd).unwrap();

    assert_eq!(h.locks.total_holds(), 0);
    let stats = h.handle.stats().unwrap();
    assert_eq!(stats.connections, 1);
    assert_eq!(stats.open_sessions, 0);
    assert_eq!(stats.sessions_opened, 2);
    assert_eq!(stats.sessions_failed, 0);
}

#[test]
fn missing_key_opens_no_session_and_holds_no_lock() {
    let h = start(MemStore::new());
    let mut c = h.client(1);

    assert_eq!(c.open_read("missing").unwrap(), None);
    assert_eq!(c.read_to_end("missing").unwrap(), None);

    assert_eq!(h.locks.total_holds(), 0);
    assert_eq!(h.locks.tracked_names(), 0);
    let stats = h.handle.stats().unwrap();
    assert_eq!(stats.sessions_opened, 0);
    assert_eq!(stats.open_sessions, 0);
}

#[test]
fn readers_share_the_lock_and_a_writer_waits_for_all_of_them() {
    let h = start(MemStore::new());
    h.store.insert("shared", b"old".to_vec());
    let mut a = h.client(1);
    let mut b = h.client(2);

    let fa = a.open_read("shared").unwrap().unwrap();
    let fb = b.open_read("shared").unwrap().unwrap();
    assert_eq!(h.locks.holders("storage-shared"), 2);

    let opened = Arc::new(AtomicBool::new(false));
    let writer = {
        let control = h.handle.control();
        let memory = h.memory.clone();
        let opened = opened.clone();
        thread::spawn(move || {
            let mut w = StorageClient::connect(control, memory, 3, 64).unwrap();
            let fd = w.open_write("shared").unwrap();
            opened.store(true, Ordering::SeqCst);
            w.write(fd, b"new").unwrap();
            w.close(fd).unwrap();
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!opened.load(Ordering::SeqCst));

    // The waiting writer does not hold up requests from other workers.
    let mut buf = [0u8; 8];
    assert_eq!(a.read(fa, &mut buf).unwrap(), ReadChunk { len: 3, done: true });
    a.close(fa).unwrap();
    thread::sleep(Duration::from_millis(20));
    assert!(!opened.load(Ordering::SeqCst));

    b.close(fb).unwrap();
    writer.join().unwrap();
    assert!(opened.load(Ordering::SeqCst));
    assert_eq!(h.store.get("shared"), Some(b"new".to_vec()));
    assert_eq!(h.locks.total_holds(), 0);
}

#[test]
fn a_reader_waits_for_an_open_writer() {
    let h = start(MemStore::new());
    h.store.insert("k", b"old".to_vec());
    let mut w = h.client(1);
    let fd = w.open_write("k").unwrap();
    w.write(fd, b"new").unwrap();

    let opened = Arc::new(AtomicBool::new(false));
    let reader = {
        let control = h.handle.control();
        let memory = h.memory.clone();
        let opened = opened.clone();
        thread::spawn(move || {
            let mut r = StorageClient::connect(control, memory, 2, 64).unwrap();
            let fd = r.open_read("k").unwrap().unwrap();
            opened.store(true, Ordering::SeqCst);
            let mut buf = [0u8; 8];
            let chunk = r.read(fd, &mut buf).unwrap();
            r.close(fd).unwrap();
            buf[..chunk.len].to_vec()
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!opened.load(Ordering::SeqCst));
    assert_eq!(h.locks.holders("storage-k"), 1);

    w.close(fd).unwrap();
    assert_eq!(reader.join().unwrap(), b"new".to_vec());
    assert_eq!(h.locks.total_holds(), 0);
}

#[test]
fn delete_waits_behind_an_open_reader() {
    let h = start(MemStore::new());
    h.store.insert("k", b"data".to_vec());
    let mut r = h.client(1);
    let fd = r.open_read("k").unwrap().unwrap();

    let deleted = Arc::new(AtomicBool::new(false));
    let deleter = {
        let control = h.handle.control();
        let memory = h.memory.clone();
        let deleted = deleted.clone();
        thread::spawn(move || {
            let mut d = StorageClient::connect(control, memory, 2, 64).unwrap();
            d.delete("k").unwrap();
            deleted.store(true, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!deleted.load(Ordering::SeqCst));
    assert_eq!(h.store.get("k"), Some(b"data".to_vec()));

    let mut buf = [0u8; 8];
    assert_eq!(r.read(fd, &mut buf).unwrap(), ReadChunk { len: 4, done: true });
    r.close(fd).unwrap();
    deleter.join().unwrap();
    assert!(deleted.load(Ordering::SeqCst));
    assert_eq!(h.store.get("k"), None);
    assert_eq!(h.locks.total_holds(), 0);
}

#[test]
fn quota_failure_keeps_accepted_bytes_and_ends_the_session() {
    let h = start(MemStore::with_quota(8));
    let mut c = h.client(1);

    let fd = c.open_write("q").unwrap();
    c.write(fd, &[7; 5]).unwrap();
    assert_eq!(c.write(fd, &[8; 5]), Err(StorageError::QuotaExceeded));
    // Reported once; the session is gone afterwards.
    assert_eq!(c.write(fd, &[9]), Err(StorageError::BadHandle(fd.raw())));
    c.close(fd).unwrap();

    assert_eq!(c.read_to_end("q").unwrap(), Some(vec![7; 5]));
    let stats = h.handle.stats().unwrap();
    assert_eq!(stats.sessions_failed, 1);
    assert_eq!(stats.open_sessions, 0);
    assert_eq!(h.locks.total_holds(), 0);
}

#[test]
fn open_write_truncates_existing_content() {
    let h = start(MemStore::new());
    h.store.insert("t", b"a much longer old value".to_vec());
    let mut c = h.client(1);

    let fd = c.open_write("t").unwrap();
    c.write(fd, b"short").unwrap();
    c.close(fd).unwrap();
    assert_eq!(c.read_to_end("t").unwrap(), Some(b"short".to_vec()));
}

#[test]
fn delete_is_idempotent() {
    let h = start(MemStore::new());
    h.store.insert("d", vec![1]);
    let mut c = h.client(1);

    c.delete("d").unwrap();
    c.delete("d").unwrap();
    assert_eq!(h.store.get("d"), None);
    assert_eq!(c.open_read("d").unwrap(), None);
    assert_eq!(h.locks.total_holds(), 0);
}

#[test]
fn foreign_stale_and_wrong_mode_fds_are_bad_handles() {
    let h = start(MemStore::new());
    h.store.insert("k", b"data".to_vec());
    let mut a = h.client(1);
    let mut b = h.client(2);
    let mut buf = [0u8; 4];

    assert_eq!(
        a.read(Fd::from_raw(999), &mut buf),
        Err(StorageError::BadHandle(999))
    );

    let fd = a.open_read("k").unwrap().unwrap();
    assert_eq!(b.read(fd, &mut buf), Err(StorageError::BadHandle(fd.raw())));
    assert_eq!(a.write(fd, b"x"), Err(StorageError::BadHandle(fd.raw())));
    assert_eq!(b.flush(fd), Err(StorageError::BadHandle(fd.raw())));
    // Closing someone else's fd is a no-op, not a close.
    b.close(fd).unwrap();
    assert_eq!(a.read(fd, &mut buf).unwrap().len, 4);
    a.close(fd).unwrap();

    assert_eq!(a.read(fd, &mut buf), Err(StorageError::BadHandle(fd.raw())));
    a.close(fd).unwrap();

    let again = a.open_read("k").unwrap().unwrap();
    assert_ne!(again, fd);
    a.close(again).unwrap();
}

#[test]
fn disconnect_force_closes_sessions_and_persists_accepted_bytes() {
    let h = start(MemStore::new());
    let mut a = h.client(1);

    let fd = a.open_write("cut").unwrap();
    a.write(fd, b"abc").unwrap();
    h.handle.control().disconnect(1).unwrap();

    wait_until("lock release", || h.locks.total_holds() == 0);
    assert_eq!(h.store.get("cut"), Some(b"abc".to_vec()));
    assert_eq!(a.write(fd, b"more"), Err(StorageError::Disconnected));

    let stats = h.handle.stats().unwrap();
    assert_eq!(stats.connections, 0);
    assert_eq!(stats.open_sessions, 0);
    assert_eq!(stats.sessions_failed, 1);
}

#[test]
fn disconnect_wakes_a_worker_parked_on_a_lock() {
    let h = start(MemStore::new());
    let mut holder = h.client(1);
    let fd = holder.open_write("busy").unwrap();

    let connected = Arc::new(AtomicBool::new(false));
    let blocked = {
        let control = h.handle.control();
        let memory = h.memory.clone();
        let connected = connected.clone();
        thread::spawn(move || {
            let mut w = StorageClient::connect(control, memory, 2, 64).unwrap();
            connected.store(true, Ordering::SeqCst);
            w.open_write("busy")
        })
    };

    wait_until("second worker to connect", || connected.load(Ordering::SeqCst));
    thread::sleep(Duration::from_millis(50));
    h.handle.control().disconnect(2).unwrap();
    assert_eq!(blocked.join().unwrap(), Err(StorageError::Disconnected));

    // The holder is unaffected.
    holder.write(fd, b"still here").unwrap();
    holder.close(fd).unwrap();
    assert_eq!(h.store.get("busy"), Some(b"still here".to_vec()));
    assert_eq!(h.locks.total_holds(), 0);
}

#[test]
fn unknown_opcode_faults_the_coordinator() {
    let Harness { handle, .. } = {
        let h = start(MemStore::new());
        let mut bystander = h.client(1);

        let raw = WordBuffer::new(tether_storage::protocol::word::WORDS);
        h.handle.control().connect(99, raw.clone()).unwrap();
        raw.store(0, 0x42);
        raw.notify();
        raw.wait(0, 0x42);
        assert_eq!(raw.load(0), tether_storage::protocol::op::FAULT);

        assert_eq!(bystander.open_read("x"), Err(StorageError::Fault));
        h
    };
    assert_eq!(
        handle.shutdown(),
        Err(CoordinatorError::UnknownOpcode {
            worker: 99,
            opcode: 0x42
        })
    );
}

#[test]
fn out_of_range_pointer_faults_the_coordinator() {
    let Harness { handle, memory, .. } = start(MemStore::new());
    let mut c = StorageClient::connect(handle.control(), memory.clone(), 5, 64).unwrap();

    let fd = c.open_write("k").unwrap();
    assert_eq!(
        c.write_at(fd, memory.len() as u32 - 4, 100),
        Err(StorageError::Fault)
    );
    assert!(matches!(
        handle.shutdown(),
        Err(CoordinatorError::Memory { worker: 5, .. })
    ));
}

#[test]
fn shutdown_persists_open_writes_and_disconnects_workers() {
    let Harness {
        handle,
        store,
        locks,
        memory,
    } = start(MemStore::new());
    let mut c = StorageClient::connect(handle.control(), memory, 1, 64).unwrap();

    let fd = c.open_write("s").unwrap();
    c.write(fd, b"kept").unwrap();
    handle.shutdown().unwrap();

    assert_eq!(store.get("s"), Some(b"kept".to_vec()));
    assert_eq!(locks.total_holds(), 0);
    assert_eq!(c.write(fd, b"x"), Err(StorageError::Disconnected));
}

#[test]
fn workers_on_different_keys_run_side_by_side() {
    let h = start(MemStore::new());
    let workers: Vec<_> = (0..4u32)
        .map(|id| {
            let control = h.handle.control();
            let memory = h.memory.clone();
            thread::spawn(move || {
                let mut c = StorageClient::connect(control, memory, 10 + id, 128).unwrap();
                for round in 0..20u32 {
                    let key = format!("w{id}-r{round}");
                    // Larger than the scratch buffer, so it goes out in several requests.
                    let data: Vec<u8> = (0..300u32).map(|i| (i * 31 + id + round) as u8).collect();
                    let fd = c.open_write(&key).unwrap();
                    c.write(fd, &data).unwrap();
                    c.close(fd).unwrap();
                    assert_eq!(c.read_to_end(&key).unwrap(), Some(data));
                    c.delete(&key).unwrap();
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    assert!(h.store.is_empty());
    assert_eq!(h.locks.total_holds(), 0);
    let stats = h.handle.stats().unwrap();
    assert_eq!(stats.sessions_opened, 4 * 20 * 2);
    assert_eq!(stats.sessions_failed, 0);
}
