//! The storage coordinator: one thread, one current-thread runtime, many cooperative tasks.
//!
//! - the control loop handles connects, disconnects, stats and shutdown,
//! - each worker connection has a loop serving its top-level request buffer,
//! - each open fd has a session loop answering on its [`FileHandle`].
//!
//! All state lives in an `Rc` on the coordinator's `LocalSet` and is never touched from another
//! thread. Workers only ever see word buffers and shared memory.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::JoinHandle;

use tether_ipc::{MemoryError, Region, SharedMemory, WordBuffer};
use tokio::sync::{mpsc, oneshot};
use tokio::task::LocalSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::control::{ControlMessage, ControlSender, WorkerId};
use crate::error::{CoordinatorError, StorageError};
use crate::file_handle::{self, read_done, FileHandle, SlotRequest};
use crate::lock::{storage_lock_name, LockGuard, LockMode, LockService};
use crate::protocol::{op, status, word, Request, Response};
use crate::registry::{SessionEntry, SessionRegistry, SessionState};
use crate::session::{self, Session};
use crate::store::ByteStreamStore;

pub const DEFAULT_MAX_KEY_LEN: usize = 1024;

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub thread_name: String,
    /// Longer keys are refused with `INVALID_KEY` before they are read out of memory.
    pub max_key_len: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            thread_name: "tether-storage".to_string(),
            max_key_len: DEFAULT_MAX_KEY_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub connections: usize,
    pub open_sessions: usize,
    pub sessions_opened: u64,
    pub sessions_failed: u64,
}

pub struct StorageCoordinator;

impl StorageCoordinator {
    /// Start the coordinator thread. It runs until [`CoordinatorHandle::shutdown`], until the
    /// handle is dropped, or until a protocol violation stops it.
    pub fn spawn(
        config: StorageConfig,
        store: Arc<dyn ByteStreamStore>,
        locks: Arc<dyn LockService>,
        memory: SharedMemory,
    ) -> Result<CoordinatorHandle, CoordinatorError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let thread = std::thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || run(config, store, locks, memory, rx))
            .map_err(|err| CoordinatorError::Spawn(err.to_string()))?;
        Ok(CoordinatorHandle {
            control: ControlSender::new(tx),
            thread: Some(thread),
        })
    }
}

#[derive(Debug)]
pub struct CoordinatorHandle {
    control: ControlSender,
    thread: Option<JoinHandle<Result<(), CoordinatorError>>>,
}

impl CoordinatorHandle {
    pub fn control(&self) -> ControlSender {
        self.control.clone()
    }

    /// Blocks the calling thread. Must not be called from inside a tokio runtime.
    pub fn stats(&self) -> Result<CoordinatorStats, StorageError> {
        let (reply, rx) = oneshot::channel();
        self.control.send(ControlMessage::Inspect { reply })?;
        rx.blocking_recv().map_err(|_| StorageError::Disconnected)
    }

    /// Force-close every session, wait for all tasks and return the fatal error, if any.
    pub fn shutdown(mut self) -> Result<(), CoordinatorError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), CoordinatorError> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        // The engine may already be gone after a fault.
        let _ = self.control.send(ControlMessage::Shutdown);
        thread.join().map_err(|_| CoordinatorError::Panicked)?
    }
}

impl Drop for CoordinatorHandle {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::warn!("storage coordinator stopped with an error: {err}");
        }
    }
}

fn run(
    config: StorageConfig,
    store: Arc<dyn ByteStreamStore>,
    locks: Arc<dyn LockService>,
    memory: SharedMemory,
    rx: mpsc::UnboundedReceiver<ControlMessage>,
) -> Result<(), CoordinatorError> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| CoordinatorError::Spawn(err.to_string()))?;
    let engine = Rc::new(Engine {
        config,
        store,
        locks,
        memory,
        root: CancellationToken::new(),
        tracker: TaskTracker::new(),
        state: RefCell::new(State::default()),
    });
    LocalSet::new().block_on(&rt, engine.run(rx))
}

fn stamp(protocol: &WordBuffer, value: i32) {
    protocol.store(word::OP, value);
    protocol.notify();
}

struct Connection {
    protocol: WordBuffer,
    token: CancellationToken,
}

#[derive(Default)]
struct State {
    connections: HashMap<WorkerId, Connection>,
    sessions: SessionRegistry,
    sessions_opened: u64,
    sessions_failed: u64,
    fault: Option<CoordinatorError>,
}

struct Engine {
    config: StorageConfig,
    store: Arc<dyn ByteStreamStore>,
    locks: Arc<dyn LockService>,
    memory: SharedMemory,
    root: CancellationToken,
    tracker: TaskTracker,
    state: RefCell<State>,
}

impl Engine {
    async fn run(
        self: Rc<Self>,
        mut rx: mpsc::UnboundedReceiver<ControlMessage>,
    ) -> Result<(), CoordinatorError> {
        tracing::info!("storage coordinator started");
        loop {
            let msg = tokio::select! {
                biased;
                _ = self.root.cancelled() => break,
                msg = rx.recv() => msg,
            };
            match msg {
                None | Some(ControlMessage::Shutdown) => break,
                Some(ControlMessage::Connect { worker, protocol }) => {
                    self.connect(worker, protocol)
                }
                Some(ControlMessage::Disconnect { worker }) => self.disconnect(worker),
                Some(ControlMessage::Inspect { reply }) => {
                    let _ = reply.send(self.stats());
                }
            }
        }

        self.root.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        let fault = self.state.borrow_mut().fault.take();
        let final_word = if fault.is_some() {
            op::FAULT
        } else {
            op::DISCONNECTED
        };
        // Nobody will serve these any more; wake whoever is parked on them.
        rx.close();
        while let Ok(msg) = rx.try_recv() {
            match msg {
                ControlMessage::Connect { protocol, .. } => stamp(&protocol, final_word),
                ControlMessage::Inspect { reply } => {
                    let _ = reply.send(self.stats());
                }
                ControlMessage::Disconnect { .. } | ControlMessage::Shutdown => {}
            }
        }
        let connections: Vec<_> = self.state.borrow_mut().connections.drain().collect();
        for (_, conn) in connections {
            stamp(&conn.protocol, final_word);
        }

        match fault {
            Some(err) => {
                tracing::error!("storage coordinator stopped: {err}");
                Err(err)
            }
            None => {
                tracing::info!("storage coordinator stopped");
                Ok(())
            }
        }
    }

    fn stats(&self) -> CoordinatorStats {
        let state = self.state.borrow();
        CoordinatorStats {
            connections: state.connections.len(),
            open_sessions: state.sessions.len(),
            sessions_opened: state.sessions_opened,
            sessions_failed: state.sessions_failed,
        }
    }

    fn connect(self: &Rc<Self>, worker: WorkerId, protocol: WordBuffer) {
        let token = self.root.child_token();
        {
            let mut state = self.state.borrow_mut();
            if state.connections.contains_key(&worker) {
                drop(state);
                tracing::warn!(worker, "worker is already connected; refusing second connection");
                stamp(&protocol, op::DISCONNECTED);
                return;
            }
            state.connections.insert(
                worker,
                Connection {
                    protocol: protocol.clone(),
                    token: token.clone(),
                },
            );
        }
        tracing::info!(worker, "worker connected");
        self.tracker
            .spawn_local(self.clone().serve_connection(worker, protocol, token));
    }

    fn disconnect(&self, worker: WorkerId) {
        let Some(conn) = self.state.borrow_mut().connections.remove(&worker) else {
            tracing::debug!(worker, "disconnect for unknown worker");
            return;
        };
        // Cancels the connection loop and, through child tokens, every session it opened.
        conn.token.cancel();
        stamp(&conn.protocol, op::DISCONNECTED);
        tracing::info!(worker, "worker disconnected");
    }

    fn fault(&self, err: CoordinatorError) {
        tracing::error!("protocol violation: {err}");
        let mut state = self.state.borrow_mut();
        for conn in state.connections.values() {
            conn.token.cancel();
            stamp(&conn.protocol, op::FAULT);
        }
        state.fault.get_or_insert(err);
        drop(state);
        self.root.cancel();
    }

    async fn serve_connection(
        self: Rc<Self>,
        worker: WorkerId,
        protocol: WordBuffer,
        token: CancellationToken,
    ) {
        loop {
            let res = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                res = self.serve_request(worker, &protocol, &token) => res,
            };
            if let Err(err) = res {
                self.fault(err);
                break;
            }
        }
        tracing::debug!(worker, "connection loop finished");
    }

    async fn serve_request(
        self: &Rc<Self>,
        worker: WorkerId,
        protocol: &WordBuffer,
        conn: &CancellationToken,
    ) -> Result<(), CoordinatorError> {
        protocol.wait_async(word::OP, op::IDLE).await;
        if protocol.load(word::OP) < 0 {
            // Already stamped; only cancellation ends this.
            std::future::pending::<()>().await;
        }
        let request = Request::read_from(protocol)
            .map_err(|opcode| CoordinatorError::UnknownOpcode { worker, opcode })?;
        tracing::trace!(worker, ?request, "request");
        let response = self.handle(worker, request, conn).await?;
        response.write_to(protocol);
        protocol.store(word::OP, op::IDLE);
        protocol.notify();
        Ok(())
    }

    async fn handle(
        self: &Rc<Self>,
        worker: WorkerId,
        request: Request,
        conn: &CancellationToken,
    ) -> Result<Response, CoordinatorError> {
        match request {
            Request::OpenRead { key } => self.open_read(worker, key, conn).await,
            Request::OpenWrite { key } => self.open_write(worker, key, conn).await,
            Request::Delete { key } => self.delete(worker, key).await,
            Request::Read { fd, ptr, len } => {
                self.check_memory(worker, ptr, len)?;
                let Some(slot) = self.session_slot(fd, worker, Some(LockMode::Shared)) else {
                    return Ok(Response::new(0, read_done::BAD_HANDLE as u32));
                };
                let r = slot.call(SlotRequest::Data { ptr, len }).await;
                Ok(Response::new(r.len, r.status as u32))
            }
            Request::Write { fd, ptr, len } => {
                self.check_memory(worker, ptr, len)?;
                let Some(slot) = self.session_slot(fd, worker, Some(LockMode::Exclusive)) else {
                    return Ok(Response::status(status::BAD_HANDLE));
                };
                let r = slot.call(SlotRequest::Data { ptr, len }).await;
                Ok(Response::new(r.status as u32, r.len))
            }
            Request::Flush { fd } => {
                let Some(slot) = self.session_slot(fd, worker, None) else {
                    return Ok(Response::status(status::BAD_HANDLE));
                };
                Ok(Response::status(slot.call(SlotRequest::Flush).await.status))
            }
            Request::Close { fd } => {
                let Some(slot) = self.session_slot(fd, worker, None) else {
                    tracing::debug!(worker, fd, "close of unknown fd");
                    return Ok(Response::status(status::OK));
                };
                Ok(Response::status(slot.call(SlotRequest::Close).await.status))
            }
        }
    }

    async fn open_read(
        self: &Rc<Self>,
        worker: WorkerId,
        key: Region,
        conn: &CancellationToken,
    ) -> Result<Response, CoordinatorError> {
        let Some(key) = self.read_key(worker, key)? else {
            return Ok(Response::new(0, status::INVALID_KEY as u32));
        };
        let guard = self
            .locks
            .acquire(&storage_lock_name(&key), LockMode::Shared)
            .await;
        let opened = match self.store.exists(&key) {
            Ok(true) => self.store.open_read(&key),
            Ok(false) => Err(StorageError::NotFound),
            Err(err) => Err(err),
        };
        let reader = match opened {
            Ok(reader) => reader,
            Err(StorageError::NotFound) => {
                tracing::debug!(worker, key = %key, "open_read: not found");
                return Ok(Response::new(0, status::OK as u32));
            }
            Err(err) => return Ok(open_failure(worker, &key, &err)),
        };
        Ok(self.start_session(worker, key, LockMode::Shared, guard, conn, move |s| {
            session::serve_read(s, reader)
        }))
    }

    async fn open_write(
        self: &Rc<Self>,
        worker: WorkerId,
        key: Region,
        conn: &CancellationToken,
    ) -> Result<Response, CoordinatorError> {
        let Some(key) = self.read_key(worker, key)? else {
            return Ok(Response::new(0, status::INVALID_KEY as u32));
        };
        let guard = self
            .locks
            .acquire(&storage_lock_name(&key), LockMode::Exclusive)
            .await;
        let writer = match self.store.open_write(&key) {
            Ok(writer) => writer,
            Err(err) => return Ok(open_failure(worker, &key, &err)),
        };
        Ok(self.start_session(worker, key, LockMode::Exclusive, guard, conn, move |s| {
            session::serve_write(s, writer)
        }))
    }

    async fn delete(&self, worker: WorkerId, key: Region) -> Result<Response, CoordinatorError> {
        let Some(key) = self.read_key(worker, key)? else {
            return Ok(Response::status(status::INVALID_KEY));
        };
        let _guard = self
            .locks
            .acquire(&storage_lock_name(&key), LockMode::Exclusive)
            .await;
        match self.store.remove(&key) {
            Ok(existed) => {
                tracing::debug!(worker, key = %key, existed, "deleted");
                Ok(Response::status(status::OK))
            }
            Err(err) => {
                tracing::warn!(worker, key = %key, "delete failed: {err}");
                Ok(Response::status(error_status(&err)))
            }
        }
    }

    fn start_session<F, Fut>(
        self: &Rc<Self>,
        worker: WorkerId,
        key: String,
        mode: LockMode,
        guard: LockGuard,
        conn: &CancellationToken,
        serve: F,
    ) -> Response
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = SessionState> + 'static,
    {
        let slot = FileHandle::new();
        let token = conn.child_token();
        let state = Rc::new(Cell::new(SessionState::Opening(mode)));
        let fd = {
            let mut registry = self.state.borrow_mut();
            let fd = registry.sessions.insert(SessionEntry {
                owner: worker,
                key: key.clone(),
                mode,
                state: state.clone(),
                slot: slot.clone(),
            });
            let Some(fd) = fd else {
                drop(registry);
                tracing::error!(worker, "file descriptor space exhausted");
                return Response::new(0, status::IO_ERROR as u32);
            };
            registry.sessions_opened += 1;
            fd
        };
        tracing::info!(worker, fd, key = %key, ?mode, "session opened");

        let serving = serve(Session {
            fd,
            slot,
            memory: self.memory.clone(),
            token,
            state,
        });
        let engine = self.clone();
        self.tracker.spawn_local(async move {
            let end = serving.await;
            engine.finish_session(fd, end);
            drop(guard);
        });
        Response::new(fd, status::OK as u32)
    }

    fn finish_session(&self, fd: u32, end: SessionState) {
        let mut state = self.state.borrow_mut();
        let entry = state.sessions.remove(fd);
        if end == SessionState::Failed {
            state.sessions_failed += 1;
        }
        drop(state);
        if let Some(entry) = entry {
            tracing::info!(fd, worker = entry.owner, key = %entry.key, ?end, "session ended");
        }
    }

    /// The slot of live session `fd`, if `worker` owns it and (when given) it has `mode`.
    fn session_slot(
        &self,
        fd: u32,
        worker: WorkerId,
        mode: Option<LockMode>,
    ) -> Option<FileHandle> {
        let state = self.state.borrow();
        let entry = state.sessions.lookup(fd, worker)?;
        if mode.is_some_and(|m| m != entry.mode) || entry.state.get().is_final() {
            return None;
        }
        Some(entry.slot.clone())
    }

    fn check_memory(&self, worker: WorkerId, ptr: u32, len: u32) -> Result<(), CoordinatorError> {
        // These pointer values would read back as slot sentinels.
        let res = if matches!(ptr as i32, file_handle::CLOSE | file_handle::FLUSH) {
            Err(MemoryError::OutOfBounds {
                ptr: ptr as u64,
                len: len as u64,
                size: self.memory.len(),
            })
        } else {
            self.memory.check(ptr, len as usize)
        };
        res.map_err(|source| CoordinatorError::Memory { worker, source })
    }

    /// `Ok(None)` if the key is longer than allowed.
    fn read_key(
        &self,
        worker: WorkerId,
        key: Region,
    ) -> Result<Option<String>, CoordinatorError> {
        if key.len as usize > self.config.max_key_len {
            tracing::warn!(worker, len = key.len, "storage key too long");
            return Ok(None);
        }
        self.check_memory(worker, key.ptr, key.len)?;
        let bytes = self
            .memory
            .read_vec(key.ptr, key.len as usize)
            .map_err(|source| CoordinatorError::Memory { worker, source })?;
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|_| CoordinatorError::InvalidKeyUtf8 { worker })
    }
}

fn error_status(err: &StorageError) -> i32 {
    match err {
        StorageError::InvalidKey(_) => status::INVALID_KEY,
        other => session::write_status(other),
    }
}

fn open_failure(worker: WorkerId, key: &str, err: &StorageError) -> Response {
    tracing::warn!(worker, key, "open failed: {err}");
    Response::new(0, error_status(err) as u32)
}
