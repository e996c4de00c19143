//! Worker-side storage calls.
//!
//! Every call publishes one request in the worker's protocol buffer and parks the calling thread
//! until the coordinator answers. Data is staged through a scratch region the client carves out
//! of shared memory at connect time; [`StorageClient::read_at`] and
//! [`StorageClient::write_at`] skip the staging copy for callers that already address the
//! shared memory directly.

use tether_ipc::{Region, SharedMemory, WordBuffer};

use crate::control::{ControlSender, WorkerId};
use crate::error::StorageError;
use crate::file_handle::read_done;
use crate::protocol::{op, status, word, Request, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fd(u32);

impl Fd {
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadChunk {
    pub len: usize,
    /// The stream ended during this read.
    pub done: bool,
}

#[derive(Debug)]
pub struct StorageClient {
    worker: WorkerId,
    control: ControlSender,
    memory: SharedMemory,
    protocol: WordBuffer,
    scratch: Region,
}

impl StorageClient {
    /// Register a connection for `worker` with a `scratch_len`-byte staging buffer.
    pub fn connect(
        control: ControlSender,
        memory: SharedMemory,
        worker: WorkerId,
        scratch_len: usize,
    ) -> Result<Self, StorageError> {
        let scratch = memory.alloc(scratch_len.max(1), tether_ipc::layout::REGION_ALIGN)?;
        let protocol = WordBuffer::new(word::WORDS);
        control.connect(worker, protocol.clone())?;
        tracing::debug!(worker, scratch_len, "storage client connected");
        Ok(Self {
            worker,
            control,
            memory,
            protocol,
            scratch,
        })
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn memory(&self) -> &SharedMemory {
        &self.memory
    }

    pub fn scratch_len(&self) -> usize {
        self.scratch.len as usize
    }

    /// `Ok(None)` if `key` does not exist.
    pub fn open_read(&mut self, key: &str) -> Result<Option<Fd>, StorageError> {
        let key_region = self.stage_key(key)?;
        let resp = self.call(Request::OpenRead { key: key_region })?;
        open_result(key, resp)
    }

    /// Open `key` for writing, creating it or discarding its current content.
    pub fn open_write(&mut self, key: &str) -> Result<Fd, StorageError> {
        let key_region = self.stage_key(key)?;
        let resp = self.call(Request::OpenWrite { key: key_region })?;
        open_result(key, resp)?.ok_or_else(|| StorageError::Io("open_write returned no fd".into()))
    }

    /// Read up to `buf.len()` bytes (capped at the scratch size).
    pub fn read(&mut self, fd: Fd, buf: &mut [u8]) -> Result<ReadChunk, StorageError> {
        let len = buf.len().min(self.scratch_len());
        let chunk = self.read_at(fd, self.scratch.ptr, len as u32)?;
        self.memory.read(self.scratch.ptr, &mut buf[..chunk.len])?;
        Ok(chunk)
    }

    /// Read up to `len` bytes straight into shared memory at `ptr`.
    pub fn read_at(&mut self, fd: Fd, ptr: u32, len: u32) -> Result<ReadChunk, StorageError> {
        let resp = self.call(Request::Read {
            fd: fd.raw(),
            ptr,
            len,
        })?;
        match resp.secondary as i32 {
            read_done::MORE | read_done::END_OF_STREAM => Ok(ReadChunk {
                len: resp.primary as usize,
                done: resp.secondary as i32 == read_done::END_OF_STREAM,
            }),
            read_done::BAD_HANDLE => Err(StorageError::BadHandle(fd.raw())),
            _ => Err(StorageError::Io(format!("read on fd {} failed", fd.raw()))),
        }
    }

    /// Append all of `data`, staged through scratch in chunks.
    pub fn write(&mut self, fd: Fd, data: &[u8]) -> Result<(), StorageError> {
        for chunk in data.chunks(self.scratch_len()) {
            self.memory.write(self.scratch.ptr, chunk)?;
            self.write_at(fd, self.scratch.ptr, chunk.len() as u32)?;
        }
        Ok(())
    }

    /// Append `len` bytes taken straight from shared memory at `ptr`.
    pub fn write_at(&mut self, fd: Fd, ptr: u32, len: u32) -> Result<(), StorageError> {
        let resp = self.call(Request::Write {
            fd: fd.raw(),
            ptr,
            len,
        })?;
        check_status(fd, resp.primary)
    }

    pub fn flush(&mut self, fd: Fd) -> Result<(), StorageError> {
        let resp = self.call(Request::Flush { fd: fd.raw() })?;
        check_status(fd, resp.primary)
    }

    /// Persist and release the session. Closing an fd that is already gone is a no-op.
    pub fn close(&mut self, fd: Fd) -> Result<(), StorageError> {
        let resp = self.call(Request::Close { fd: fd.raw() })?;
        check_status(fd, resp.primary)
    }

    /// Remove `key`. Removing an absent key succeeds.
    pub fn delete(&mut self, key: &str) -> Result<(), StorageError> {
        let key_region = self.stage_key(key)?;
        let resp = self.call(Request::Delete { key: key_region })?;
        match resp.primary as i32 {
            status::OK => Ok(()),
            status::INVALID_KEY => Err(StorageError::InvalidKey(key.to_string())),
            other => Err(status_error(other, format!("delete of {key:?} failed"))),
        }
    }

    /// Whole-key read. `Ok(None)` if `key` does not exist.
    pub fn read_to_end(&mut self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let Some(fd) = self.open_read(key)? else {
            return Ok(None);
        };
        let mut out = Vec::new();
        let mut buf = vec![0u8; self.scratch_len()];
        loop {
            let chunk = self.read(fd, &mut buf)?;
            out.extend_from_slice(&buf[..chunk.len]);
            if chunk.done {
                break;
            }
        }
        self.close(fd)?;
        Ok(Some(out))
    }

    fn stage_key(&self, key: &str) -> Result<Region, StorageError> {
        if key.len() > self.scratch_len() {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        self.memory.write(self.scratch.ptr, key.as_bytes())?;
        Ok(Region::new(self.scratch.ptr, key.len() as u32))
    }

    fn call(&mut self, request: Request) -> Result<Response, StorageError> {
        let opcode = request.opcode();
        request.write_args(&self.protocol);
        if let Err(current) = self.protocol.compare_exchange(word::OP, op::IDLE, opcode) {
            return Err(terminal_error(current));
        }
        self.protocol.notify();
        self.protocol.wait(word::OP, opcode);
        match self.protocol.load(word::OP) {
            op::IDLE => Ok(Response::read_from(&self.protocol)),
            other => Err(terminal_error(other)),
        }
    }
}

impl Drop for StorageClient {
    fn drop(&mut self) {
        // The coordinator may already be gone.
        let _ = self.control.disconnect(self.worker);
    }
}

fn terminal_error(op_word: i32) -> StorageError {
    match op_word {
        op::FAULT => StorageError::Fault,
        op::DISCONNECTED => StorageError::Disconnected,
        other => StorageError::Io(format!("request buffer holds unexpected opcode {other}")),
    }
}

fn open_result(key: &str, resp: Response) -> Result<Option<Fd>, StorageError> {
    match resp.secondary as i32 {
        status::OK => Ok((resp.primary != 0).then_some(Fd(resp.primary))),
        status::INVALID_KEY => Err(StorageError::InvalidKey(key.to_string())),
        other => Err(status_error(other, format!("open of {key:?} failed"))),
    }
}

fn check_status(fd: Fd, primary: u32) -> Result<(), StorageError> {
    match primary as i32 {
        status::OK => Ok(()),
        status::BAD_HANDLE => Err(StorageError::BadHandle(fd.raw())),
        other => Err(status_error(other, format!("request on fd {} failed", fd.raw()))),
    }
}

fn status_error(code: i32, context: String) -> StorageError {
    match code {
        status::QUOTA_EXCEEDED => StorageError::QuotaExceeded,
        _ => StorageError::Io(context),
    }
}
