//! Session service loops. One task per open fd, answering requests on its [`FileHandle`].
//!
//! Cancellation always wins over a request that arrived at the same time. A cancelled write
//! session still persists what it accepted, so a disconnect behaves like an abrupt close.

use std::cell::Cell;
use std::io::{self, Read};
use std::rc::Rc;

use tether_ipc::SharedMemory;
use tokio_util::sync::CancellationToken;

use crate::error::StorageError;
use crate::file_handle::{read_done, FileHandle, SlotRequest};
use crate::protocol::status;
use crate::registry::SessionState;
use crate::store::{BoxedReader, StreamWriter};

pub(crate) struct Session {
    pub fd: u32,
    pub slot: FileHandle,
    pub memory: SharedMemory,
    pub token: CancellationToken,
    pub state: Rc<Cell<SessionState>>,
}

impl Session {
    async fn next(&self) -> Option<SlotRequest> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            req = self.slot.next_request() => Some(req),
        }
    }

    fn end(&self, state: SessionState) -> SessionState {
        self.state.set(state);
        state
    }
}

pub(crate) fn write_status(err: &StorageError) -> i32 {
    match err {
        StorageError::QuotaExceeded => status::QUOTA_EXCEEDED,
        _ => status::IO_ERROR,
    }
}

pub(crate) async fn serve_read(session: Session, mut reader: BoxedReader) -> SessionState {
    session.state.set(SessionState::Open);
    loop {
        let Some(req) = session.next().await else {
            tracing::debug!(fd = session.fd, "read session force-closed");
            return session.end(SessionState::Failed);
        };
        match req {
            SlotRequest::Close => {
                session.state.set(SessionState::Closing);
                session.slot.respond(status::OK, 0);
                return session.end(SessionState::Closed);
            }
            // Nothing to make durable.
            SlotRequest::Flush => session.slot.respond(status::OK, 0),
            SlotRequest::Data { ptr, len } => {
                match fill(&mut reader, &session.memory, ptr, len as usize) {
                    Ok((n, eof)) => {
                        let done = if eof {
                            read_done::END_OF_STREAM
                        } else {
                            read_done::MORE
                        };
                        session.slot.respond(done, n as u32);
                    }
                    Err(err) => {
                        tracing::warn!(fd = session.fd, len, "read session failed: {err}");
                        session.slot.respond(read_done::IO_ERROR, 0);
                        return session.end(SessionState::Failed);
                    }
                }
            }
        }
    }
}

/// Read until `len` bytes or end of stream, then copy them to `ptr`.
fn fill(
    reader: &mut BoxedReader,
    memory: &SharedMemory,
    ptr: u32,
    len: usize,
) -> Result<(usize, bool), StorageError> {
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    let mut eof = false;
    while filled < len {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                eof = true;
                break;
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    memory.write(ptr, &buf[..filled])?;
    Ok((filled, eof))
}

pub(crate) async fn serve_write(
    session: Session,
    mut writer: Box<dyn StreamWriter>,
) -> SessionState {
    session.state.set(SessionState::Open);
    loop {
        let Some(req) = session.next().await else {
            tracing::debug!(fd = session.fd, "write session force-closed");
            persist(session.fd, writer);
            return session.end(SessionState::Failed);
        };
        match req {
            SlotRequest::Close => {
                session.state.set(SessionState::Closing);
                return match writer.close() {
                    Ok(()) => {
                        session.slot.respond(status::OK, 0);
                        session.end(SessionState::Closed)
                    }
                    Err(err) => {
                        tracing::warn!(fd = session.fd, "close failed: {err}");
                        session.slot.respond(write_status(&err), 0);
                        session.end(SessionState::Failed)
                    }
                };
            }
            SlotRequest::Flush => match writer.flush() {
                Ok(()) => session.slot.respond(status::OK, 0),
                Err(err) => {
                    tracing::warn!(fd = session.fd, "flush failed: {err}");
                    session.slot.respond(write_status(&err), 0);
                    persist(session.fd, writer);
                    return session.end(SessionState::Failed);
                }
            },
            SlotRequest::Data { ptr, len } => {
                let res = session
                    .memory
                    .read_vec(ptr, len as usize)
                    .map_err(StorageError::from)
                    .and_then(|data| writer.write(&data));
                match res {
                    Ok(()) => session.slot.respond(status::OK, len),
                    Err(err) => {
                        if err == StorageError::QuotaExceeded {
                            tracing::info!(fd = session.fd, len, "write refused: quota exceeded");
                        } else {
                            tracing::warn!(fd = session.fd, len, "write failed: {err}");
                        }
                        session.slot.respond(write_status(&err), 0);
                        persist(session.fd, writer);
                        return session.end(SessionState::Failed);
                    }
                }
            }
        }
    }
}

/// Keep whatever the writer accepted before the session ended early.
fn persist(fd: u32, writer: Box<dyn StreamWriter>) {
    if let Err(err) = writer.close() {
        tracing::warn!(fd, "failed to persist accepted bytes: {err}");
    }
}
