//! Coordinator-to-worker event stream: [`Frame`]s over a ring.
//!
//! The producer only bumps `pending` after whole frames have been copied, so every poll sees a
//! batch of complete frames. The consumer decodes exactly `pending` bytes and commits them in
//! one step; running off the end of the batch means the stream is corrupt.

use thiserror::Error;

use crate::frame::{decode_frame_at, DecodeError, Frame};
use crate::ring::{RingError, RingReader, RingSender};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventBusError {
    #[error("event stream protocol violation: {0}")]
    Protocol(#[from] DecodeError),

    #[error(transparent)]
    Ring(#[from] RingError),
}

/// Producer side. Cheap to clone; every clone feeds the same FIFO write queue.
#[derive(Debug, Clone)]
pub struct EventSender {
    ring: RingSender,
}

impl EventSender {
    pub fn new(ring: RingSender) -> Self {
        Self { ring }
    }

    /// Largest encoded frame this sender can ever deliver.
    pub fn max_frame_len(&self) -> usize {
        self.ring.capacity()
    }

    pub fn send(&self, frame: &Frame) -> Result<(), RingError> {
        self.ring.write(frame.encode())
    }
}

/// Consumer side, owned by the worker.
#[derive(Debug)]
pub struct EventBus {
    reader: RingReader,
}

impl EventBus {
    pub fn new(reader: RingReader) -> Self {
        Self { reader }
    }

    /// Block until frames arrive, dispatch every pending frame in order, then commit.
    ///
    /// Returns the number of frames dispatched.
    pub fn poll_dispatch<F>(&mut self, handler: F) -> Result<usize, EventBusError>
    where
        F: FnMut(Frame),
    {
        let pending = self.reader.poll();
        self.dispatch(pending, handler)
    }

    /// Like [`EventBus::poll_dispatch`] but returns `Ok(0)` instead of blocking.
    pub fn try_dispatch<F>(&mut self, handler: F) -> Result<usize, EventBusError>
    where
        F: FnMut(Frame),
    {
        match self.reader.try_poll() {
            0 => Ok(0),
            pending => self.dispatch(pending, handler),
        }
    }

    fn dispatch<F>(&mut self, pending: usize, mut handler: F) -> Result<usize, EventBusError>
    where
        F: FnMut(Frame),
    {
        let batch = self.reader.read(pending)?;
        let mut offset = 0;
        let mut count = 0;
        while offset < batch.len() {
            let (frame, used) = decode_frame_at(&batch, offset).inspect_err(|err| {
                tracing::error!(offset, pending, "undecodable event batch: {err}");
            })?;
            handler(frame);
            offset += used;
            count += 1;
        }
        self.reader.commit(pending)?;
        Ok(count)
    }
}
