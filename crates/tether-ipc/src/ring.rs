//! Byte ring buffer with an atomic backpressure counter.
//!
//! Design:
//! - The data region is `capacity` raw bytes inside a [`SharedMemory`]. Frames are copied in
//!   verbatim with no per-record header or padding; the frame protocol on top is
//!   self-describing (see [`crate::frame`]).
//! - A single shared word, `pending`, counts bytes written but not yet committed. It is the
//!   only synchronization between producer and consumer.
//! - Producer and consumer each keep a private cursor. A copy that would cross the physical
//!   end of the region is split into `[cursor, capacity)` and `[0, rest)`.
//! - The producer waits until `capacity - pending >= frame_len` before copying, keyed on the
//!   observed value of `pending`. A frame longer than `capacity` can never fit and is rejected
//!   with [`RingError::FrameTooLarge`].
//! - Writes submitted through a [`RingSender`] are queued FIFO and drained by one task, so
//!   frames are delivered in submission order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::layout::{ring_ctrl, Region, MAX_RING_CAPACITY, REGION_ALIGN};
use crate::memory::{MemoryError, SharedMemory};
use crate::words::WordBuffer;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RingError {
    #[error("frame of {len} bytes can never fit in a ring of {capacity} bytes")]
    FrameTooLarge { len: usize, capacity: usize },

    #[error("invalid ring capacity {0}")]
    InvalidCapacity(usize),

    #[error("consumer touched {requested} bytes but only {pending} are pending")]
    PastPending { requested: usize, pending: usize },

    #[error("ring writer is closed")]
    Closed,

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// The shared half of a ring: data region plus control words.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    memory: SharedMemory,
    region: Region,
    ctrl: WordBuffer,
}

impl RingBuffer {
    /// A ring backed by its own freshly allocated memory.
    pub fn new(capacity: usize) -> Result<Self, RingError> {
        if capacity == 0 || capacity > MAX_RING_CAPACITY || capacity > u32::MAX as usize {
            return Err(RingError::InvalidCapacity(capacity));
        }
        let memory = SharedMemory::new(capacity)?;
        let region = memory.alloc(capacity, REGION_ALIGN)?;
        Self::in_memory(memory, region)
    }

    /// A ring whose data lives at `region` inside an existing memory (e.g. a worker's module
    /// memory, with the consumer reading from the same bytes).
    pub fn in_memory(memory: SharedMemory, region: Region) -> Result<Self, RingError> {
        let capacity = region.len as usize;
        if capacity == 0 || capacity > MAX_RING_CAPACITY {
            return Err(RingError::InvalidCapacity(capacity));
        }
        memory.check(region.ptr, capacity)?;
        Ok(Self {
            memory,
            region,
            ctrl: WordBuffer::new(ring_ctrl::WORDS),
        })
    }

    pub fn capacity(&self) -> usize {
        self.region.len as usize
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn pending(&self) -> usize {
        self.ctrl.load(ring_ctrl::PENDING).max(0) as usize
    }

    /// Split into the producer and consumer halves. Both start at offset 0.
    pub fn split(self) -> (RingWriter, RingReader) {
        let writer = RingWriter {
            ring: self.clone(),
            cursor: 0,
        };
        let reader = RingReader {
            ring: self,
            cursor: 0,
        };
        (writer, reader)
    }

    fn check_frame_len(&self, len: usize) -> Result<(), RingError> {
        if len > self.capacity() {
            return Err(RingError::FrameTooLarge {
                len,
                capacity: self.capacity(),
            });
        }
        Ok(())
    }

    fn has_room(&self, observed_pending: i32, len: usize) -> bool {
        self.capacity() - (observed_pending.max(0) as usize).min(self.capacity()) >= len
    }

    fn copy_in(&self, cursor: usize, bytes: &[u8]) -> Result<(), MemoryError> {
        let first = bytes.len().min(self.capacity() - cursor);
        self.memory
            .write(self.region.ptr + cursor as u32, &bytes[..first])?;
        if first < bytes.len() {
            self.memory.write(self.region.ptr, &bytes[first..])?;
        }
        Ok(())
    }

    fn copy_out(&self, cursor: usize, out: &mut [u8]) -> Result<(), MemoryError> {
        let first = out.len().min(self.capacity() - cursor);
        let (head, tail) = out.split_at_mut(first);
        self.memory.read(self.region.ptr + cursor as u32, head)?;
        if !tail.is_empty() {
            self.memory.read(self.region.ptr, tail)?;
        }
        Ok(())
    }
}

/// Producer half. Owns the private write cursor.
#[derive(Debug)]
pub struct RingWriter {
    ring: RingBuffer,
    cursor: usize,
}

impl RingWriter {
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Copy one frame in, waiting asynchronously for the consumer to free enough room.
    pub async fn write(&mut self, frame: &[u8]) -> Result<(), RingError> {
        self.ring.check_frame_len(frame.len())?;
        loop {
            let pending = self.ring.ctrl.load(ring_ctrl::PENDING);
            if self.ring.has_room(pending, frame.len()) {
                break;
            }
            tracing::trace!(pending, len = frame.len(), "ring full; waiting for commit");
            self.ring.ctrl.wait_async(ring_ctrl::PENDING, pending).await;
        }
        self.publish(frame)
    }

    /// Same as [`RingWriter::write`] but parks the calling thread instead.
    pub fn write_blocking(&mut self, frame: &[u8]) -> Result<(), RingError> {
        self.ring.check_frame_len(frame.len())?;
        loop {
            let pending = self.ring.ctrl.load(ring_ctrl::PENDING);
            if self.ring.has_room(pending, frame.len()) {
                break;
            }
            self.ring.ctrl.wait(ring_ctrl::PENDING, pending);
        }
        self.publish(frame)
    }

    fn publish(&mut self, frame: &[u8]) -> Result<(), RingError> {
        self.ring.copy_in(self.cursor, frame)?;
        self.cursor = (self.cursor + frame.len()) % self.ring.capacity();
        self.ring.ctrl.add(ring_ctrl::PENDING, frame.len() as i32);
        self.ring.ctrl.notify();
        Ok(())
    }

    /// Move the writer into a draining task fed by a FIFO queue.
    ///
    /// The task exits cleanly once every [`RingSender`] is dropped, or with the first error.
    /// Must be called from within a tokio runtime.
    pub fn spawn(self) -> (RingSender, JoinHandle<Result<(), RingError>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = RingSender {
            tx,
            capacity: self.capacity(),
            failed: Arc::new(AtomicBool::new(false)),
        };
        let handle = tokio::spawn(self.drain(rx));
        (sender, handle)
    }

    async fn drain(mut self, mut rx: mpsc::UnboundedReceiver<Queued>) -> Result<(), RingError> {
        while let Some(queued) = rx.recv().await {
            let res = match queued {
                Queued::Frame(frame) => self.write(&frame).await.map_err(|err| (frame.len(), err)),
                Queued::Oversized(len) => Err((
                    len,
                    RingError::FrameTooLarge {
                        len,
                        capacity: self.capacity(),
                    },
                )),
            };
            if let Err((len, err)) = res {
                tracing::error!(len, "ring draining loop stopped: {err}");
                return Err(err);
            }
        }
        tracing::debug!("ring senders dropped; draining loop finished");
        Ok(())
    }
}

#[derive(Debug)]
enum Queued {
    Frame(Vec<u8>),
    /// Stops the draining loop after everything queued before it.
    Oversized(usize),
}

/// Cloneable handle onto a ring's FIFO write queue.
///
/// An oversized frame is fatal for every clone: it is reported once as
/// [`RingError::FrameTooLarge`], the draining loop ends with the same error after copying the
/// frames queued ahead of it, and all later writes fail with [`RingError::Closed`].
#[derive(Debug, Clone)]
pub struct RingSender {
    tx: mpsc::UnboundedSender<Queued>,
    capacity: usize,
    failed: Arc<AtomicBool>,
}

impl RingSender {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue a frame. Returns as soon as the frame is queued; the draining task performs the
    /// (possibly blocking) copy.
    pub fn write(&self, frame: Vec<u8>) -> Result<(), RingError> {
        if self.failed.load(Ordering::Acquire) {
            return Err(RingError::Closed);
        }
        if frame.len() > self.capacity {
            self.failed.store(true, Ordering::Release);
            // The loop may already be gone; the caller still learns why.
            let _ = self.tx.send(Queued::Oversized(frame.len()));
            return Err(RingError::FrameTooLarge {
                len: frame.len(),
                capacity: self.capacity,
            });
        }
        self.tx
            .send(Queued::Frame(frame))
            .map_err(|_| RingError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.failed.load(Ordering::Acquire) || self.tx.is_closed()
    }
}

/// Consumer half. Owns the private read cursor.
#[derive(Debug)]
pub struct RingReader {
    ring: RingBuffer,
    cursor: usize,
}

impl RingReader {
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Block until at least one byte is pending and return the pending byte count.
    pub fn poll(&self) -> usize {
        loop {
            let pending = self.ring.ctrl.load(ring_ctrl::PENDING);
            if pending > 0 {
                return pending as usize;
            }
            self.ring.ctrl.wait(ring_ctrl::PENDING, pending);
        }
    }

    /// Pending byte count without blocking.
    pub fn try_poll(&self) -> usize {
        self.ring.pending()
    }

    /// Copy out the next `len` pending bytes without consuming them.
    pub fn read(&self, len: usize) -> Result<Vec<u8>, RingError> {
        self.check_pending(len)?;
        let mut out = vec![0u8; len];
        self.ring.copy_out(self.cursor, &mut out)?;
        Ok(out)
    }

    /// Release `len` bytes back to the producer and wake it.
    pub fn commit(&mut self, len: usize) -> Result<(), RingError> {
        self.check_pending(len)?;
        self.cursor = (self.cursor + len) % self.ring.capacity();
        self.ring.ctrl.sub(ring_ctrl::PENDING, len as i32);
        self.ring.ctrl.notify();
        Ok(())
    }

    fn check_pending(&self, len: usize) -> Result<(), RingError> {
        let pending = self.ring.pending();
        if len > pending {
            return Err(RingError::PastPending {
                requested: len,
                pending,
            });
        }
        Ok(())
    }
}
