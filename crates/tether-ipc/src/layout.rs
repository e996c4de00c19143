//! Shared memory layout contract for tether IPC.
//!
//! A worker's module memory is a single byte-addressable region. The coordinator carves ring
//! data regions and scratch buffers out of it, and pairs each ring with a separate word buffer
//! holding its control counters:
//!
//! - ring data: `capacity` raw bytes inside [`crate::SharedMemory`]
//! - ring control: [`ring_ctrl::WORDS`] 32-bit words inside a [`crate::WordBuffer`]
//!
//! All multi-byte integers written into shared memory are little-endian.

/// Default alignment for regions handed out by [`crate::SharedMemory::alloc`].
pub const REGION_ALIGN: usize = 8;

/// Largest ring capacity whose `pending` counter still fits in an `i32` word.
pub const MAX_RING_CAPACITY: usize = i32::MAX as usize;

/// Control word indices for a ring buffer when viewed as an `Int32Array`.
pub mod ring_ctrl {
    /// Bytes written by the producer and not yet committed by the consumer.
    pub const PENDING: usize = 0;
    pub const WORDS: usize = 1;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub ptr: u32,
    pub len: u32,
}

impl Region {
    pub fn new(ptr: u32, len: u32) -> Self {
        Self { ptr, len }
    }

    pub fn end(self) -> u64 {
        self.ptr as u64 + self.len as u64
    }

    /// A sub-region `[offset, offset + len)` relative to the start of this one.
    pub fn slice(self, offset: u32, len: u32) -> Option<Region> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        Some(Region {
            ptr: self.ptr + offset,
            len,
        })
    }
}

pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + (align - 1)) & !(align - 1)
}
