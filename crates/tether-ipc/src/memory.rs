//! Byte-addressable memory shared between a worker and the coordinator.
//!
//! This is the host-side stand-in for a module's linear memory backed by a
//! `SharedArrayBuffer`: every context holds a clone of the same region and addresses it by
//! `(ptr, len)`. The region itself performs no synchronization; callers order their accesses
//! through the atomic words of a [`crate::WordBuffer`] (ring `pending` counters, request slots).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::layout::{align_up, Region};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("out of bounds: ptr={ptr} len={len} size={size}")]
    OutOfBounds { ptr: u64, len: u64, size: usize },

    #[error("out of shared memory: requested {requested} bytes, {available} available")]
    Exhausted { requested: usize, available: usize },

    #[error("shared memory of {0} bytes is not addressable with 32-bit pointers")]
    TooLarge(usize),
}

struct Inner {
    data_ptr: *mut u8,
    len: usize,
    next_free: AtomicUsize,
}

// The raw region is only ever accessed through bounds-checked copies. Exclusive access to any
// given byte range is a protocol-level guarantee provided by the atomic control words.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

impl Drop for Inner {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(core::ptr::slice_from_raw_parts_mut(
                self.data_ptr,
                self.len,
            )));
        }
    }
}

#[derive(Clone)]
pub struct SharedMemory {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemory")
            .field("len", &self.inner.len)
            .field("allocated", &self.inner.next_free.load(Ordering::Relaxed))
            .finish()
    }
}

impl SharedMemory {
    /// Allocate a zeroed region of `len` bytes.
    ///
    /// Pointers are 32-bit like a wasm32 linear memory, so `len` must not exceed `u32::MAX`.
    pub fn new(len: usize) -> Result<Self, MemoryError> {
        if len > u32::MAX as usize {
            return Err(MemoryError::TooLarge(len));
        }
        let storage = vec![0u8; len].into_boxed_slice();
        let data_ptr = Box::into_raw(storage) as *mut u8;
        Ok(Self {
            inner: Arc::new(Inner {
                data_ptr,
                len,
                next_free: AtomicUsize::new(0),
            }),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Whether both handles refer to the same underlying region.
    pub fn same_region(&self, other: &SharedMemory) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn check(&self, ptr: u32, len: usize) -> Result<(), MemoryError> {
        let end = ptr as u64 + len as u64;
        if end > self.inner.len as u64 {
            return Err(MemoryError::OutOfBounds {
                ptr: ptr as u64,
                len: len as u64,
                size: self.inner.len,
            });
        }
        Ok(())
    }

    pub fn read(&self, ptr: u32, out: &mut [u8]) -> Result<(), MemoryError> {
        self.check(ptr, out.len())?;
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.inner.data_ptr.add(ptr as usize),
                out.as_mut_ptr(),
                out.len(),
            );
        }
        Ok(())
    }

    pub fn read_vec(&self, ptr: u32, len: usize) -> Result<Vec<u8>, MemoryError> {
        self.check(ptr, len)?;
        let mut out = vec![0u8; len];
        self.read(ptr, &mut out)?;
        Ok(out)
    }

    pub fn write(&self, ptr: u32, data: &[u8]) -> Result<(), MemoryError> {
        self.check(ptr, data.len())?;
        unsafe {
            core::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.inner.data_ptr.add(ptr as usize),
                data.len(),
            );
        }
        Ok(())
    }

    /// Carve a fresh `len`-byte region out of the memory.
    ///
    /// This is a bump allocator; regions are never returned. It exists so tests and hosts can
    /// hand each worker its scratch buffers and ring data without a real module allocator.
    pub fn alloc(&self, len: usize, align: usize) -> Result<Region, MemoryError> {
        let mut current = self.inner.next_free.load(Ordering::Relaxed);
        loop {
            let start = align_up(current, align.max(1));
            let end = start.checked_add(len).filter(|end| *end <= self.inner.len);
            let Some(end) = end else {
                return Err(MemoryError::Exhausted {
                    requested: len,
                    available: self.inner.len.saturating_sub(start),
                });
            };
            match self.inner.next_free.compare_exchange_weak(
                current,
                end,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(Region::new(start as u32, len as u32)),
                Err(actual) => current = actual,
            }
        }
    }
}
