//! Shared 32-bit word arrays with wait/notify.
//!
//! A [`WordBuffer`] is the host-side equivalent of an `Int32Array` over a `SharedArrayBuffer`
//! used with `Atomics.wait`, `Atomics.waitAsync` and `Atomics.notify`:
//!
//! - worker threads block in [`WordBuffer::wait`] (a `Condvar` park),
//! - the coordinator awaits [`WordBuffer::wait_async`] (a `tokio::sync::Notify` future),
//! - either side wakes the other with [`WordBuffer::notify`].
//!
//! A notify wakes every waiter of the buffer regardless of the word it waits on. Waits always
//! re-check their word, so the only cost is a spurious wakeup.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use tokio::sync::Notify;

struct Inner {
    words: Box<[AtomicI32]>,
    park: Mutex<()>,
    unparked: Condvar,
    notify: Notify,
}

#[derive(Clone)]
pub struct WordBuffer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WordBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let words: Vec<i32> = self
            .inner
            .words
            .iter()
            .map(|w| w.load(Ordering::Relaxed))
            .collect();
        f.debug_tuple("WordBuffer").field(&words).finish()
    }
}

impl WordBuffer {
    pub fn new(len: usize) -> Self {
        let words = (0..len).map(|_| AtomicI32::new(0)).collect();
        Self {
            inner: Arc::new(Inner {
                words,
                park: Mutex::new(()),
                unparked: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.words.is_empty()
    }

    pub fn same_buffer(&self, other: &WordBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn load(&self, index: usize) -> i32 {
        self.inner.words[index].load(Ordering::SeqCst)
    }

    pub fn store(&self, index: usize, value: i32) {
        self.inner.words[index].store(value, Ordering::SeqCst);
    }

    /// Atomically add `value`, returning the previous value.
    pub fn add(&self, index: usize, value: i32) -> i32 {
        self.inner.words[index].fetch_add(value, Ordering::SeqCst)
    }

    /// Atomically subtract `value`, returning the previous value.
    pub fn sub(&self, index: usize, value: i32) -> i32 {
        self.inner.words[index].fetch_sub(value, Ordering::SeqCst)
    }

    /// Store `new` only if word `index` still holds `current`. Returns the value found.
    pub fn compare_exchange(&self, index: usize, current: i32, new: i32) -> Result<i32, i32> {
        self.inner.words[index].compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
    }

    pub fn load_u32(&self, index: usize) -> u32 {
        self.load(index) as u32
    }

    pub fn store_u32(&self, index: usize, value: u32) {
        self.store(index, value as i32);
    }

    /// Wake every blocked and every pending async waiter.
    ///
    /// Must be called after the store it announces.
    pub fn notify(&self) {
        // Taking the park lock orders this wakeup after any waiter that already checked its
        // word and is about to sleep.
        drop(self.inner.park.lock().unwrap_or_else(PoisonError::into_inner));
        self.inner.unparked.notify_all();
        self.inner.notify.notify_waiters();
    }

    /// Block the calling thread while word `index` equals `expected`.
    pub fn wait(&self, index: usize, expected: i32) {
        let mut guard = self.inner.park.lock().unwrap_or_else(PoisonError::into_inner);
        while self.load(index) == expected {
            guard = self
                .inner
                .unparked
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wait (without blocking the executor) while word `index` equals `expected`.
    pub async fn wait_async(&self, index: usize, expected: i32) {
        loop {
            // `notify_waiters` reaches every `Notified` created before it, polled or not, so
            // registering before the check cannot lose a wakeup.
            let notified = self.inner.notify.notified();
            if self.load(index) != expected {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn arithmetic_returns_previous_value() {
        let w = WordBuffer::new(2);
        assert_eq!(w.add(1, 5), 0);
        assert_eq!(w.sub(1, 2), 5);
        assert_eq!(w.load(1), 3);
        w.store_u32(0, u32::MAX);
        assert_eq!(w.load(0), -1);
        assert_eq!(w.load_u32(0), u32::MAX);

        assert_eq!(w.compare_exchange(1, 0, 9), Err(3));
        assert_eq!(w.compare_exchange(1, 3, 9), Ok(3));
        assert_eq!(w.load(1), 9);
    }

    #[test]
    fn wait_returns_immediately_when_value_differs() {
        let w = WordBuffer::new(1);
        w.store(0, 7);
        w.wait(0, 0);
    }

    #[test]
    fn blocking_wait_wakes_on_notify_from_other_thread() {
        let w = WordBuffer::new(1);
        let remote = w.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.store(0, 1);
            remote.notify();
        });
        w.wait(0, 0);
        assert_eq!(w.load(0), 1);
        t.join().unwrap();
    }

    #[tokio::test]
    async fn async_wait_wakes_on_notify_from_thread() {
        let w = WordBuffer::new(1);
        let remote = w.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.store(0, 3);
            remote.notify();
        });
        w.wait_async(0, 0).await;
        assert_eq!(w.load(0), 3);
        t.join().unwrap();
    }
}
