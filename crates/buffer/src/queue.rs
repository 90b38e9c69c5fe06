//! Bounded multi-producer/multi-consumer handoff of buffer ownership.

use crossbeam::queue::ArrayQueue;

use crate::Buffer;

/// A bounded lock-free queue of [`Buffer`]s.
///
/// `push` and `pop` never block and never allocate; the ring is sized at
/// construction. A buffer lives in at most one queue at a time — pushing
/// moves ownership in, popping moves it back out.
#[derive(Debug)]
pub struct BufferQueue {
    inner: ArrayQueue<Buffer>,
}

impl BufferQueue {
    /// Creates a queue able to hold `capacity` buffers.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: ArrayQueue::new(capacity),
        }
    }

    /// Enqueues a buffer. On overflow the buffer is handed back unchanged.
    pub fn push(&self, buffer: Buffer) -> Result<(), Buffer> {
        self.inner.push(buffer)
    }

    /// Dequeues a buffer, or `None` when the queue is empty.
    pub fn pop(&self) -> Option<Buffer> {
        self.inner.pop()
    }

    /// Number of buffers currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Maximum number of buffers the queue can hold.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}
