//! Fixed-size pool of fixed-capacity outbound buffers.
//!
//! Every buffer is allocated when the pool is built. Callers borrow one with
//! [`BufferPool::acquire`], which waits at most the configured acquire timeout
//! when all buffers are checked out, and hand it back by dropping the
//! [`PooledBuffer`] guard. Release never waits.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::info;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("no buffer became available within {waited:?}")]
    Exhausted { waited: Duration },
    #[error("buffer pool is closed")]
    Closed,
    #[error("buffer pool free list drained while permits were outstanding")]
    Drained,
}

impl PoolError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            PoolError::Exhausted { .. } => "exhausted",
            PoolError::Closed => "closed",
            PoolError::Drained => "drained",
        }
    }
}

/// Reusable byte region with a fixed capacity and a write position.
#[derive(Debug)]
pub struct Buffer {
    slot: usize,
    bytes: BytesMut,
    capacity: usize,
}

impl Buffer {
    fn new(slot: usize, capacity: usize) -> Self {
        Self {
            slot,
            bytes: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Index of the buffer inside its pool, stable for the pool's lifetime.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current write position.
    pub fn position(&self) -> usize {
        self.bytes.len()
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    #[cfg(test)]
    pub(crate) fn put_slice(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= self.remaining());
        self.bytes.extend_from_slice(data);
    }

    pub(crate) fn writer(&mut self) -> &mut BytesMut {
        &mut self.bytes
    }
}

#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free: Mutex<Vec<Buffer>>,
    permits: Semaphore,
    size: usize,
    capacity: usize,
    acquire_timeout: Duration,
}

impl BufferPool {
    pub fn new(size: usize, capacity: usize, acquire_timeout: Duration) -> Self {
        let free: Vec<Buffer> = (0..size).map(|slot| Buffer::new(slot, capacity)).collect();
        info!(
            buffers = size,
            capacity,
            total_bytes = size * capacity,
            "buffer pool allocated"
        );
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                permits: Semaphore::new(size),
                size,
                capacity,
                acquire_timeout,
            }),
        }
    }

    /// Number of buffers owned by the pool.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Capacity of every buffer in bytes.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Buffers currently free.
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    pub async fn acquire(&self) -> Result<PooledBuffer, PoolError> {
        let waited = self.inner.acquire_timeout;
        let permit = tokio::time::timeout(waited, self.inner.permits.acquire())
            .await
            .map_err(|_| PoolError::Exhausted { waited })?
            .map_err(|_| PoolError::Closed)?;
        permit.forget();
        self.take_free()
    }

    pub fn try_acquire(&self) -> Result<PooledBuffer, PoolError> {
        let permit = self
            .inner
            .permits
            .try_acquire()
            .map_err(|err| match err {
                tokio::sync::TryAcquireError::Closed => PoolError::Closed,
                tokio::sync::TryAcquireError::NoPermits => PoolError::Exhausted {
                    waited: Duration::ZERO,
                },
            })?;
        permit.forget();
        self.take_free()
    }

    // Release pushes to the free list before adding the permit, so a granted
    // permit always has a buffer waiting.
    fn take_free(&self) -> Result<PooledBuffer, PoolError> {
        let buffer = self.inner.free.lock().pop().ok_or(PoolError::Drained)?;
        Ok(PooledBuffer {
            buffer,
            pool: Arc::clone(&self.inner),
        })
    }
}

/// A buffer checked out of the pool. Dropping it clears the write position and
/// returns the buffer.
pub struct PooledBuffer {
    buffer: Buffer,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuffer {
    type Target = Buffer;

    fn deref(&self) -> &Buffer {
        &self.buffer
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Buffer {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        // A zero-capacity placeholder does not allocate.
        let placeholder = Buffer::new(self.buffer.slot, 0);
        let mut buffer = std::mem::replace(&mut self.buffer, placeholder);
        buffer.clear();
        self.pool.free.lock().push(buffer);
        self.pool.permits.add_permits(1);
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("buffer", &self.buffer)
            .finish()
    }
}
