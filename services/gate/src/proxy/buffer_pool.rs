//! Shared pool of copy buffers.
//!
//! Each pump draws one buffer for the lifetime of its copy loop. The buffer
//! goes back to the pool when the [`PooledBuffer`] guard is dropped, so it is
//! returned on every exit path. Buffers are not zeroed on reuse; a pump only
//! ever reads the bytes its last `read` filled in.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Default size of a copy buffer (64 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 64 << 10;

/// Default number of idle buffers kept for reuse.
pub const DEFAULT_MAX_IDLE: usize = 1024;

/// A pool of fixed-size byte buffers, safe to share between tasks.
#[derive(Debug)]
pub struct BufferPool {
    buffer_size: usize,
    max_idle: usize,
    idle: Mutex<Vec<Box<[u8]>>>,
    /// Buffers currently alive (checked out plus idle).
    allocated: AtomicUsize,
}

impl BufferPool {
    /// Create a pool with the default buffer size and idle limit.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE, DEFAULT_MAX_IDLE)
    }

    /// Create a pool with a custom buffer size and idle limit.
    pub fn with_capacity(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            max_idle,
            idle: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Take a buffer from the pool, allocating one if none is idle.
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let reused = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        let buf = match reused {
            Some(buf) => buf,
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.buffer_size].into_boxed_slice()
            }
        };

        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    fn put(&self, buf: Box<[u8]>) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.max_idle {
            idle.push(buf);
        } else {
            drop(idle);
            self.allocated.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Number of buffers alive, whether checked out or idle.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Number of idle buffers waiting for reuse.
    pub fn idle(&self) -> usize {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Size in bytes of each buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A buffer checked out of a [`BufferPool`]. Returned on drop.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Option<Box<[u8]>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}
