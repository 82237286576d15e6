//! Reusable byte buffers for the receive hot path.
//!
//! Buffers are checked out as a [`PooledBuffer`] guard and go back to the pool
//! when the guard drops, so every exit path of a packet handler returns them.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Buffers kept idle beyond this are released instead of pooled.
const MAX_IDLE_BUFFERS: usize = 64;

/// A shared pool of `Vec<u8>` scratch buffers.
#[derive(Debug, Clone)]
pub struct BufferPool {
    // ---
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    // ---
    idle: Mutex<Vec<Vec<u8>>>,
    capacity: usize,
}

impl BufferPool {
    // ---
    /// Creates a pool whose fresh buffers reserve `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        // ---
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::new()),
                capacity,
            }),
        }
    }

    /// Checks out an empty buffer.
    pub fn take(&self) -> PooledBuffer {
        // ---
        let buf = self
            .inner
            .idle
            .lock()
            .ok()
            .and_then(|mut idle| idle.pop())
            .unwrap_or_else(|| Vec::with_capacity(self.inner.capacity));

        PooledBuffer {
            buf,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Number of buffers currently idle in the pool.
    pub fn idle(&self) -> usize {
        // ---
        self.inner.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }
}

/// A buffer on loan from a [`BufferPool`].
#[derive(Debug)]
pub struct PooledBuffer {
    // ---
    buf: Vec<u8>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuffer {
    // ---
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        // ---
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    // ---
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        // ---
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    // ---
    fn drop(&mut self) {
        // ---
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        if let Ok(mut idle) = self.pool.idle.lock() {
            if idle.len() < MAX_IDLE_BUFFERS {
                idle.push(buf);
            }
        }
    }
}
