//! Pool of reusable output buffers
//!
//! Buffers are handed out as guards and returned on drop, so every exit path
//! of a request gives its buffer back. Oversized buffers are discarded.

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Upper bound on idle buffers kept around
const MAX_IDLE_BUFFERS: usize = 256;

#[derive(Debug)]
struct PoolInner {
    idle: Mutex<Vec<String>>,
    max_buffer_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(max_buffer_bytes: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::new()),
                max_buffer_bytes,
            }),
        }
    }

    /// Take an empty buffer from the pool, allocating when none is idle
    pub fn acquire(&self) -> PooledBuffer {
        let buf = self.inner.idle.lock().pop().unwrap_or_default();
        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(&self.inner),
        }
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }
}

/// A buffer on loan from a [`BufferPool`]
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Option<String>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuffer {
    type Target = String;

    fn deref(&self) -> &String {
        self.buf.as_ref().expect("buffer present until drop")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut String {
        self.buf.as_mut().expect("buffer present until drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let Some(mut buf) = self.buf.take() else {
            return;
        };
        if buf.capacity() > self.pool.max_buffer_bytes {
            return;
        }
        buf.clear();
        let mut idle = self.pool.idle.lock();
        if idle.len() < MAX_IDLE_BUFFERS {
            idle.push(buf);
        }
    }
}
