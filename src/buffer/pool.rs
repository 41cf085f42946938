use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::trace;

use crate::service::{BufferPoolConfig, BufferType};

/// A fixed-size I/O buffer on loan from a [`BufferPool`].
///
/// The buffer tracks how much of it has been filled and an optional `limit`
/// below its capacity, so a socket read can be stopped exactly at a message
/// boundary. Ownership is the release token: a `PooledBuffer` moves back into
/// the pool through [`BufferPool::release`] and cannot be returned twice.
#[derive(Debug)]
pub struct PooledBuffer {
    data: Box<[u8]>,
    filled: usize,
    limit: usize,
}

impl PooledBuffer {
    fn new(size: usize) -> Self {
        PooledBuffer {
            data: vec![0u8; size].into_boxed_slice(),
            filled: 0,
            limit: size,
        }
    }

    /// The filled prefix of the buffer.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    /// The writable region between the fill position and the limit.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.filled..self.limit]
    }

    /// Record that `n` more bytes have been written into the spare region.
    pub fn advance_filled(&mut self, n: usize) {
        debug_assert!(self.filled + n <= self.limit);
        self.filled += n;
    }

    /// Restrict the writable region; used for the last buffer of a message so
    /// a read never crosses into the next message.
    pub fn set_limit(&mut self, limit: usize) {
        debug_assert!(limit <= self.data.len());
        self.limit = limit;
    }

    pub fn is_full(&self) -> bool {
        self.filled == self.limit
    }

    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    fn reset(&mut self) {
        self.filled = 0;
        self.limit = self.data.len();
    }
}

#[derive(Debug)]
struct PoolInner {
    free: VecDeque<PooledBuffer>,
    /// Buffers ever allocated for the pool proper; never exceeds `capacity`
    /// when the pool is capacity-limited.
    size: usize,
    /// Buffers currently on loan beyond `capacity`; such buffers are
    /// transient and are never added to the free list.
    overflow: usize,
}

/// A growable pool of fixed-size I/O buffers with a capacity ceiling and
/// overflow accounting.
///
/// `acquire` grows the pool lazily while under capacity; at capacity it hands
/// out transient buffers and counts them as overflow. `release` discards a
/// buffer while the pool is in overflow, which keeps the steady-state pool
/// bounded at `capacity` while tolerating bursts.
#[derive(Debug)]
pub struct BufferPool {
    name: &'static str,
    buffer_size: usize,
    buffer_type: BufferType,
    capacity: usize,
    inner: Mutex<PoolInner>,
}

impl BufferPool {
    /// Create a pool from validated configuration.
    pub fn new(name: &'static str, config: &BufferPoolConfig) -> Self {
        debug_assert!(config.buffer_size > 0);
        BufferPool {
            name,
            buffer_size: config.buffer_size,
            buffer_type: config.buffer_type,
            capacity: config.capacity,
            inner: Mutex::new(PoolInner {
                free: VecDeque::new(),
                size: 0,
                overflow: 0,
            }),
        }
    }

    /// Borrow a buffer from the pool, ready for writing.
    pub fn acquire(&self) -> PooledBuffer {
        let grow = {
            let mut inner = self.inner.lock();
            if let Some(mut buffer) = inner.free.pop_front() {
                buffer.reset();
                return buffer;
            }
            if self.capacity == 0 || inner.size < self.capacity {
                inner.size += 1;
                true
            } else {
                inner.overflow += 1;
                false
            }
        };

        if grow {
            trace!(
                "{} buffer pool increased to {} bytes total",
                self.name,
                self.size() * self.buffer_size
            );
        } else {
            trace!(
                "{} buffer pool allocated a transient {} byte buffer",
                self.name,
                self.buffer_size
            );
        }
        PooledBuffer::new(self.buffer_size)
    }

    /// Return a buffer to the pool.
    ///
    /// While the pool is in overflow the buffer is discarded instead of being
    /// pooled; the released buffer need not be the one that caused the
    /// overflow.
    pub fn release(&self, mut buffer: PooledBuffer) {
        let mut inner = self.inner.lock();
        if inner.overflow > 0 {
            inner.overflow -= 1;
            trace!("{} buffer pool discarded {} bytes", self.name, buffer.capacity());
        } else {
            buffer.reset();
            inner.free.push_back(buffer);
        }
    }

    pub fn is_capacity_limited(&self) -> bool {
        self.capacity > 0
    }

    /// True while buffers are on loan beyond the configured capacity.
    pub fn in_overflow(&self) -> bool {
        self.overflow() > 0
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn buffer_type(&self) -> BufferType {
        self.buffer_type
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Buffers ever allocated for the pool proper.
    pub fn size(&self) -> usize {
        self.inner.lock().size
    }

    /// Buffers currently on loan beyond capacity.
    pub fn overflow(&self) -> usize {
        self.inner.lock().overflow
    }

    /// Buffers currently sitting on the free list.
    pub fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }
}
