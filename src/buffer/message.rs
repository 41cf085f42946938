use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Buf;

use super::{BufferPool, PooledBuffer};

/// One fully-framed message held in pooled buffers.
///
/// A `MessageBuffer` is a read view composed of one or more segments on loan
/// from a [`BufferPool`]. Consuming it through [`Buf`] returns each fully
/// read segment to the pool as it is passed; dropping it returns whatever is
/// left. Ownership makes release a move-only operation, so a segment can
/// never go back to the pool twice.
#[derive(Debug)]
pub struct MessageBuffer {
    segments: VecDeque<PooledBuffer>,
    /// Read offset into the front segment.
    pos: usize,
    remaining: usize,
    len: usize,
    pool: Arc<BufferPool>,
}

impl MessageBuffer {
    pub(crate) fn from_segments(
        segments: Vec<PooledBuffer>,
        len: usize,
        pool: Arc<BufferPool>,
    ) -> Self {
        debug_assert_eq!(segments.iter().map(|s| s.len()).sum::<usize>(), len);
        MessageBuffer {
            segments: segments.into(),
            pos: 0,
            remaining: len,
            len,
            pool,
        }
    }

    /// Total length of the message, independent of how much has been read.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Return every remaining segment to the originating pool.
    pub fn release(self) {
        // Drop does the work.
    }

    /// Copy the unread remainder into a contiguous vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.remaining);
        let mut pos = self.pos;
        for segment in &self.segments {
            out.extend_from_slice(&segment.filled()[pos..]);
            pos = 0;
        }
        out
    }
}

impl Buf for MessageBuffer {
    fn remaining(&self) -> usize {
        self.remaining
    }

    fn chunk(&self) -> &[u8] {
        match self.segments.front() {
            Some(segment) => &segment.filled()[self.pos..],
            None => &[],
        }
    }

    fn advance(&mut self, mut cnt: usize) {
        assert!(cnt <= self.remaining, "advance past end of MessageBuffer");
        self.remaining -= cnt;
        while cnt > 0 {
            let front_left = self.segments.front().map(|s| s.len() - self.pos).unwrap();
            if cnt < front_left {
                self.pos += cnt;
                return;
            }
            cnt -= front_left;
            self.pos = 0;
            let segment = self.segments.pop_front().unwrap();
            self.pool.release(segment);
        }
    }
}

impl Drop for MessageBuffer {
    fn drop(&mut self) {
        while let Some(segment) = self.segments.pop_front() {
            self.pool.release(segment);
        }
    }
}

/// Builds an outbound message in pooled buffers, acquiring segments on
/// demand so producers never allocate per message.
#[derive(Debug)]
pub struct MessageWriter {
    segments: Vec<PooledBuffer>,
    len: usize,
    pool: Arc<BufferPool>,
}

impl MessageWriter {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        MessageWriter {
            segments: Vec::new(),
            len: 0,
            pool,
        }
    }

    pub fn write_all(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            if self.segments.last().map_or(true, |s| s.is_full()) {
                self.segments.push(self.pool.acquire());
            }
            let segment = self.segments.last_mut().unwrap();
            let n = bytes.len().min(segment.spare_mut().len());
            segment.spare_mut()[..n].copy_from_slice(&bytes[..n]);
            segment.advance_filled(n);
            self.len += n;
            bytes = &bytes[n..];
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Seal the message for sending.
    pub fn finish(mut self) -> MessageBuffer {
        let segments = std::mem::take(&mut self.segments);
        MessageBuffer::from_segments(segments, self.len, self.pool.clone())
    }
}

impl Drop for MessageWriter {
    fn drop(&mut self) {
        while let Some(segment) = self.segments.pop() {
            self.pool.release(segment);
        }
    }
}
