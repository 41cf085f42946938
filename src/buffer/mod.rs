//! Pooled I/O buffer management.
//!
//! The acceptor moves all message bytes through two [`BufferPool`]s (one per
//! direction) of fixed-size buffers, so steady-state traffic causes no
//! per-message allocation. [`MessageBuffer`] is the multi-segment read view
//! handed to consumers; [`MessageWriter`] is the producer-side counterpart.

pub use message::{MessageBuffer, MessageWriter};
pub use pool::{BufferPool, PooledBuffer};

mod message;
mod pool;
