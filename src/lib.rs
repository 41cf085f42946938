//! gridgate is a TCP message acceptor for proxying clients into a data
//! grid. A single readiness reactor owns every socket; messages travel as
//! packed-int length-prefixed frames over pooled buffer segments, and an
//! adaptive suspect policy protects the service from slow consumers.

pub use buffer::{BufferPool, MessageBuffer, MessageWriter, PooledBuffer};
pub use network::{
    decode_length, encode_length, frame_message, Connection, ConnectionListener, TcpAcceptor,
    MAX_PREFIX_BYTES,
};
pub use service::{
    AcceptorConfig, AppError, AppResult, BufferPoolConfig, BufferType, NetworkConfig,
    SuspectConfig,
};

pub mod buffer;
pub mod network;
pub mod service;
