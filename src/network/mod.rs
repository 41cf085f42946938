//! Network transport: the acceptor, the readiness reactor, packed-int
//! message framing, the shared connection handle, and the suspect
//! backpressure policy.

pub use acceptor::{ConnectionListener, TcpAcceptor};
pub use connection::Connection;
pub use framing::{decode_length, encode_length, frame_message, MAX_PREFIX_BYTES};

pub(crate) mod acceptor;
pub(crate) mod backpressure;
pub(crate) mod connection;
pub(crate) mod framing;
pub(crate) mod reactor;
