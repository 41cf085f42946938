//! The single-threaded readiness reactor.
//!
//! One thread owns the listening socket, every accepted stream, and both
//! per-connection framing state machines. Producer threads never touch a
//! socket; they enqueue messages on the shared [`Connection`] handle and
//! wake the reactor through its [`Waker`]. Sockets are registered
//! edge-triggered, so every readiness event is drained until the socket
//! reports `WouldBlock`.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use socket2::SockRef;
use tracing::{debug, error, info, trace, warn};

use crate::buffer::{MessageBuffer, PooledBuffer};
use crate::network::acceptor::AcceptorShared;
use crate::network::connection::Connection;
use crate::network::framing::{
    decode_length, encode_length, enforce_max_message_size, MAX_PREFIX_BYTES,
};
use crate::service::{AppError, AppResult, NetworkConfig};

pub(crate) const LISTENER_TOKEN: Token = Token(0);
pub(crate) const WAKER_TOKEN: Token = Token(1);
const FIRST_CONNECTION_TOKEN: usize = 2;

/// Bounds how long a shutdown request or flush/release work can sit unseen
/// if the waker races the poll call.
const POLL_TIMEOUT: Duration = Duration::from_millis(500);

const EVENT_CAPACITY: usize = 1_024;

pub(crate) struct Reactor {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    shared: Arc<AcceptorShared>,
    connections: HashMap<Token, ConnIo>,
    next_token: usize,
}

impl Reactor {
    pub(crate) fn new(
        poll: Poll,
        mut listener: TcpListener,
        shared: Arc<AcceptorShared>,
    ) -> AppResult<Reactor> {
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        Ok(Reactor {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            listener,
            shared,
            connections: HashMap::new(),
            next_token: FIRST_CONNECTION_TOKEN,
        })
    }

    pub(crate) fn run(mut self) -> AppResult<()> {
        debug!("reactor running");
        loop {
            if let Err(e) = self.poll.poll(&mut self.events, Some(POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("reactor poll failed: {}", e);
                self.shutdown();
                return Err(e.into());
            }

            let ready: Vec<(Token, bool, bool)> = self
                .events
                .iter()
                .map(|event| (event.token(), event.is_readable(), event.is_writable()))
                .collect();
            for (token, readable, writable) in ready {
                match token {
                    LISTENER_TOKEN => self.accept_ready(),
                    WAKER_TOKEN => {
                        // nothing to do here; the wake exists to run the
                        // flush and release queues below
                    }
                    token => self.drive_connection(token, readable, writable),
                }
            }

            if self.shared.shutdown.load(Ordering::Acquire) {
                break;
            }
            self.flush_connections();
            self.release_connections();
        }
        self.shutdown();
        Ok(())
    }

    /// Drain the pending accept backlog.
    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    if !self.shared.is_accepting() {
                        debug!(
                            "refused connection from {}: the acceptor is not accepting",
                            peer_addr
                        );
                        continue;
                    }
                    if !self.shared.is_authorized(peer_addr.ip()) {
                        self.shared
                            .unauthorized_attempts
                            .fetch_add(1, Ordering::Relaxed);
                        warn!("refused connection from unauthorized host {}", peer_addr);
                        continue;
                    }
                    self.open_connection(stream, peer_addr);
                }
                Err(ref e) if would_block(e) => break,
                Err(ref e) if interrupted(e) => continue,
                Err(e) => {
                    warn!("error accepting a connection: {}", e);
                    break;
                }
            }
        }
    }

    fn open_connection(&mut self, mut stream: TcpStream, peer_addr: std::net::SocketAddr) {
        if let Err(e) = configure_stream(&stream, &self.shared.config.network) {
            warn!("error configuring the socket for {}: {}", peer_addr, e);
            return;
        }

        let token = Token(self.next_token);
        self.next_token += 1;
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)
        {
            warn!("error registering the socket for {}: {}", peer_addr, e);
            return;
        }

        let conn = Connection::new(peer_addr, self.shared.clone());
        conn.set_token(token.0);
        self.shared.connections.insert(conn.id(), conn.clone());
        info!("accepted {}", conn);
        self.connections.insert(token, ConnIo::new(stream, conn));
    }

    fn drive_connection(&mut self, token: Token, readable: bool, writable: bool) {
        let Self {
            poll,
            connections,
            shared,
            ..
        } = self;
        let Some(io) = connections.get_mut(&token) else {
            return;
        };
        if !io.conn.is_open() {
            // already on the release queue; leave the socket alone
            return;
        }

        let mut outcome = Ok(IoOutcome::Open);
        if readable {
            outcome = io.on_readable(shared);
        }
        if writable && matches!(outcome, Ok(IoOutcome::Open)) {
            outcome = io.on_writable(poll.registry());
        }

        match outcome {
            Ok(IoOutcome::Open) => {}
            Ok(IoOutcome::Eos) => {
                debug!("{} closed by the peer", io.conn);
                io.conn.close(true, None);
            }
            Err(e) => {
                io.conn.close(true, Some(e));
            }
        }
    }

    /// Grant write interest to every connection whose queue went from empty
    /// to non-empty since the last pass.
    fn flush_connections(&mut self) {
        loop {
            let Some(conn) = self.shared.flush_queue.lock().pop_front() else {
                break;
            };
            if !conn.is_open() {
                continue;
            }
            let token = Token(conn.token());
            let Self {
                poll, connections, ..
            } = self;
            if let Some(io) = connections.get_mut(&token) {
                if io.conn.id() == conn.id() {
                    if let Err(e) = io.set_write_interest(poll.registry(), true) {
                        warn!("error arming write interest for {}: {}", conn, e);
                        conn.close(true, Some(e.into()));
                    }
                }
            }
        }
    }

    /// Tear down every connection scheduled for release, returning its
    /// pooled buffers and notifying the listener.
    fn release_connections(&mut self) {
        loop {
            let Some(conn) = self.shared.release_queue.lock().pop_front() else {
                break;
            };
            self.release_connection(&conn);
        }
    }

    fn release_connection(&mut self, conn: &Arc<Connection>) {
        conn.finalize_close();
        self.shared.connections.remove(&conn.id());

        let token = Token(conn.token());
        let owns_token = self
            .connections
            .get(&token)
            .map_or(false, |io| io.conn.id() == conn.id());
        if owns_token {
            if let Some(mut io) = self.connections.remove(&token) {
                if let Err(e) = self.poll.registry().deregister(&mut io.stream) {
                    trace!("error deregistering {}: {}", conn, e);
                }
                io.reclaim_buffers(&self.shared);
            }
        }
        conn.drain_outgoing();

        let reason = conn.take_close_reason();
        match reason {
            Some(e) => {
                if e.is_suspect_kill() {
                    error!("released {}: {}", conn, e);
                } else {
                    warn!("released {} after an error: {}", conn, e);
                }
                if conn.notify_on_close() {
                    self.shared.listener.on_connection_error(conn, &e);
                }
            }
            None => {
                info!("released {}", conn);
                if conn.notify_on_close() {
                    self.shared.listener.on_connection_closed(conn);
                }
            }
        }
    }

    fn shutdown(&mut self) {
        let conns: Vec<Arc<Connection>> = self
            .connections
            .values()
            .map(|io| io.conn.clone())
            .collect();
        for conn in conns {
            conn.close(true, None);
        }
        self.release_connections();
        debug!("reactor stopped");
    }
}

enum IoOutcome {
    /// The socket drained; wait for the next readiness event.
    Open,
    /// The peer sent end-of-stream; close in an orderly fashion even if it
    /// landed mid-message.
    Eos,
}

/// Reactor-private state for one socket: the stream plus both framing
/// state machines. Nothing here is ever locked.
struct ConnIo {
    stream: TcpStream,
    token: Token,
    conn: Arc<Connection>,
    incoming: Incoming,
    outgoing: Outgoing,
    write_interest: bool,
}

impl ConnIo {
    fn new(stream: TcpStream, conn: Arc<Connection>) -> ConnIo {
        let token = Token(conn.token());
        ConnIo {
            stream,
            token,
            conn,
            incoming: Incoming::default(),
            outgoing: Outgoing::default(),
            write_interest: false,
        }
    }

    fn set_write_interest(&mut self, registry: &Registry, on: bool) -> io::Result<()> {
        if on == self.write_interest {
            return Ok(());
        }
        let interest = if on {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        registry.reregister(&mut self.stream, self.token, interest)?;
        self.write_interest = on;
        Ok(())
    }

    /// Drain the socket: decode length prefixes, fill pooled body segments,
    /// and dispatch every complete message. A single read may carry the
    /// tail of one message and the head of the next; leftover bytes are
    /// carried in the prefix scratch buffer across iterations.
    fn on_readable(&mut self, shared: &Arc<AcceptorShared>) -> AppResult<IoOutcome> {
        let max_size = shared.config.network.max_incoming_message_size;
        loop {
            match self.incoming.state {
                IncomingState::Initial => {
                    let buffered = &self.incoming.prefix[..self.incoming.prefix_filled];
                    if let Some((total, consumed)) = decode_length(buffered)? {
                        enforce_max_message_size(total, max_size)?;
                        self.incoming.total = total;
                        self.incoming.read = 0;
                        self.incoming.prefix_consumed = consumed;
                        self.incoming.state = IncomingState::LengthDecoded;
                        continue;
                    }
                    debug_assert!(self.incoming.prefix_filled < MAX_PREFIX_BYTES);
                    let filled = self.incoming.prefix_filled;
                    match self.stream.read(&mut self.incoming.prefix[filled..]) {
                        Ok(0) => return Ok(IoOutcome::Eos),
                        Ok(n) => self.incoming.prefix_filled += n,
                        Err(ref e) if would_block(e) => return Ok(IoOutcome::Open),
                        Err(ref e) if interrupted(e) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                IncomingState::LengthDecoded => {
                    self.incoming.absorb_prefix_leftover(shared);
                    self.incoming.state = IncomingState::BodyInProgress;
                }
                IncomingState::BodyInProgress => {
                    if self.incoming.read == self.incoming.total {
                        self.dispatch(shared);
                        continue;
                    }
                    self.incoming.ensure_segment(shared);
                    let segment = self
                        .incoming
                        .segments
                        .last_mut()
                        .filter(|s| !s.is_full())
                        .ok_or_else(|| {
                            AppError::IllegalStateError(
                                "no writable segment for the message body".to_string(),
                            )
                        })?;
                    match self.stream.read(segment.spare_mut()) {
                        Ok(0) => return Ok(IoOutcome::Eos),
                        Ok(n) => {
                            segment.advance_filled(n);
                            self.incoming.read += n;
                        }
                        Err(ref e) if would_block(e) => return Ok(IoOutcome::Open),
                        Err(ref e) if interrupted(e) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }

    /// Hand the completed message to the listener and rewind the state
    /// machine; bytes already slid into the prefix scratch seed the next
    /// message without another read call.
    fn dispatch(&mut self, shared: &Arc<AcceptorShared>) {
        let segments = std::mem::take(&mut self.incoming.segments);
        let message =
            MessageBuffer::from_segments(segments, self.incoming.total, shared.pool_in.clone());
        trace!("{} received a {} byte message", self.conn, message.len());
        self.incoming.total = 0;
        self.incoming.read = 0;
        self.incoming.state = IncomingState::Initial;
        shared.listener.on_message(&self.conn, message);
    }

    /// Write queued messages until the socket or the queue is exhausted.
    /// When the queue drains, write interest is dropped; the next send
    /// re-arms it through the flush queue.
    fn on_writable(&mut self, registry: &Registry) -> AppResult<IoOutcome> {
        loop {
            match self.outgoing.state {
                OutgoingState::Initial => match self.conn.pop_outgoing() {
                    None => {
                        self.set_write_interest(registry, false)?;
                        return Ok(IoOutcome::Open);
                    }
                    Some(message) => {
                        let (prefix, prefix_len) = encode_length(message.len());
                        self.outgoing.prefix = prefix;
                        self.outgoing.prefix_len = prefix_len;
                        self.outgoing.prefix_written = 0;
                        self.outgoing.message = Some(message);
                        self.outgoing.state = OutgoingState::LengthEncoded;
                    }
                },
                OutgoingState::LengthEncoded => {
                    while self.outgoing.prefix_written < self.outgoing.prefix_len {
                        let pending = &self.outgoing.prefix
                            [self.outgoing.prefix_written..self.outgoing.prefix_len];
                        match self.stream.write(pending) {
                            Ok(0) => return Ok(IoOutcome::Open),
                            Ok(n) => self.outgoing.prefix_written += n,
                            Err(ref e) if would_block(e) => return Ok(IoOutcome::Open),
                            Err(ref e) if interrupted(e) => continue,
                            Err(e) => return Err(e.into()),
                        }
                    }
                    self.outgoing.state = OutgoingState::BodyInProgress;
                }
                OutgoingState::BodyInProgress => {
                    let message = self.outgoing.message.as_mut().ok_or_else(|| {
                        AppError::IllegalStateError(
                            "no outgoing message in progress".to_string(),
                        )
                    })?;
                    use bytes::Buf;
                    while message.has_remaining() {
                        match self.stream.write(message.chunk()) {
                            Ok(0) => return Ok(IoOutcome::Open),
                            // advance returns fully-written segments to the pool
                            Ok(n) => message.advance(n),
                            Err(ref e) if would_block(e) => return Ok(IoOutcome::Open),
                            Err(ref e) if interrupted(e) => continue,
                            Err(e) => return Err(e.into()),
                        }
                    }
                    let total = message.len() as u64;
                    self.outgoing.message = None;
                    self.conn.record_sent(total);
                    trace!("{} sent a {} byte message", self.conn, total);
                    self.outgoing.state = OutgoingState::Initial;
                }
            }
        }
    }

    /// Return every pooled buffer still held by the framing state machines.
    fn reclaim_buffers(&mut self, shared: &Arc<AcceptorShared>) {
        for segment in self.incoming.segments.drain(..) {
            shared.pool_in.release(segment);
        }
        // dropping the in-flight message releases its remaining segments
        self.outgoing.message = None;
    }
}

#[derive(Default, Clone, Copy, PartialEq)]
enum IncomingState {
    #[default]
    Initial,
    LengthDecoded,
    BodyInProgress,
}

/// Inbound framing state: a scratch area for the packed-int length prefix
/// and the pooled segments being filled with the message body.
#[derive(Default)]
struct Incoming {
    state: IncomingState,
    prefix: [u8; MAX_PREFIX_BYTES],
    prefix_filled: usize,
    prefix_consumed: usize,
    total: usize,
    read: usize,
    segments: Vec<PooledBuffer>,
}

impl Incoming {
    /// Move prefix bytes beyond the decoded length into the body, and slide
    /// any surplus beyond this message back to the front of the scratch
    /// buffer where it seeds the next prefix.
    fn absorb_prefix_leftover(&mut self, shared: &Arc<AcceptorShared>) {
        let mut idx = self.prefix_consumed;
        let end = self.prefix_filled;
        while idx < end && self.read < self.total {
            self.ensure_segment(shared);
            let remaining = self.total - self.read;
            let segment = self.segments.last_mut().filter(|s| !s.is_full());
            let Some(segment) = segment else {
                break;
            };
            let spare = segment.spare_mut();
            let n = spare.len().min(end - idx).min(remaining);
            spare[..n].copy_from_slice(&self.prefix[idx..idx + n]);
            segment.advance_filled(n);
            self.read += n;
            idx += n;
        }
        self.prefix.copy_within(idx..end, 0);
        self.prefix_filled = end - idx;
        self.prefix_consumed = 0;
    }

    /// Acquire the next body segment when the current one is full, limited
    /// so the final segment never over-reads into the next message.
    fn ensure_segment(&mut self, shared: &Arc<AcceptorShared>) {
        let needs = match self.segments.last() {
            Some(segment) => segment.is_full(),
            None => true,
        };
        if needs && self.read < self.total {
            let mut segment = shared.pool_in.acquire();
            let limit = segment.capacity().min(self.total - self.read);
            segment.set_limit(limit);
            self.segments.push(segment);
        }
    }
}

#[derive(Default, Clone, Copy, PartialEq)]
enum OutgoingState {
    #[default]
    Initial,
    LengthEncoded,
    BodyInProgress,
}

/// Outbound framing state: the encoded prefix and the message being
/// transmitted. `Ok(0)` and `WouldBlock` both persist the state as-is.
#[derive(Default)]
struct Outgoing {
    state: OutgoingState,
    prefix: [u8; MAX_PREFIX_BYTES],
    prefix_len: usize,
    prefix_written: usize,
    message: Option<MessageBuffer>,
}

fn configure_stream(stream: &TcpStream, config: &NetworkConfig) -> io::Result<()> {
    stream.set_nodelay(config.no_delay)?;
    let sock = SockRef::from(stream);
    sock.set_keepalive(config.keep_alive)?;
    sock.set_linger(config.linger_secs.map(Duration::from_secs))?;
    Ok(())
}

fn would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

fn interrupted(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::Interrupted
}
