use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::buffer::{MessageBuffer, MessageWriter};
use crate::network::backpressure::{self, SuspectState};
use crate::network::acceptor::AcceptorShared;
use crate::service::{AppError, AppResult};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// The shared, thread-safe face of one accepted socket.
///
/// Producer threads interact with a `Connection` only through [`send`] and
/// [`close`]; the reactor thread privately owns the socket and both framing
/// state machines, so no lock ever guards framing state. The outbound queue
/// holds fully-encoded, not-yet-transmitted messages; cumulative counters
/// make the backlog observable as `queued - sent`.
///
/// [`send`]: Connection::send
/// [`close`]: Connection::close
pub struct Connection {
    id: u64,
    peer_addr: SocketAddr,
    /// Signed so tests can backdate it past the clock's process-local epoch.
    connect_millis: AtomicI64,
    shared: Arc<AcceptorShared>,

    /// The mio token, once the reactor has registered the socket.
    token: AtomicUsize,

    queue: Mutex<VecDeque<MessageBuffer>>,
    messages_queued: AtomicU64,
    bytes_queued: AtomicU64,
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,

    pub(crate) suspect: Mutex<SuspectState>,

    /// Closing bars this gate for writing, which drains in-flight sends.
    gate: RwLock<()>,
    closed: AtomicBool,
    release_enqueued: AtomicBool,
    close_notify: AtomicBool,
    close_reason: Mutex<Option<AppError>>,
}

impl Connection {
    pub(crate) fn new(peer_addr: SocketAddr, shared: Arc<AcceptorShared>) -> Arc<Connection> {
        Arc::new(Connection {
            id: next_connection_id(),
            peer_addr,
            connect_millis: AtomicI64::new(backpressure::monotonic_millis() as i64),
            shared,
            token: AtomicUsize::new(usize::MAX),
            queue: Mutex::new(VecDeque::new()),
            messages_queued: AtomicU64::new(0),
            bytes_queued: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            suspect: Mutex::new(SuspectState::default()),
            gate: RwLock::new(()),
            closed: AtomicBool::new(false),
            release_enqueued: AtomicBool::new(false),
            close_notify: AtomicBool::new(true),
            close_reason: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Milliseconds (monotonic) since the client connected.
    pub fn alive_millis(&self) -> u64 {
        let elapsed =
            backpressure::monotonic_millis() as i64 - self.connect_millis.load(Ordering::Relaxed);
        elapsed.max(0) as u64
    }

    /// Backdate the connect time, as if the connection had been open for
    /// `millis` longer than it really has.
    #[cfg(test)]
    pub(crate) fn age_by(&self, millis: u64) {
        self.connect_millis
            .fetch_sub(millis as i64, Ordering::Relaxed);
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.release_enqueued.load(Ordering::Acquire)
    }

    /// A writer over the acceptor's outbound pool for building a message to
    /// [`send`](Connection::send).
    pub fn message_writer(&self) -> MessageWriter {
        MessageWriter::new(self.shared.pool_out.clone())
    }

    /// Enqueue an encoded message for transmission.
    ///
    /// Never blocks on I/O: the message is queued and the reactor is woken
    /// only when the queue was empty. The suspect backpressure policy is
    /// evaluated against the counter snapshot taken at enqueue time.
    pub fn send(self: &Arc<Self>, message: MessageBuffer) -> AppResult<()> {
        if message.is_empty() {
            return Err(AppError::InvalidValue(
                "cannot send an empty message".to_string(),
            ));
        }

        let _gate = self.gate.read();
        if !self.is_open() {
            return Err(AppError::ConnectionClosed(format!(
                "cannot send on {}",
                self
            )));
        }

        let len = message.len() as u64;
        let (first, queued_msgs, queued_bytes, sent_msgs, sent_bytes, was_suspect) = {
            let mut queue = self.queue.lock();
            queue.push_back(message);
            let first = queue.len() == 1;

            // counters are snapshotted while the queue lock is held since
            // multiple threads can send concurrently
            let queued_msgs = self.messages_queued.fetch_add(1, Ordering::Relaxed) + 1;
            let queued_bytes = self.bytes_queued.fetch_add(len, Ordering::Relaxed) + len;
            let sent_msgs = self.messages_sent.load(Ordering::Relaxed);
            let sent_bytes = self.bytes_sent.load(Ordering::Relaxed);
            let was_suspect = self.suspect.lock().suspect;
            (first, queued_msgs, queued_bytes, sent_msgs, sent_bytes, was_suspect)
        };

        if first {
            self.shared.flush_queue.lock().push_back(Arc::clone(self));
            self.shared.wake();
        }

        if self.shared.config.suspect.enabled {
            backpressure::evaluate(
                self,
                was_suspect,
                queued_msgs,
                queued_bytes,
                sent_msgs,
                sent_bytes,
            );
        }
        Ok(())
    }

    /// Convenience for producers sending a contiguous body.
    pub fn send_bytes(self: &Arc<Self>, body: &[u8]) -> AppResult<()> {
        let mut writer = self.message_writer();
        writer.write_all(body);
        self.send(writer.finish())
    }

    /// Request an asynchronous close.
    ///
    /// Bars the close gate so concurrent sends drain, records the reason,
    /// and schedules the connection on the acceptor's release queue; the
    /// reactor reclaims the socket and every pooled buffer. `notify`
    /// controls whether the [`ConnectionListener`] hears about the close.
    ///
    /// [`ConnectionListener`]: crate::network::ConnectionListener
    pub fn close(self: &Arc<Self>, notify: bool, reason: Option<AppError>) {
        {
            let _bar = self.gate.write();
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            self.close_notify.store(notify, Ordering::Release);
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = reason;
            }
        }
        self.enqueue_release();
    }

    /// Deliberate kill from the backpressure policy. Unlike [`close`] this
    /// may run inside a `send` (which holds the gate for reading), so it
    /// only flags the connection; the reactor finalizes the close.
    ///
    /// [`close`]: Connection::close
    pub(crate) fn kill(self: &Arc<Self>, reason: AppError) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.enqueue_release();
    }

    fn enqueue_release(self: &Arc<Self>) {
        if !self.release_enqueued.swap(true, Ordering::AcqRel) {
            self.shared.release_queue.lock().push_back(Arc::clone(self));
            self.shared.wake();
        }
    }

    /// Reactor-side: make the closed state definitive, excluding any send
    /// still in flight. Safe to call more than once.
    pub(crate) fn finalize_close(&self) {
        let _bar = self.gate.write();
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn take_close_reason(&self) -> Option<AppError> {
        self.close_reason.lock().take()
    }

    #[cfg(test)]
    pub(crate) fn peek_close_reason(&self) -> parking_lot::MutexGuard<'_, Option<AppError>> {
        self.close_reason.lock()
    }

    pub(crate) fn notify_on_close(&self) -> bool {
        self.close_notify.load(Ordering::Acquire)
    }

    pub(crate) fn set_token(&self, token: usize) {
        self.token.store(token, Ordering::Release);
    }

    pub(crate) fn token(&self) -> usize {
        self.token.load(Ordering::Acquire)
    }

    pub(crate) fn pop_outgoing(&self) -> Option<MessageBuffer> {
        self.queue.lock().pop_front()
    }

    /// Drop every queued outbound message, returning its buffers to the
    /// outbound pool.
    pub(crate) fn drain_outgoing(&self) {
        self.queue.lock().clear();
    }

    pub(crate) fn record_sent(&self, bytes: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn shared(&self) -> &Arc<AcceptorShared> {
        &self.shared
    }

    pub fn messages_queued(&self) -> u64 {
        self.messages_queued.load(Ordering::Relaxed)
    }

    pub fn bytes_queued(&self) -> u64 {
        self.bytes_queued.load(Ordering::Relaxed)
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn is_suspect(&self) -> bool {
        self.suspect.lock().suspect
    }

    /// Current backlog as `(messages, bytes)` not yet transmitted.
    pub fn backlog(&self) -> (u64, u64) {
        (
            self.messages_queued().saturating_sub(self.messages_sent()),
            self.bytes_queued().saturating_sub(self.bytes_sent()),
        )
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TcpConnection(id={}, peer={})", self.id, self.peer_addr)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("open", &self.is_open())
            .field("backlog", &self.backlog())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::acceptor::test_support::test_shared;
    use crate::service::AcceptorConfig;

    fn connection() -> Arc<Connection> {
        let shared = test_shared(AcceptorConfig::default());
        Connection::new("127.0.0.1:40000".parse().unwrap(), shared)
    }

    #[test]
    fn send_updates_counters_and_flush_queue() {
        let conn = connection();
        conn.send_bytes(b"hello").unwrap();
        conn.send_bytes(b"world!").unwrap();

        assert_eq!(conn.messages_queued(), 2);
        assert_eq!(conn.bytes_queued(), 11);
        assert_eq!(conn.backlog(), (2, 11));

        // only the first send (empty -> non-empty transition) flushes
        let flush = conn.shared().flush_queue.lock();
        assert_eq!(flush.len(), 1);
        assert_eq!(flush[0].id(), conn.id());
    }

    #[test]
    fn empty_messages_are_rejected() {
        let conn = connection();
        let writer = conn.message_writer();
        assert!(matches!(
            conn.send(writer.finish()),
            Err(AppError::InvalidValue(_))
        ));
    }

    #[test]
    fn close_excludes_further_sends_and_enqueues_release_once() {
        let conn = connection();
        conn.send_bytes(b"one").unwrap();
        conn.close(true, None);
        conn.close(true, None);

        assert!(!conn.is_open());
        assert!(matches!(
            conn.send_bytes(b"two"),
            Err(AppError::ConnectionClosed(_))
        ));
        assert_eq!(conn.shared().release_queue.lock().len(), 1);
    }

    #[test]
    fn drained_queue_returns_buffers_to_the_pool() {
        let conn = connection();
        conn.send_bytes(&[1u8; 5000]).unwrap();
        let borrowed = conn.shared().pool_out.size();
        assert!(borrowed > 0);
        assert_eq!(conn.shared().pool_out.free_count(), 0);

        conn.drain_outgoing();
        assert_eq!(conn.shared().pool_out.free_count(), borrowed);
    }

    #[test]
    fn sent_counters_reduce_the_backlog() {
        let conn = connection();
        conn.send_bytes(b"abcdef").unwrap();
        let msg = conn.pop_outgoing().unwrap();
        conn.record_sent(msg.len() as u64);
        assert_eq!(conn.backlog(), (0, 0));
    }
}
