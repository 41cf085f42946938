use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

use dashmap::DashMap;
use mio::net::TcpListener;
use mio::{Poll, Waker};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{info, warn};

use crate::buffer::{BufferPool, MessageBuffer};
use crate::network::connection::Connection;
use crate::network::reactor::{Reactor, WAKER_TOKEN};
use crate::service::{AcceptorConfig, AppError, AppResult, NetworkConfig};

/// Callbacks for application code hosting a [`TcpAcceptor`].
///
/// `on_message` runs on the reactor thread; a slow implementation stalls
/// every connection, so hand the message off if processing is expensive.
pub trait ConnectionListener: Send + Sync {
    /// A complete inbound message arrived on `connection`.
    fn on_message(&self, connection: &Arc<Connection>, message: MessageBuffer);

    /// The connection closed in an orderly fashion.
    fn on_connection_closed(&self, _connection: &Arc<Connection>) {}

    /// The connection was torn down by an error or the suspect policy.
    fn on_connection_error(&self, _connection: &Arc<Connection>, _error: &AppError) {}
}

/// State shared between the reactor thread and producer threads.
pub(crate) struct AcceptorShared {
    pub config: AcceptorConfig,
    pub pool_in: Arc<BufferPool>,
    pub pool_out: Arc<BufferPool>,

    /// Every live connection by id; producers rank against this registry.
    pub connections: DashMap<u64, Arc<Connection>>,

    /// Connections whose queue just went non-empty and need write interest.
    pub flush_queue: Mutex<VecDeque<Arc<Connection>>>,
    /// Connections awaiting teardown on the reactor thread.
    pub release_queue: Mutex<VecDeque<Arc<Connection>>>,

    waker: OnceLock<Waker>,
    pub accepting: AtomicBool,
    pub shutdown: AtomicBool,
    pub unauthorized_attempts: AtomicU64,

    pub listener: Arc<dyn ConnectionListener>,
}

impl AcceptorShared {
    fn new(config: AcceptorConfig, listener: Arc<dyn ConnectionListener>) -> AcceptorShared {
        let pool_in = Arc::new(BufferPool::new("incoming", &config.incoming_pool));
        let pool_out = Arc::new(BufferPool::new("outgoing", &config.outgoing_pool));
        AcceptorShared {
            config,
            pool_in,
            pool_out,
            connections: DashMap::new(),
            flush_queue: Mutex::new(VecDeque::new()),
            release_queue: Mutex::new(VecDeque::new()),
            waker: OnceLock::new(),
            accepting: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            unauthorized_attempts: AtomicU64::new(0),
            listener,
        }
    }

    pub(crate) fn wake(&self) {
        if let Some(waker) = self.waker.get() {
            if let Err(e) = waker.wake() {
                warn!("error waking the reactor: {}", e);
            }
        }
    }

    /// New connections are turned away while the acceptor is suspended or
    /// the outgoing pool is in overflow.
    pub(crate) fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire) && !self.pool_out.in_overflow()
    }

    /// An empty authorized-host list admits every client.
    pub(crate) fn is_authorized(&self, ip: IpAddr) -> bool {
        let hosts = &self.config.network.authorized_hosts;
        hosts.is_empty() || hosts.contains(&ip)
    }
}

/// A TCP acceptor: binds the configured listen address, runs a dedicated
/// reactor thread, and surfaces each client socket as a [`Connection`].
///
/// ```no_run
/// use std::sync::Arc;
/// use gridgate::{AcceptorConfig, Connection, ConnectionListener, MessageBuffer, TcpAcceptor};
///
/// struct Echo;
/// impl ConnectionListener for Echo {
///     fn on_message(&self, connection: &Arc<Connection>, message: MessageBuffer) {
///         let _ = connection.send_bytes(&message.to_vec());
///     }
/// }
///
/// let mut acceptor = TcpAcceptor::new(AcceptorConfig::default(), Arc::new(Echo)).unwrap();
/// acceptor.start().unwrap();
/// acceptor.wait().unwrap();
/// ```
pub struct TcpAcceptor {
    shared: Arc<AcceptorShared>,
    local_addr: Option<SocketAddr>,
    reactor: Option<JoinHandle<AppResult<()>>>,
}

impl TcpAcceptor {
    pub fn new(config: AcceptorConfig, listener: Arc<dyn ConnectionListener>) -> AppResult<TcpAcceptor> {
        config.validate()?;
        Ok(TcpAcceptor {
            shared: Arc::new(AcceptorShared::new(config, listener)),
            local_addr: None,
            reactor: None,
        })
    }

    /// Bind the first viable configured address and start the reactor
    /// thread. Fails if no address binds or the acceptor already started.
    pub fn start(&mut self) -> AppResult<()> {
        if self.reactor.is_some() {
            return Err(AppError::IllegalStateError(
                "the acceptor is already started".to_string(),
            ));
        }
        info!("tcp acceptor starting");

        let listener = self.bind()?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        self.shared.waker.set(waker).map_err(|_| {
            AppError::IllegalStateError("the reactor waker is already installed".to_string())
        })?;

        let reactor = Reactor::new(poll, listener, self.shared.clone())?;
        let handle = std::thread::Builder::new()
            .name("gridgate-reactor".to_string())
            .spawn(move || reactor.run())?;
        self.reactor = Some(handle);
        info!("tcp acceptor started; listening on {}", local_addr);
        Ok(())
    }

    fn bind(&self) -> AppResult<TcpListener> {
        let network = &self.shared.config.network;
        let mut last_error: Option<io::Error> = None;
        for candidate in &network.listen_addresses {
            let resolved = match candidate.to_socket_addrs() {
                Ok(addrs) => addrs,
                Err(e) => {
                    warn!("cannot resolve listen address {}: {}", candidate, e);
                    last_error = Some(e);
                    continue;
                }
            };
            for addr in resolved {
                match bind_listener(addr, network) {
                    Ok(listener) => {
                        info!("bound to {}", addr);
                        return Ok(listener);
                    }
                    Err(e) => {
                        warn!("failed to bind {}: {}", addr, e);
                        last_error = Some(e);
                    }
                }
            }
        }
        Err(AppError::Bind(format!(
            "could not bind any of the configured listen addresses {:?}: {}",
            network.listen_addresses,
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no candidate addresses".to_string())
        )))
    }

    /// Signal the reactor to stop, close every connection, and join the
    /// reactor thread.
    pub fn stop(&mut self) -> AppResult<()> {
        if self.reactor.is_none() {
            return Ok(());
        }
        info!("tcp acceptor stopping");
        self.shared.accepting.store(false, Ordering::Release);
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake();
        let result = self.join_reactor();
        info!("tcp acceptor stopped");
        result
    }

    /// Block until the reactor thread exits.
    pub fn wait(&mut self) -> AppResult<()> {
        self.join_reactor()
    }

    fn join_reactor(&mut self) -> AppResult<()> {
        match self.reactor.take() {
            None => Ok(()),
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(AppError::IllegalStateError(
                    "the reactor thread panicked".to_string(),
                )),
            },
        }
    }

    /// The bound address, once started. Useful with a `:0` listen address.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn connection(&self, id: u64) -> Option<Arc<Connection>> {
        self.shared.connections.get(&id).map(|e| e.value().clone())
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.shared
            .connections
            .iter()
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Suspend or resume accepting new connections; existing connections
    /// are unaffected.
    pub fn set_accepting(&self, accepting: bool) {
        self.shared.accepting.store(accepting, Ordering::Release);
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.is_accepting()
    }

    pub fn unauthorized_connection_attempts(&self) -> u64 {
        self.shared.unauthorized_attempts.load(Ordering::Relaxed)
    }
}

impl Drop for TcpAcceptor {
    fn drop(&mut self) {
        if self.reactor.is_some() {
            let _ = self.stop();
        }
    }
}

fn bind_listener(addr: SocketAddr, network: &NetworkConfig) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(network.listen_backlog as i32)?;
    Ok(TcpListener::from_std(socket.into()))
}
