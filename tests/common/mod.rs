#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gridgate::{
    decode_length, frame_message, AcceptorConfig, AppError, Connection, ConnectionListener,
    MessageBuffer, TcpAcceptor,
};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum ListenerEvent {
    Message(Vec<u8>),
    Closed,
    Error(String),
}

/// Records every callback on a channel and optionally echoes messages back.
pub struct TestListener {
    events: Mutex<Sender<ListenerEvent>>,
    echo: bool,
}

impl TestListener {
    pub fn new(echo: bool) -> (Arc<TestListener>, Receiver<ListenerEvent>) {
        let (tx, rx) = mpsc::channel();
        (
            Arc::new(TestListener {
                events: Mutex::new(tx),
                echo,
            }),
            rx,
        )
    }

    fn emit(&self, event: ListenerEvent) {
        let _ = self.events.lock().unwrap().send(event);
    }
}

impl ConnectionListener for TestListener {
    fn on_message(&self, connection: &Arc<Connection>, message: MessageBuffer) {
        let body = message.to_vec();
        if self.echo {
            connection.send_bytes(&body).unwrap();
        }
        self.emit(ListenerEvent::Message(body));
    }

    fn on_connection_closed(&self, _connection: &Arc<Connection>) {
        self.emit(ListenerEvent::Closed);
    }

    fn on_connection_error(&self, _connection: &Arc<Connection>, error: &AppError) {
        self.emit(ListenerEvent::Error(error.to_string()));
    }
}

/// Start an acceptor on an ephemeral local port.
pub fn start_acceptor(
    mut config: AcceptorConfig,
    listener: Arc<dyn ConnectionListener>,
) -> (TcpAcceptor, SocketAddr) {
    config.network.listen_addresses = vec!["127.0.0.1:0".to_string()];
    let mut acceptor = TcpAcceptor::new(config, listener).unwrap();
    acceptor.start().unwrap();
    let addr = acceptor.local_addr().unwrap();
    (acceptor, addr)
}

pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(RECV_TIMEOUT)).unwrap();
    stream
}

/// Write one framed message: packed-int length prefix then the body.
pub fn send_frame(stream: &mut TcpStream, body: &[u8]) {
    stream.write_all(&frame_message(body)).unwrap();
}

/// Read one framed message off the client socket.
pub fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut prefix = Vec::new();
    let (len, consumed) = loop {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).unwrap();
        prefix.push(byte[0]);
        if let Some(decoded) = decode_length(&prefix).unwrap() {
            break decoded;
        }
    };
    assert_eq!(consumed, prefix.len());
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).unwrap();
    body
}

/// Poll `predicate` until it holds or the timeout elapses.
pub fn wait_until(predicate: impl Fn() -> bool) {
    let deadline = std::time::Instant::now() + RECV_TIMEOUT;
    while std::time::Instant::now() < deadline {
        if predicate() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("condition not reached within {:?}", RECV_TIMEOUT);
}
