//! On-the-wire framing behavior, exercised through real sockets.

mod common;

use std::io::Write;
use std::time::Duration;

use gridgate::{frame_message, AcceptorConfig};

use common::{
    connect, read_frame, send_frame, start_acceptor, ListenerEvent, TestListener, RECV_TIMEOUT,
};

#[test]
fn echo_round_trip() {
    let (listener, events) = TestListener::new(true);
    let (_acceptor, addr) = start_acceptor(AcceptorConfig::default(), listener);

    let mut client = connect(addr);
    send_frame(&mut client, b"ping");
    assert_eq!(read_frame(&mut client), b"ping");

    match events.recv_timeout(RECV_TIMEOUT).unwrap() {
        ListenerEvent::Message(body) => assert_eq!(body, b"ping"),
        other => panic!("unexpected event: {:?}", other),
    }
}

#[test]
fn a_message_spanning_many_pool_segments_arrives_intact() {
    let mut config = AcceptorConfig::default();
    config.incoming_pool.buffer_size = 512;
    config.outgoing_pool.buffer_size = 512;
    let (listener, _events) = TestListener::new(true);
    let (_acceptor, addr) = start_acceptor(config, listener);

    let body: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    let mut client = connect(addr);
    send_frame(&mut client, &body);
    assert_eq!(read_frame(&mut client), body);
}

#[test]
fn a_frame_dribbled_one_byte_at_a_time_still_decodes() {
    let (listener, events) = TestListener::new(false);
    let (_acceptor, addr) = start_acceptor(AcceptorConfig::default(), listener);

    let body: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
    let frame = frame_message(&body);

    let mut client = connect(addr);
    for byte in frame.iter() {
        client.write_all(&[*byte]).unwrap();
        client.flush().unwrap();
        std::thread::sleep(Duration::from_millis(1));
    }

    match events.recv_timeout(RECV_TIMEOUT).unwrap() {
        ListenerEvent::Message(received) => assert_eq!(received, body),
        other => panic!("unexpected event: {:?}", other),
    }
}

#[test]
fn several_messages_in_one_write_are_all_dispatched() {
    let (listener, events) = TestListener::new(false);
    let (_acceptor, addr) = start_acceptor(AcceptorConfig::default(), listener);

    let bodies: Vec<Vec<u8>> = vec![
        b"first".to_vec(),
        vec![7u8; 5_000], // larger than one pool segment
        b"third".to_vec(),
    ];
    let mut batch = Vec::new();
    for body in &bodies {
        batch.extend_from_slice(&frame_message(body));
    }

    let mut client = connect(addr);
    client.write_all(&batch).unwrap();

    for expected in &bodies {
        match events.recv_timeout(RECV_TIMEOUT).unwrap() {
            ListenerEvent::Message(received) => assert_eq!(&received, expected),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}

#[test]
fn a_malformed_length_prefix_closes_the_connection_with_an_error() {
    let (listener, events) = TestListener::new(false);
    let (_acceptor, addr) = start_acceptor(AcceptorConfig::default(), listener);

    let mut client = connect(addr);
    // a negative packed-int length: sign bit set in the first byte
    client.write_all(&[0x41]).unwrap();

    match events.recv_timeout(RECV_TIMEOUT).unwrap() {
        ListenerEvent::Error(_) => {}
        other => panic!("unexpected event: {:?}", other),
    }
}

#[test]
fn a_message_over_the_size_limit_closes_the_connection() {
    let mut config = AcceptorConfig::default();
    config.network.max_incoming_message_size = 1_024;
    let (listener, events) = TestListener::new(false);
    let (_acceptor, addr) = start_acceptor(config, listener);

    let mut client = connect(addr);
    send_frame(&mut client, &vec![0u8; 2_048]);

    match events.recv_timeout(RECV_TIMEOUT).unwrap() {
        ListenerEvent::Error(_) => {}
        other => panic!("unexpected event: {:?}", other),
    }
}
