//! End-to-end coverage of `MessagingPort::recv`'s probe handling and frame
//! validation, and of `call`/`say`/`reply` id correlation (§8 scenarios 1-4).

mod common;

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};

use wireport::message::{Message, OpCode};

/// Scenario 1: a request/response pair correlated by `call`.
#[test]
fn roundtrip_call_matches_response_to_request_id() {
    let (mut server, mut client) = common::connected_pair(0);

    let server_thread = std::thread::spawn(move || {
        let mut request = Message::default();
        assert!(server.recv(&mut request));
        assert_eq!(request.payload(), b"PING");

        let mut response = Message::new(OpCode::Reply, b"PONG");
        server.reply(&request, &mut response, None).unwrap();
    });

    let mut request = Message::new(OpCode::Query, b"PING");
    request.set_id(42);
    let mut response = Message::default();
    assert!(client.call(&mut request, &mut response));
    assert_eq!(response.payload(), b"PONG");
    assert_eq!(response.response_to(), request.id());

    server_thread.join().unwrap();
}

/// Scenario 2: an old client probing byte order with a raw `-1` length gets
/// back the 4-byte endian sentinel, then the connection proceeds normally.
#[test]
fn endian_probe_gets_sentinel_then_real_frame_is_still_read() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server_thread = std::thread::spawn(move || {
        let (stream, peer) = listener.accept().unwrap();
        let sock = socket2::Socket::from(stream);
        let endpoint = wireport::socket::SocketEndpoint::new(sock, peer.to_string(), 0);
        let mut port = wireport::port::MessagingPort::from_endpoint(endpoint, peer.port());

        let mut out = Message::default();
        let ok = port.recv(&mut out);
        (ok, out)
    });

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(&(-1i32).to_le_bytes()).unwrap();

    let mut sentinel = [0u8; 4];
    client.read_exact(&mut sentinel).unwrap();
    assert_eq!(sentinel, 0x1020_3040u32.to_ne_bytes());

    let mut real_frame = Message::new(OpCode::Insert, b"doc");
    real_frame.set_id(7);
    client.write_all(real_frame.as_bytes()).unwrap();

    let (ok, received) = server_thread.join().unwrap();
    assert!(ok);
    assert_eq!(received.payload(), b"doc");
    assert_eq!(received.id(), 7);
}

/// Scenario 3: a peer speaking HTTP on the binary port gets a diagnostic
/// response and the connection is closed; `recv` reports failure.
#[test]
fn http_probe_gets_diagnostic_response_and_recv_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server_thread = std::thread::spawn(move || {
        let (stream, peer) = listener.accept().unwrap();
        let sock = socket2::Socket::from(stream);
        let endpoint = wireport::socket::SocketEndpoint::new(sock, peer.to_string(), 0);
        let mut port = wireport::port::MessagingPort::from_endpoint(endpoint, peer.port());
        let mut out = Message::default();
        port.recv(&mut out)
    });

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"GET / HTTP/1.0\r\n\r\n").unwrap();

    let mut response = String::new();
    client.read_to_string(&mut response).unwrap();
    assert!(response.starts_with("HTTP/1.0 200 OK"));
    assert!(response.contains("native driver port"));

    let recv_ok = server_thread.join().unwrap();
    assert!(!recv_ok);
}

/// Scenario 4: an oversize `len` is rejected before any payload is read.
#[test]
fn oversize_length_is_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server_thread = std::thread::spawn(move || {
        let (stream, peer) = listener.accept().unwrap();
        let sock = socket2::Socket::from(stream);
        let endpoint = wireport::socket::SocketEndpoint::new(sock, peer.to_string(), 0);
        let mut port = wireport::port::MessagingPort::from_endpoint(endpoint, peer.port());
        let mut out = Message::default();
        (port.recv(&mut out), out)
    });

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(&16_000_001i32.to_le_bytes()).unwrap();

    let (ok, out) = server_thread.join().unwrap();
    assert!(!ok);
    assert!(out.is_empty());
}

/// A `len` shorter than the 16-byte header (§3: "`len ≥ 16` ... on inbound
/// frames; violation terminates the connection") must be rejected before it
/// ever reaches a header accessor — otherwise `id()`/`response_to()`/
/// `operation_raw()` would slice past the end of a too-short buffer.
#[test]
fn undersize_length_below_header_is_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server_thread = std::thread::spawn(move || {
        let (stream, peer) = listener.accept().unwrap();
        let sock = socket2::Socket::from(stream);
        let endpoint = wireport::socket::SocketEndpoint::new(sock, peer.to_string(), 0);
        let mut port = wireport::port::MessagingPort::from_endpoint(endpoint, peer.port());
        let mut out = Message::default();
        (port.recv(&mut out), out)
    });

    let mut client = TcpStream::connect(addr).unwrap();
    // 8 is a plausible-looking "length" (nonzero, small) that is still
    // shorter than the fixed header and must not be treated as valid.
    client.write_all(&8i32.to_le_bytes()).unwrap();

    let (ok, out) = server_thread.join().unwrap();
    assert!(!ok);
    assert!(out.is_empty());
}

/// `say` without a live piggyback buffer sends directly; the peer sees a
/// frame whose `responseTo` is whatever the sender passed, independent of
/// `call`.
#[test]
fn say_sets_response_to_without_waiting_for_a_reply() {
    let (mut server, mut client) = common::connected_pair(0);

    let server_thread = std::thread::spawn(move || {
        let mut out = Message::default();
        assert!(server.recv(&mut out));
        out
    });

    let mut notice = Message::new(OpCode::KillCursors, b"");
    client.say(&mut notice, 99).unwrap();

    let received = server_thread.join().unwrap();
    assert_eq!(received.response_to(), 99);
}
