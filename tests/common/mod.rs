//! Shared test scaffolding: a connected pair of `MessagingPort`s over a real
//! loopback TCP socket, since `SocketEndpoint` needs a live fd and there's no
//! mock transport in the crate (the protocol layer is exercised end-to-end
//! instead of against a fake socket).

use std::net::{TcpListener, TcpStream};

use wireport::port::MessagingPort;
use wireport::socket::SocketEndpoint;

/// Binds an ephemeral loopback listener, connects to it, and wraps both ends
/// as `MessagingPort`s with the given per-port timeout (0 = infinite).
#[allow(dead_code)]
pub fn connected_pair(timeout_ms: u64) -> (MessagingPort, MessagingPort) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
    let addr = listener.local_addr().unwrap();

    let client_thread = std::thread::spawn(move || TcpStream::connect(addr).expect("connect"));

    let (server_stream, server_addr) = listener.accept().expect("accept");
    let client_stream = client_thread.join().unwrap();

    let server_sock = socket2::Socket::from(server_stream);
    let client_sock = socket2::Socket::from(client_stream);

    let mut server_ep = SocketEndpoint::new(server_sock, server_addr.to_string(), timeout_ms);
    let mut client_ep = SocketEndpoint::new(client_sock, addr.to_string(), timeout_ms);
    if timeout_ms > 0 {
        server_ep.set_timeout(timeout_ms).unwrap();
        client_ep.set_timeout(timeout_ms).unwrap();
    }

    let server_port = MessagingPort::from_endpoint(server_ep, server_addr.port());
    let client_port = MessagingPort::from_endpoint(client_ep, addr.port());
    (server_port, client_port)
}
