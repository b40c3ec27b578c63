//! Exercises `Listener::bind`/`run` end to end: a real client connects to an
//! ephemeral TCP port and the `Accepted` hook observes a working
//! `MessagingPort` (§4.5).

use std::net::TcpStream;
use std::sync::mpsc;

use wireport::listener::{Accepted, Listener, ListenerConfig};
use wireport::message::{Message, OpCode};
use wireport::port::MessagingPort;

struct Echo(mpsc::Sender<()>);

impl Accepted for Echo {
    fn accepted(&self, mut port: MessagingPort) {
        let mut msg = Message::default();
        if port.recv(&mut msg) {
            let mut response = Message::new(OpCode::Reply, b"ok");
            let _ = port.reply(&msg, &mut response, None);
        }
        let _ = self.0.send(());
    }
}

#[test]
fn accepted_hook_runs_for_a_real_connection() {
    let (tx, rx) = mpsc::channel();
    let mut config = ListenerConfig::new("127.0.0.1", 0);
    // Keep this test to the TCP endpoint only: a nominal port of 0 would
    // otherwise also bind a shared `/tmp/mongodb-0.sock`, which collides
    // across parallel test runs.
    config.resolve_options.unix_sockets_enabled = false;
    let listener = Listener::new(config, Echo(tx));

    let bound = listener.bind().expect("bind");
    let port = bound.local_tcp_port().expect("ephemeral tcp port assigned");

    let run_thread = std::thread::spawn(move || {
        // `run` blocks forever servicing the accept loop; the test only
        // needs one iteration, so the thread is left detached rather than
        // joined.
        let _ = listener.run(bound);
    });

    let mut client = TcpStream::connect(("127.0.0.1", port)).expect("connect to bound listener");
    let mut request = Message::new(OpCode::Query, b"ping");
    request.set_id(1);
    std::io::Write::write_all(&mut client, request.as_bytes()).unwrap();

    rx.recv_timeout(std::time::Duration::from_secs(5))
        .expect("accepted hook ran");

    drop(run_thread); // detach; process exit reaps the blocked accept-loop thread
}
