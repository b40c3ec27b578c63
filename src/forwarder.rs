//! The forwarder/proxy relay logic (§4.7), factored out of `dbbridge` so it
//! can be driven directly from tests as well as the CLI binary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::address::Endpoint;
use crate::connect::connect_with_timeout;
use crate::listener::Accepted;
use crate::message::Message;
use crate::port::MessagingPort;

/// Delay between upstream connect attempts while opening the initial
/// connection for a new client (§4.7 step 1).
const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Forwards every accepted client connection to a single fixed upstream
/// destination, one dedicated thread per client (§4.7, §5).
#[derive(Clone)]
pub struct Forwarder {
    upstream: Endpoint,
    timeout_ms: u64,
    shutting_down: Arc<AtomicBool>,
}

impl Forwarder {
    pub fn new(upstream: Endpoint, timeout_ms: u64) -> Self {
        Forwarder {
            upstream,
            timeout_ms,
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Signals every in-progress and future reconnect retry to give up
    /// immediately instead of sleeping and trying again.
    pub fn request_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Opens a `MessagingPort` to the upstream, retrying every 500ms until
    /// success or `request_shutdown` is observed (§4.7 step 1).
    fn connect_upstream(&self) -> Option<MessagingPort> {
        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                return None;
            }
            match connect_with_timeout(&self.upstream, self.timeout_ms) {
                Ok(socket_endpoint) => {
                    return Some(MessagingPort::from_endpoint(socket_endpoint, self.upstream.port()));
                }
                Err(e) => {
                    warn!("connect to upstream {} failed, retrying in 500ms: {e}", self.upstream);
                    thread::sleep(RECONNECT_DELAY);
                }
            }
        }
    }

    /// Relays frames between `client` and a freshly opened upstream port
    /// until either side fails, then tears both down (§4.7 step 2). A
    /// mid-session upstream failure ends the session rather than
    /// reconnecting — only the initial open retries, per §4.7.
    pub fn relay(&self, mut client: MessagingPort) {
        let mut upstream = match self.connect_upstream() {
            Some(u) => u,
            None => {
                client.shutdown();
                return;
            }
        };

        let mut request = Message::default();
        let mut response = Message::default();

        loop {
            if !client.recv(&mut request) {
                info!("client {} disconnected", client.remote());
                client.shutdown();
                return;
            }

            let old_id = request.id();

            let ok = if request.operation().is_some_and(|op| op.expects_response()) {
                upstream.call(&mut request, &mut response)
                    && client.reply(&request, &mut response, Some(old_id)).is_ok()
            } else {
                upstream.say(&mut request, old_id).is_ok()
            };

            if !ok {
                warn!(
                    "forwarding failed between client {} and upstream {}",
                    client.remote(),
                    upstream.remote()
                );
                upstream.shutdown();
                client.shutdown();
                return;
            }
        }
    }
}

impl Accepted for Forwarder {
    fn accepted(&self, client: MessagingPort) {
        let forwarder = self.clone();
        thread::spawn(move || forwarder.relay(client));
    }
}
