//! `MessagingPort` (§4.3): message-level operations built on top of a
//! [`SocketEndpoint`] — `recv`, `say`, `call`, `reply`, `piggy_back`.

use log::{error, warn};

use crate::error::Error;
use crate::message::{
    Message, ENDIAN_PROBE_RESPONSE, ENDIAN_PROBE_SENTINEL, HEADER_LEN, HTTP_PROBE_SENTINEL,
    MAX_MESSAGE_LEN,
};
use crate::piggyback::{self, PiggybackBuffer};
use crate::registry::{self, ShutdownHandle};
use crate::socket::SocketEndpoint;

use std::sync::Arc;

/// The fixed instructional body sent back to a client speaking HTTP on the
/// binary protocol port (§6).
const HTTP_PROBE_BODY: &str = "You are trying to access MongoDB on the native driver port. For http diagnostic access, add 1000 to the port number\n";

/// A maximum number of endian-probe restarts `recv` will tolerate before
/// treating further `-1` lengths as a malformed frame. The original's `goto
/// again` has no such bound; we cap it so a hostile or confused peer can't
/// spin the receive loop forever (§9 design note).
const MAX_ENDIAN_PROBES: u32 = 1;

/// A connected, framed endpoint — not to be confused with a TCP port number.
/// Registered in the process-wide [`registry::ports`] set on construction so
/// that shutdown can reach it from another thread.
pub struct MessagingPort {
    id: u64,
    endpoint: SocketEndpoint,
    remote_port: u16,
    shutdown_handle: Arc<ShutdownHandle>,
    piggyback: Option<PiggybackBuffer>,
}

impl MessagingPort {
    /// Wraps an already-connected socket (either an accepted connection or
    /// one produced by [`crate::connect::connect_with_timeout`]) in a port
    /// and registers it.
    pub fn from_endpoint(endpoint: SocketEndpoint, remote_port: u16) -> Self {
        let id = registry::PortRegistry::next_id();
        let handle = ShutdownHandle::new(endpoint.raw_fd());
        registry::ports().insert(id, handle.clone());
        MessagingPort {
            id,
            endpoint,
            remote_port,
            shutdown_handle: handle,
            piggyback: None,
        }
    }

    pub fn remote(&self) -> &str {
        self.endpoint.remote()
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn set_timeout_ms(&mut self, timeout_ms: u64) -> std::io::Result<()> {
        self.endpoint.set_timeout(timeout_ms)
    }

    /// Closes the socket. Idempotent: a second call observes the shared
    /// handle already marked closed and does nothing further.
    pub fn shutdown(&self) {
        self.shutdown_handle.shutdown();
        self.endpoint.shutdown();
    }

    /// Receives the next frame into `out`. Handles the endian probe and HTTP
    /// probe transparently; returns `false` on any socket failure, oversize
    /// length, or HTTP probe (§4.3).
    pub fn recv(&mut self, out: &mut Message) -> bool {
        let mut probes = 0u32;
        loop {
            let mut len_buf = [0u8; 4];
            if self.endpoint.recv(&mut len_buf).is_err() {
                out.reset();
                return false;
            }
            let len = i32::from_le_bytes(len_buf);

            if len == ENDIAN_PROBE_SENTINEL {
                if probes >= MAX_ENDIAN_PROBES {
                    warn!("repeated endian probe from {}, giving up", self.endpoint.remote());
                    out.reset();
                    return false;
                }
                probes += 1;
                if self
                    .endpoint
                    .send(&ENDIAN_PROBE_RESPONSE.to_ne_bytes(), "endian")
                    .is_err()
                {
                    out.reset();
                    return false;
                }
                continue;
            }

            if len == HTTP_PROBE_SENTINEL {
                warn!(
                    "looks like {} is trying to access the database over http on the native driver port",
                    self.endpoint.remote()
                );
                let response = format!(
                    "HTTP/1.0 200 OK\r\nConnection: close\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
                    HTTP_PROBE_BODY.len(),
                    HTTP_PROBE_BODY
                );
                let _ = self.endpoint.send(response.as_bytes(), "http");
                self.endpoint.shutdown();
                out.reset();
                return false;
            }

            if len < HEADER_LEN as i32 || len > MAX_MESSAGE_LEN {
                warn!("bad recv() len: {len} from {}", self.endpoint.remote());
                out.reset();
                return false;
            }

            let mut msg = Message::with_capacity_for(len);
            if self.endpoint.recv(msg.tail_mut()).is_err() {
                out.reset();
                return false;
            }

            *out = msg;
            return true;
        }
    }

    /// Fire-and-forget send: assigns a fresh id, sets `responseTo`, and
    /// either coalesces into the piggyback buffer or sends directly (§4.3).
    pub fn say(&mut self, to_send: &mut Message, response_to: i32) -> Result<(), Error> {
        to_send.set_id(crate::idgen::next_message_id());
        to_send.set_response_to(response_to);

        if let Some(pb) = self.piggyback.as_mut() {
            if !pb.is_empty() {
                if pb.len() + to_send.as_bytes().len() > piggyback::CAPACITY {
                    pb.flush(&mut self.endpoint)?;
                } else {
                    pb.append(&mut self.endpoint, to_send.as_bytes())?;
                    pb.flush(&mut self.endpoint)?;
                    return Ok(());
                }
            }
        }

        self.endpoint.send(to_send.as_bytes(), "say")
    }

    /// Synchronous request/response: `say`s `request`, then `recv`s until a
    /// frame whose `responseTo` matches arrives. A mismatched `responseTo` on
    /// any intervening frame is a protocol error and panics (§7's
    /// "Programming errors" classification, kept as-is — see DESIGN.md).
    pub fn call(&mut self, request: &mut Message, response: &mut Message) -> bool {
        if self.say(request, 0).is_err() {
            return false;
        }
        let expected = request.id();

        loop {
            if !self.recv(response) {
                return false;
            }
            if response.response_to() == expected {
                return true;
            }

            error!(
                "MessagingPort::call() wrong id got:{} expect:{} op:{:?} response len:{} response id:{} farEnd:{}",
                response.response_to(),
                expected,
                request.operation(),
                response.len(),
                response.id(),
                self.endpoint.remote(),
            );
            panic!("MessagingPort::call() response responseTo does not match request id");
        }
    }

    /// Shorthand for `say(response, responseTo ?? received.id)`.
    pub fn reply(
        &mut self,
        received: &Message,
        response: &mut Message,
        response_to: Option<i32>,
    ) -> Result<(), Error> {
        let response_to = response_to.unwrap_or_else(|| received.id());
        self.say(response, response_to)
    }

    /// Deferred, coalesced send: frames over the piggyback capacity go
    /// straight through `say`; smaller ones are appended to the lazily
    /// created buffer and only reach the socket on a flush trigger (§4.3,
    /// §4.4).
    pub fn piggy_back(&mut self, to_send: &mut Message, response_to: i32) -> Result<(), Error> {
        if to_send.as_bytes().len() > piggyback::CAPACITY {
            return self.say(to_send, response_to);
        }

        to_send.set_id(crate::idgen::next_message_id());
        to_send.set_response_to(response_to);

        if self.piggyback.is_none() {
            self.piggyback = Some(PiggybackBuffer::new());
        }
        let pb = self.piggyback.as_mut().unwrap();
        pb.append(&mut self.endpoint, to_send.as_bytes())
    }
}

impl Drop for MessagingPort {
    fn drop(&mut self) {
        if let Some(pb) = self.piggyback.as_mut() {
            if let Err(e) = pb.flush(&mut self.endpoint) {
                warn!("piggyback flush on drop failed, discarding: {e}");
            }
        }
        self.shutdown();
        registry::ports().erase(self.id);
    }
}
