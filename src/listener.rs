//! The listener (§4.5): binds one or more endpoints and multiplexes `accept`
//! over all of them using readiness polling, handing each accepted socket to
//! a caller-supplied hook.
//!
//! Readiness multiplexing is `mio::Poll` registered directly against the
//! listening sockets themselves — the direct descendant of the original's
//! `select()` loop over the same set of fds, even though every per-connection
//! read/write elsewhere in this crate stays blocking (§5).

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::os::unix::net::UnixListener as StdUnixListener;

use log::{info, warn};
use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Socket, Type};

use crate::address::{self, Endpoint, Family, ResolveOptions};
use crate::error::Error;
use crate::port::MessagingPort;
use crate::registry;
use crate::socket::{disable_nagle, set_nosigpipe, SocketEndpoint};

/// Invoked once per accepted connection, already wrapped as a
/// [`MessagingPort`]. Implement this to react to new clients.
pub trait Accepted: Send + Sync {
    fn accepted(&self, port: MessagingPort);
}

/// Startup and per-connection-logging knobs for [`Listener`].
pub struct ListenerConfig {
    pub host_spec: String,
    pub port: u16,
    /// Log "connection accepted" at `info!` for each accept, unless `quiet`.
    pub log_connect: bool,
    pub quiet: bool,
    /// Applied to each accepted `MessagingPort`'s socket.
    pub timeout_ms: u64,
    pub resolve_options: ResolveOptions,
}

impl ListenerConfig {
    pub fn new(host_spec: impl Into<String>, port: u16) -> Self {
        ListenerConfig {
            host_spec: host_spec.into(),
            port,
            log_connect: true,
            quiet: false,
            timeout_ms: 0,
            resolve_options: ResolveOptions::default(),
        }
    }
}

/// One bound, listening socket of either family. mio 1.x dropped the 0.6-era
/// `Evented`/`mio_uds_windows` split this crate's teacher existed to paper
/// over on Windows; `mio::net` now ships both listener types directly, so a
/// single small enum stands in for what used to be a whole platform shim.
enum BoundSocket {
    Tcp(mio::net::TcpListener),
    Unix(mio::net::UnixListener),
}

impl mio::event::Source for BoundSocket {
    fn register(&mut self, registry: &mio::Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            BoundSocket::Tcp(l) => l.register(registry, token, interests),
            BoundSocket::Unix(l) => l.register(registry, token, interests),
        }
    }

    fn reregister(&mut self, registry: &mio::Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            BoundSocket::Tcp(l) => l.reregister(registry, token, interests),
            BoundSocket::Unix(l) => l.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        match self {
            BoundSocket::Tcp(l) => l.deregister(registry),
            BoundSocket::Unix(l) => l.deregister(registry),
        }
    }
}

impl AsRawFd for BoundSocket {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            BoundSocket::Tcp(l) => l.as_raw_fd(),
            BoundSocket::Unix(l) => l.as_raw_fd(),
        }
    }
}

struct AcceptedSocket {
    socket: Socket,
    remote: String,
    remote_port: u16,
    is_unix: bool,
}

impl BoundSocket {
    /// Accepts one pending connection and hands back a blocking
    /// `socket2::Socket`: mio's accepted streams are non-blocking, but
    /// `MessagingPort`'s I/O model is blocking-with-OS-timeout (§4.2), so we
    /// take the fd back out from under mio and flip it over immediately.
    fn accept(&self) -> io::Result<AcceptedSocket> {
        match self {
            BoundSocket::Tcp(l) => {
                let (stream, addr) = l.accept()?;
                let fd = stream.into_raw_fd();
                let socket = unsafe { Socket::from_raw_fd(fd) };
                socket.set_nonblocking(false)?;
                Ok(AcceptedSocket {
                    socket,
                    remote: addr.to_string(),
                    remote_port: addr.port(),
                    is_unix: false,
                })
            }
            BoundSocket::Unix(l) => {
                let (stream, addr) = l.accept()?;
                let fd = stream.into_raw_fd();
                let socket = unsafe { Socket::from_raw_fd(fd) };
                socket.set_nonblocking(false)?;
                let remote = addr
                    .as_pathname()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "<unix>".to_string());
                Ok(AcceptedSocket {
                    socket,
                    remote,
                    remote_port: 0,
                    is_unix: true,
                })
            }
        }
    }
}

fn fail(endpoint: &Endpoint) -> impl Fn(io::Error) -> Error + '_ {
    move |source| Error::ListenFailure {
        addr: endpoint.to_string(),
        source,
    }
}

/// Binds and listens on a single endpoint, applying the pre-bind/post-bind
/// socket options described in §4.5 and §6.
fn bind_listen(endpoint: &Endpoint) -> Result<BoundSocket, Error> {
    match endpoint.family() {
        Family::Unix => {
            let path = endpoint.unix_path().expect("unix endpoint always carries a path");
            // A stale socket file from a previous crashed run blocks bind();
            // removing it unconditionally mirrors the original's unlink-before-bind.
            let _ = std::fs::remove_file(path);

            let std_listener = StdUnixListener::bind(path).map_err(fail(endpoint))?;
            std_listener.set_nonblocking(true).map_err(fail(endpoint))?;
            Ok(BoundSocket::Unix(mio::net::UnixListener::from_std(std_listener)))
        }
        Family::Ipv4 | Family::Ipv6 => {
            let domain = if endpoint.family() == Family::Ipv6 {
                Domain::IPV6
            } else {
                Domain::IPV4
            };
            let socket = Socket::new(domain, Type::STREAM, None).map_err(fail(endpoint))?;
            socket.set_reuse_address(true).map_err(fail(endpoint))?;
            if endpoint.family() == Family::Ipv6 {
                // Keep the IPv6 wildcard bind from also claiming the IPv4
                // wildcard so the two can coexist as separate endpoints (§4.1).
                socket.set_only_v6(true).map_err(fail(endpoint))?;
            }

            let addr = endpoint
                .socket_addr()
                .ok_or_else(|| Error::AddressParse(endpoint.to_string()))?;
            socket.bind(&addr.into()).map_err(fail(endpoint))?;
            socket.listen(128).map_err(fail(endpoint))?;
            socket.set_nonblocking(true).map_err(fail(endpoint))?;

            let std_listener: std::net::TcpListener = socket.into();
            Ok(BoundSocket::Tcp(mio::net::TcpListener::from_std(std_listener)))
        }
    }
}

/// Every endpoint bound and registered by [`Listener::bind`], ready for
/// [`Listener::run`]. Split out from `init_and_listen` so a caller — a test,
/// typically — can learn the OS-assigned port of an ephemeral (`:0`) bind
/// before the accept loop starts blocking.
pub struct BoundListener {
    poll: Poll,
    sockets: Vec<BoundSocket>,
    local_ports: Vec<Option<u16>>,
}

impl BoundListener {
    /// The local port of the first TCP endpoint bound, if any. `None` when
    /// every resolved endpoint was Unix-domain.
    pub fn local_tcp_port(&self) -> Option<u16> {
        self.local_ports.iter().copied().flatten().next()
    }
}

/// Binds every endpoint `resolve()` produces for the configured host spec and
/// port, and runs the accept loop until a fatal accept error is observed
/// (§4.5). Intended to run on its own thread; `init_and_listen` does not
/// return on the happy path.
pub struct Listener<H: Accepted> {
    config: ListenerConfig,
    handler: H,
}

impl<H: Accepted> Listener<H> {
    pub fn new(config: ListenerConfig, handler: H) -> Self {
        Listener { config, handler }
    }

    /// Resolves the configured host spec/port and binds+listens on every
    /// resulting endpoint, registering each with a fresh `Poll` (§4.5,
    /// first paragraph).
    pub fn bind(&self) -> Result<BoundListener, Error> {
        let endpoints = address::resolve(&self.config.host_spec, self.config.port, self.config.resolve_options);

        let poll = Poll::new().map_err(|source| Error::ListenFailure {
            addr: self.config.host_spec.clone(),
            source,
        })?;

        let mut sockets = Vec::with_capacity(endpoints.len());
        let mut local_ports = Vec::with_capacity(endpoints.len());
        for (i, ep) in endpoints.iter().enumerate() {
            let mut bound = bind_listen(ep)?;
            poll.registry()
                .register(&mut bound, Token(i), Interest::READABLE)
                .map_err(|source| Error::ListenFailure {
                    addr: ep.to_string(),
                    source,
                })?;
            registry::listening_sockets().add(bound.as_raw_fd());
            info!("waiting for connections on {ep}");

            local_ports.push(match &bound {
                BoundSocket::Tcp(l) => l.local_addr().ok().map(|a| a.port()),
                BoundSocket::Unix(_) => None,
            });
            sockets.push(bound);
        }

        Ok(BoundListener {
            poll,
            sockets,
            local_ports,
        })
    }

    /// Runs the accept loop over an already-[`bind`](Self::bind)-ed set of
    /// sockets until a fatal accept error occurs (§4.5).
    pub fn run(&self, mut bound: BoundListener) -> Result<(), Error> {
        let mut events = Events::with_capacity(128);
        let mut conn_number: u64 = 0;

        'accept: loop {
            if let Err(e) = bound.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!("select() failure in accept loop: {e}");
                return Err(Error::ListenFailure {
                    addr: self.config.host_spec.clone(),
                    source: e,
                });
            }

            for event in events.iter() {
                let idx = event.token().0;
                // mio is edge-triggered: drain every pending connection on
                // this listener before going back to poll(), or a burst of
                // simultaneous connects could leave some unaccepted.
                loop {
                    match bound.sockets[idx].accept() {
                        Ok(accepted) => {
                            if !accepted.is_unix {
                                disable_nagle(&accepted.socket);
                            }
                            set_nosigpipe(&accepted.socket);
                            conn_number += 1;
                            if self.config.log_connect && !self.config.quiet {
                                info!("connection accepted from {} #{conn_number}", accepted.remote);
                            }

                            let mut endpoint =
                                SocketEndpoint::new(accepted.socket, accepted.remote, self.config.timeout_ms);
                            if self.config.timeout_ms > 0 {
                                let _ = endpoint.set_timeout(self.config.timeout_ms);
                            }
                            let port = MessagingPort::from_endpoint(endpoint, accepted.remote_port);
                            self.handler.accepted(port);
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            let errno = e.raw_os_error();
                            if errno == Some(libc::ECONNABORTED) || errno == Some(libc::EBADF) {
                                warn!("listener on port {} aborted: {e}", self.config.port);
                                break 'accept;
                            }
                            warn!("accept() failed: {e}");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Convenience: `bind` followed immediately by `run`. What the
    /// `dbbridge` binary calls; tests that need the bound port first call
    /// `bind`/`run` separately.
    pub fn init_and_listen(&self) -> Result<(), Error> {
        let bound = self.bind()?;
        self.run(bound)
    }
}
