//! Connect with a bounded timeout (§4.6): the OS `connect()` has no portable
//! finite timeout, so a background thread races the blocking syscall against
//! a 5 second deadline.

use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use socket2::{Domain, SockAddr, Socket, Type};

use crate::address::{Endpoint, Family};
use crate::error::Error;
use crate::socket::{disable_nagle, set_nosigpipe, SocketEndpoint};

/// How long `connect_with_timeout` waits for the OS connect to complete
/// before giving up (§4.6).
pub const CONNECT_DEADLINE: Duration = Duration::from_millis(5000);

fn to_sockaddr(endpoint: &Endpoint) -> Result<SockAddr, Error> {
    match endpoint.family() {
        Family::Unix => {
            let path = endpoint
                .unix_path()
                .ok_or_else(|| Error::AddressParse(endpoint.to_string()))?;
            SockAddr::unix(path).map_err(|source| Error::SocketFailure {
                peer: endpoint.to_string(),
                source,
            })
        }
        Family::Ipv4 | Family::Ipv6 => {
            let addr = endpoint
                .socket_addr()
                .ok_or_else(|| Error::AddressParse(endpoint.to_string()))?;
            Ok(SockAddr::from(addr))
        }
    }
}

fn domain_for(endpoint: &Endpoint) -> Domain {
    match endpoint.family() {
        Family::Ipv4 => Domain::IPV4,
        Family::Ipv6 => Domain::IPV6,
        Family::Unix => Domain::UNIX,
    }
}

/// Connects to `endpoint`, applying `timeout_ms` (0 = infinite) to the
/// resulting socket's read/write timeouts once connected.
///
/// The background connect thread and this function share the *same* fd: if
/// the deadline elapses first we drop our `Socket` (closing the fd), which
/// unblocks the thread's in-flight `connect()` syscall, and then join the
/// thread before returning so its captured address never outlives it.
pub fn connect_with_timeout(endpoint: &Endpoint, timeout_ms: u64) -> Result<SocketEndpoint, Error> {
    let socket = Socket::new(domain_for(endpoint), Type::STREAM, None).map_err(|source| {
        Error::SocketFailure {
            peer: endpoint.to_string(),
            source,
        }
    })?;

    if timeout_ms > 0 {
        let dur = Some(Duration::from_millis(timeout_ms));
        let _ = socket.set_read_timeout(dur);
        let _ = socket.set_write_timeout(dur);
    }

    let sockaddr = to_sockaddr(endpoint)?;
    let fd = socket.as_raw_fd();

    let (tx, rx) = mpsc::channel::<Option<io::Error>>();
    let handle = thread::spawn(move || {
        let rc = unsafe { libc::connect(fd, sockaddr.as_ptr(), sockaddr.len()) };
        let result = if rc == 0 {
            None
        } else {
            Some(io::Error::last_os_error())
        };
        let _ = tx.send(result);
    });

    match rx.recv_timeout(CONNECT_DEADLINE) {
        Ok(None) => {
            let _ = handle.join();
            if endpoint.family() != Family::Unix {
                disable_nagle(&socket);
            }
            set_nosigpipe(&socket);
            Ok(SocketEndpoint::new(socket, endpoint.to_string(), timeout_ms))
        }
        Ok(Some(source)) => {
            let _ = handle.join();
            Err(Error::SocketFailure {
                peer: endpoint.to_string(),
                source,
            })
        }
        Err(mpsc::RecvTimeoutError::Timeout) | Err(mpsc::RecvTimeoutError::Disconnected) => {
            drop(socket);
            let _ = handle.join();
            Err(Error::ConnectTimeout {
                peer: endpoint.to_string(),
                elapsed: CONNECT_DEADLINE,
            })
        }
    }
}
