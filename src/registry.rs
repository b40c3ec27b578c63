//! Process-wide registries used for shutdown (§3, §5, §9): the set of live
//! `MessagingPort` instances and the set of listening sockets.
//!
//! Both are created lazily with `OnceLock`, which gives them `'static`
//! storage that outlives ordinary drop order — the same reason the original
//! `new`s its `Ports` set onto the heap and never frees it.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// A handle a port registers so that `PortRegistry::close_all` can interrupt
/// its blocking I/O from another thread without needing a lock the I/O path
/// itself would have to contend for.
#[derive(Debug)]
pub struct ShutdownHandle {
    fd: RawFd,
    closed: AtomicBool,
}

impl ShutdownHandle {
    pub fn new(fd: RawFd) -> Arc<Self> {
        Arc::new(ShutdownHandle {
            fd,
            closed: AtomicBool::new(false),
        })
    }

    /// Idempotent: a second call observes `closed` already set and is a no-op.
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            unsafe {
                libc::shutdown(self.fd, libc::SHUT_RDWR);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct PortRegistry {
    ports: Mutex<HashMap<u64, Arc<ShutdownHandle>>>,
}

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

impl PortRegistry {
    pub fn next_id() -> u64 {
        NEXT_PORT_ID.fetch_add(1, Ordering::SeqCst)
    }

    pub fn insert(&self, id: u64, handle: Arc<ShutdownHandle>) {
        self.ports.lock().unwrap().insert(id, handle);
    }

    pub fn erase(&self, id: u64) {
        self.ports.lock().unwrap().remove(&id);
    }

    /// Shuts down every currently-registered port. Mutually exclusive with
    /// `insert`/`erase` under the same mutex (§5).
    pub fn close_all(&self) {
        for handle in self.ports.lock().unwrap().values() {
            handle.shutdown();
        }
    }

    pub fn len(&self) -> usize {
        self.ports.lock().unwrap().len()
    }
}

static PORT_REGISTRY: OnceLock<PortRegistry> = OnceLock::new();

pub fn ports() -> &'static PortRegistry {
    PORT_REGISTRY.get_or_init(PortRegistry::default)
}

/// The set of fds a `Listener` has bound and is listening on, closed in bulk
/// on shutdown (the original's `ListeningSockets`).
#[derive(Default)]
pub struct ListeningSockets {
    fds: Mutex<Vec<RawFd>>,
}

impl ListeningSockets {
    pub fn add(&self, fd: RawFd) {
        self.fds.lock().unwrap().push(fd);
    }

    pub fn close_all(&self) {
        let mut fds = self.fds.lock().unwrap();
        for fd in fds.drain(..) {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

static LISTENING_SOCKETS: OnceLock<ListeningSockets> = OnceLock::new();

pub fn listening_sockets() -> &'static ListeningSockets {
    LISTENING_SOCKETS.get_or_init(ListeningSockets::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_handle_is_idempotent() {
        // fd -1 is never a valid descriptor; `shutdown(2)` on it just fails,
        // which is exactly the "double-close doesn't reach the OS usefully"
        // case this test wants without needing a live socket.
        let handle = ShutdownHandle::new(-1);
        assert!(!handle.is_closed());
        handle.shutdown();
        assert!(handle.is_closed());
        handle.shutdown();
        assert!(handle.is_closed());
    }

    #[test]
    fn registry_insert_erase_close_all_are_mutually_exclusive() {
        let registry = PortRegistry::default();
        let a = ShutdownHandle::new(-1);
        let b = ShutdownHandle::new(-1);
        let id_a = PortRegistry::next_id();
        let id_b = PortRegistry::next_id();

        registry.insert(id_a, a.clone());
        registry.insert(id_b, b.clone());
        assert_eq!(registry.len(), 2);

        registry.erase(id_a);
        assert_eq!(registry.len(), 1);

        registry.close_all();
        assert!(b.is_closed());
    }
}
