//! The one error kind that crosses the transport/framing boundary (`socket-failure`,
//! see §7 of the spec) plus the handful of configuration and validation failures
//! that are recoverable at the public API.

use std::io;
use std::time::Duration;

/// Errors surfaced by [`crate::port::MessagingPort`], [`crate::listener::Listener`]
/// and [`crate::connect::connect_with_timeout`].
///
/// Programming errors (mismatched `responseTo` in `call`, a piggyback frame over
/// 1300 bytes, sending a message with no payload) are `panic!`/`assert!` at the
/// call site instead of a variant here — they indicate a bug in the calling code,
/// not a runtime condition a caller can sensibly recover from.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A send or recv on a socket endpoint failed and the connection must be
    /// considered dead.
    #[error("socket failure talking to {peer}: {source}")]
    SocketFailure {
        peer: String,
        #[source]
        source: io::Error,
    },

    /// The 5000ms connect deadline (§4.6) elapsed before the OS `connect()`
    /// completed.
    #[error("connect to {peer} timed out after {elapsed:?}")]
    ConnectTimeout { peer: String, elapsed: Duration },

    /// Listener bind/listen failed during `init_and_listen` (§4.5); initialization
    /// aborts.
    #[error("listen failed for {addr}: {source}")]
    ListenFailure {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// `set_client_id` was given a value whose top 16 bits are zero.
    #[error("invalid client id 0x{id:08x}: top 16 bits must be nonzero")]
    InvalidClientId { id: i32 },

    /// A host specification could not be parsed into a bindable/connectable
    /// address.
    #[error("invalid address '{0}'")]
    AddressParse(String),
}

pub type Result<T> = std::result::Result<T, Error>;
