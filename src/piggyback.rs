//! The piggyback buffer (§4.4): a per-port batching region that coalesces
//! small outbound frames into a single socket write.

use crate::error::Error;
use crate::socket::SocketEndpoint;

/// Single-packet heuristic: frames are assumed to fit a typical MTU below this.
pub const CAPACITY: usize = 1300;

#[derive(Debug, Default)]
pub struct PiggybackBuffer {
    buf: Vec<u8>,
}

impl PiggybackBuffer {
    pub fn new() -> Self {
        PiggybackBuffer {
            buf: Vec::with_capacity(CAPACITY),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Appends `frame` to the buffer, flushing first if it wouldn't fit.
    /// `frame.len() > CAPACITY` is a programming error (the caller must check
    /// and fall back to a direct `say` instead, per §4.3/§4.4).
    pub fn append(&mut self, endpoint: &mut SocketEndpoint, frame: &[u8]) -> Result<(), Error> {
        assert!(
            frame.len() <= CAPACITY,
            "piggyback frame of {} bytes exceeds the {} byte capacity",
            frame.len(),
            CAPACITY
        );

        if self.buf.len() + frame.len() > CAPACITY {
            self.flush(endpoint)?;
        }
        self.buf.extend_from_slice(frame);
        Ok(())
    }

    /// Writes the whole accumulated region as a single send. No-op if empty.
    pub fn flush(&mut self, endpoint: &mut SocketEndpoint) -> Result<(), Error> {
        if self.buf.is_empty() {
            return Ok(());
        }
        endpoint.send(&self.buf, "flush")?;
        self.buf.clear();
        Ok(())
    }
}
