//! The wire frame: a fixed 16-byte header followed by opaque payload bytes
//! (§3, §6).

use bytes::BytesMut;

/// Size of the fixed header in bytes: `len`, `id`, `responseTo`, `operation`.
pub const HEADER_LEN: usize = 16;

/// Largest `len` this implementation will accept on an inbound frame.
pub const MAX_MESSAGE_LEN: i32 = 16_000_000;

/// The sentinel an old client writes in place of `len` to probe byte order.
pub const ENDIAN_PROBE_SENTINEL: i32 = -1;

/// What we write back in response to an endian probe, 4 raw bytes, native order.
pub const ENDIAN_PROBE_RESPONSE: u32 = 0x1020_3040;

/// `len` as read when the peer is actually speaking HTTP (`"GET "`). The
/// distilled source compares the raw 4 bytes to this constant without any
/// explicit byte-swap; this implementation keeps that exact, endian-dependent
/// comparison rather than silently "fixing" it — see DESIGN.md.
pub const HTTP_PROBE_SENTINEL: i32 = 542_393_671;

/// Operation codes carried in the header's `operation` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum OpCode {
    Reply = 1,
    Msg = 1000,
    Update = 2001,
    Insert = 2002,
    Query = 2004,
    GetMore = 2005,
    Delete = 2006,
    KillCursors = 2007,
}

impl OpCode {
    pub fn from_i32(v: i32) -> Option<OpCode> {
        Some(match v {
            1 => OpCode::Reply,
            1000 => OpCode::Msg,
            2001 => OpCode::Update,
            2002 => OpCode::Insert,
            2004 => OpCode::Query,
            2005 => OpCode::GetMore,
            2006 => OpCode::Delete,
            2007 => OpCode::KillCursors,
            _ => return None,
        })
    }

    /// Operations the forwarder treats as expecting a reply (§4.7): these go
    /// through `call`/`reply` instead of `say`.
    pub fn expects_response(self) -> bool {
        matches!(self, OpCode::Query | OpCode::Msg | OpCode::GetMore)
    }
}

/// An owned, length-prefixed frame. The backing buffer is rounded up to the
/// next 1024-byte multiple on receive (§4.3 step 4) to amortize reallocation
/// for a port that keeps receiving similarly sized frames; on construction for
/// sending, it's sized exactly.
#[derive(Debug, Clone, Default)]
pub struct Message {
    buf: BytesMut,
}

impl Message {
    /// Builds a frame ready to send: header plus `payload`.
    pub fn new(operation: OpCode, payload: &[u8]) -> Self {
        let len = HEADER_LEN + payload.len();
        let mut buf = BytesMut::with_capacity(len);
        buf.resize(len, 0);
        let mut m = Message { buf };
        m.set_len(len as i32);
        m.set_id(0);
        m.set_response_to(0);
        m.set_operation(operation as i32);
        m.buf[HEADER_LEN..].copy_from_slice(payload);
        m
    }

    /// Allocates a receive buffer for a frame of `len` bytes total, rounded up
    /// to the next 1024-byte multiple, per §4.3 step 4.
    pub(crate) fn with_capacity_for(len: i32) -> Message {
        let rounded = ((len as usize) + 1023) & !0x3FF;
        let mut buf = BytesMut::with_capacity(rounded);
        buf.resize(len as usize, 0);
        let mut m = Message { buf };
        m.set_len(len);
        m
    }

    /// Releases the payload and resets the frame to empty, matching
    /// `Message::reset()` in the original — used when a `recv` fails partway
    /// through and the caller must not observe a half-built frame.
    pub fn reset(&mut self) {
        self.buf = BytesMut::new();
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn len(&self) -> i32 {
        if self.buf.len() < 4 {
            return 0;
        }
        i32::from_le_bytes(self.buf[0..4].try_into().unwrap())
    }

    fn set_len(&mut self, len: i32) {
        self.buf[0..4].copy_from_slice(&len.to_le_bytes());
    }

    pub fn id(&self) -> i32 {
        i32::from_le_bytes(self.buf[4..8].try_into().unwrap())
    }

    pub fn set_id(&mut self, id: i32) {
        self.buf[4..8].copy_from_slice(&id.to_le_bytes());
    }

    pub fn response_to(&self) -> i32 {
        i32::from_le_bytes(self.buf[8..12].try_into().unwrap())
    }

    pub fn set_response_to(&mut self, response_to: i32) {
        self.buf[8..12].copy_from_slice(&response_to.to_le_bytes());
    }

    pub fn operation_raw(&self) -> i32 {
        i32::from_le_bytes(self.buf[12..16].try_into().unwrap())
    }

    pub fn set_operation(&mut self, operation: i32) {
        self.buf[12..16].copy_from_slice(&operation.to_le_bytes());
    }

    pub fn operation(&self) -> Option<OpCode> {
        OpCode::from_i32(self.operation_raw())
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[HEADER_LEN..]
    }

    /// The full frame including header, as written to the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..]
    }

    pub(crate) fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[HEADER_LEN..]
    }

    /// Everything after the `len` field: `id`, `responseTo`, `operation`, and
    /// the payload. `MessagingPort::recv` reads the rest of the frame
    /// directly into this slice (§4.3 step 5).
    pub(crate) fn tail_mut(&mut self) -> &mut [u8] {
        &mut self.buf[4..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrips_through_le_bytes() {
        let mut m = Message::new(OpCode::Query, b"PING");
        m.set_id(42);
        m.set_response_to(7);
        assert_eq!(m.id(), 42);
        assert_eq!(m.response_to(), 7);
        assert_eq!(m.operation(), Some(OpCode::Query));
        assert_eq!(m.len() as usize, HEADER_LEN + 4);
        assert_eq!(m.payload(), b"PING");
    }

    #[test]
    fn query_and_getmore_and_msg_expect_a_response() {
        assert!(OpCode::Query.expects_response());
        assert!(OpCode::GetMore.expects_response());
        assert!(OpCode::Msg.expects_response());
        assert!(!OpCode::Insert.expects_response());
        assert!(!OpCode::KillCursors.expects_response());
    }

    #[test]
    fn receive_buffer_rounds_up_to_1024_multiple() {
        let m = Message::with_capacity_for(2000);
        assert!(m.buf.capacity() >= 2048);
        assert_eq!(m.len(), 2000);
    }

    #[test]
    fn reset_empties_the_frame() {
        let mut m = Message::new(OpCode::Insert, b"doc");
        m.reset();
        assert!(m.is_empty());
    }
}
