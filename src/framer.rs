//! Packs/unpacks framed messages from the outer HTTP body byte stream
//! (spec.md §4.2).
//!
//! The Framer owns the outbound send queue (mirrored into the
//! [`crate::replay::ReplayBuffer`] at enqueue time) and the inbound partial-
//! read buffer. It has no knowledge of HTTP chunking or TLS — that's
//! [`crate::transport::Transport`]'s job; the Framer only ever sees/produces
//! the flat framed-message byte stream.

use bytes::BytesMut;

use crate::error::TunnelError;
use crate::message::FramedMessage;
use crate::replay::ReplayBuffer;

/// Serializes outbound messages and parses the inbound byte stream back into
/// [`FramedMessage`] values.
#[derive(Debug)]
pub struct Framer {
    send_seq: u32,
    /// Bytes not yet handed to the Transport for writing.
    send_buf: BytesMut,
    /// Bytes read from the Transport but not yet forming a complete message.
    recv_buf: BytesMut,
}

impl Framer {
    /// Create an empty framer. `send_seq` starts at 0 so the first enqueued
    /// message gets sequence 1, per spec.md §3.
    #[must_use]
    pub fn new() -> Self {
        Self {
            send_seq: 0,
            send_buf: BytesMut::new(),
            recv_buf: BytesMut::new(),
        }
    }

    /// Assign the next sequence number, append the message to the send
    /// buffer and to `replay` for possible retransmission, and return the
    /// assigned sequence.
    pub fn enqueue(&mut self, mut msg: FramedMessage, replay: &mut ReplayBuffer) -> u32 {
        self.send_seq += 1;
        msg.sequence = self.send_seq;
        msg.encode(&mut self.send_buf);
        replay.push(msg);
        self.send_seq
    }

    /// Re-encode an already-sequenced message (used by reconnect replay,
    /// where the sequence number must be preserved rather than reassigned).
    pub fn enqueue_raw(&mut self, msg: &FramedMessage) {
        msg.encode(&mut self.send_buf);
    }

    /// True if there are buffered bytes waiting to be drained to the Transport.
    #[must_use]
    pub fn has_pending_output(&self) -> bool {
        !self.send_buf.is_empty()
    }

    /// Take up to `budget` bytes of buffered outbound frame data, removing
    /// them from the internal buffer. The caller (Transport) is responsible
    /// for actually writing these bytes; partial drains are fine because
    /// byte-level chunking doesn't care about message boundaries.
    pub fn drain_to(&mut self, budget: usize) -> BytesMut {
        let n = budget.min(self.send_buf.len());
        self.send_buf.split_to(n)
    }

    /// Append newly read bytes and parse out all now-complete messages, in
    /// arrival order. Partial messages remain buffered for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<FramedMessage>, TunnelError> {
        self.recv_buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(msg) = FramedMessage::try_decode(&mut self.recv_buf)? {
            out.push(msg);
        }
        Ok(out)
    }

    /// The last sequence number assigned to an outbound message (0 if none
    /// yet sent). Used when composing the INIT-with-secret reconnect message.
    #[must_use]
    pub fn last_sent_seq(&self) -> u32 {
        self.send_seq
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}
