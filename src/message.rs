//! Wire message types and framing (spec.md §4.2 / §4.3).
//!
//! On-wire shape: `[u32 total_length_be][u8 type][u32 sequence_be][payload]`.
//! `total_length` counts everything after itself (type + sequence + payload).

use bytes::{Buf, BufMut, BytesMut};

use crate::error::TunnelError;

/// Fixed header size: type tag (1) + sequence number (4).
const HEADER_LEN: usize = 1 + 4;

/// Message type tags, exact wire values fixed by spec.md §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// client->peer: protocol version, connection id.
    Init = 0x01,
    /// peer->client: negotiated version, reconnect secret, heartbeat interval.
    InitReply = 0x02,
    /// client->peer: opaque authenticator blob.
    Authenticate = 0x03,
    /// peer->client: status (ok/reject), optional cause text.
    AuthReply = 0x04,
    /// peer->client: announce a listener (port, bind address, symbolic name).
    Listen = 0x05,
    /// peer->client: a previously announced listener should stop accepting.
    ListenClose = 0x06,
    /// either direction: open a channel (channel id, target host, target port).
    ChannelOpen = 0x07,
    /// either direction: reply to a channel open (channel id, status, cause).
    ChannelOpenReply = 0x08,
    /// either direction: channel payload bytes.
    ChannelData = 0x09,
    /// either direction: close a channel (channel id, reason code).
    ChannelClose = 0x0A,
    /// either direction: cumulative sequence acknowledged.
    Ack = 0x0B,
    /// either direction: heartbeat request carrying a nonce.
    EchoReq = 0x0C,
    /// either direction: heartbeat reply echoing the nonce.
    EchoReply = 0x0D,
    /// either direction: reason code, optional reconnect secret.
    Disconnect = 0x0E,
}

impl MessageType {
    /// Decode a wire tag byte, or `None` for an unrecognized value.
    #[must_use]
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0x01 => Self::Init,
            0x02 => Self::InitReply,
            0x03 => Self::Authenticate,
            0x04 => Self::AuthReply,
            0x05 => Self::Listen,
            0x06 => Self::ListenClose,
            0x07 => Self::ChannelOpen,
            0x08 => Self::ChannelOpenReply,
            0x09 => Self::ChannelData,
            0x0A => Self::ChannelClose,
            0x0B => Self::Ack,
            0x0C => Self::EchoReq,
            0x0D => Self::EchoReply,
            0x0E => Self::Disconnect,
            _ => return None,
        })
    }
}

/// A single framed protocol message: type tag, sequence number, opaque payload.
///
/// The sequence number is assigned by [`crate::framer::Framer::enqueue`] at
/// enqueue time, not by the caller — spec.md §3 requires strictly increasing
/// per-direction sequence numbers starting at 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedMessage {
    /// Wire type tag.
    pub msg_type: MessageType,
    /// Monotonically increasing per-direction sequence number.
    pub sequence: u32,
    /// Opaque payload bytes; shape depends on `msg_type` (see spec.md §4.3).
    pub payload: Vec<u8>,
}

impl FramedMessage {
    /// Construct a message; `sequence` is a placeholder until the Framer
    /// assigns the real value at enqueue time.
    #[must_use]
    pub fn new(msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            sequence: 0,
            payload,
        }
    }

    /// Total encoded size in bytes, including the 4-byte length prefix.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        4 + HEADER_LEN + self.payload.len()
    }

    /// Append this message's wire encoding to `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        let total_length = (HEADER_LEN + self.payload.len()) as u32;
        out.reserve(self.encoded_len());
        out.put_u32(total_length);
        out.put_u8(self.msg_type as u8);
        out.put_u32(self.sequence);
        out.extend_from_slice(&self.payload);
    }

    /// Attempt to decode one message from the front of `buf`.
    ///
    /// Returns `Ok(None)` if `buf` does not yet contain a complete message
    /// (the caller should wait for more bytes); never partially consumes a
    /// message (spec.md §4.2 invariant: a message is never partially
    /// delivered to the dispatcher).
    pub fn try_decode(buf: &mut BytesMut) -> Result<Option<Self>, TunnelError> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let total_length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if total_length < HEADER_LEN {
            return Err(TunnelError::ProtocolViolation(format!(
                "frame total_length {total_length} shorter than header"
            )));
        }
        if buf.len() < 4 + total_length {
            return Ok(None);
        }

        buf.advance(4);
        let tag = buf.get_u8();
        let sequence = buf.get_u32();
        let payload_len = total_length - HEADER_LEN;
        let payload = buf.split_to(payload_len).to_vec();

        let msg_type = MessageType::from_tag(tag)
            .ok_or_else(|| TunnelError::ProtocolViolation(format!("unknown message tag {tag:#x}")))?;

        Ok(Some(FramedMessage {
            msg_type,
            sequence,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let mut msg = FramedMessage::new(MessageType::ChannelData, b"ABCD".to_vec());
        msg.sequence = 7;

        let mut buf = BytesMut::new();
        msg.encode(&mut buf);

        let decoded = FramedMessage::try_decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_waits_for_a_complete_frame() {
        let mut msg = FramedMessage::new(MessageType::EchoReq, vec![1, 2, 3]);
        msg.sequence = 1;
        let mut full = BytesMut::new();
        msg.encode(&mut full);

        // Feed one byte at a time; nothing should decode until the last byte.
        let mut buf = BytesMut::new();
        for (i, byte) in full.iter().enumerate() {
            buf.put_u8(*byte);
            let decoded = FramedMessage::try_decode(&mut buf.clone()).unwrap();
            if i + 1 < full.len() {
                assert!(decoded.is_none(), "decoded too early at byte {i}");
            } else {
                assert_eq!(decoded.unwrap().sequence, 1);
            }
        }
    }

    #[test]
    fn rejects_unknown_type_tag() {
        let mut buf = BytesMut::new();
        buf.put_u32(HEADER_LEN as u32);
        buf.put_u8(0xFF);
        buf.put_u32(1);
        let err = FramedMessage::try_decode(&mut buf).unwrap_err();
        assert!(matches!(err, TunnelError::ProtocolViolation(_)));
    }
}
