//! Wire frame codec.
//!
//! ```text
//! [ version u8 | kind u8 | sender_len u8 | sender_id (utf-8) | payload_len u32 BE | payload ]
//! ```
//!
//! `identity` and `handshake_step` frames carry the sender's ephemeral id and
//! a cleartext payload. Every other kind carries a session-sealed payload whose
//! plaintext is JSON; the kind byte is that seal's associated data.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtoError;

pub const PROTOCOL_VERSION: u8 = 1;

/// version + kind + sender_len + payload_len
pub const FRAME_OVERHEAD: usize = 1 + 1 + 1 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Identity = 1,
    HandshakeStep = 2,
    StatusSync = 3,
    DataMessage = 4,
    RelayEnvelope = 5,
    Ack = 6,
    QueueSyncDigest = 7,
    QueueSyncRequest = 8,
}

impl FrameKind {
    /// Kinds exchanged before a session exists.
    pub fn is_cleartext(self) -> bool {
        matches!(self, FrameKind::Identity | FrameKind::HandshakeStep)
    }

    /// Associated data binding a sealed payload to its frame kind.
    pub fn aad(self) -> [u8; 1] {
        [self as u8]
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => FrameKind::Identity,
            2 => FrameKind::HandshakeStep,
            3 => FrameKind::StatusSync,
            4 => FrameKind::DataMessage,
            5 => FrameKind::RelayEnvelope,
            6 => FrameKind::Ack,
            7 => FrameKind::QueueSyncDigest,
            8 => FrameKind::QueueSyncRequest,
            other => return Err(ProtoError::UnknownKind(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub sender_id: String,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: FrameKind, sender_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind,
            sender_id: sender_id.into(),
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        let sender = self.sender_id.as_bytes();
        let sender_len =
            u8::try_from(sender.len()).map_err(|_| ProtoError::FieldTooLong("sender_id"))?;
        let payload_len =
            u32::try_from(self.payload.len()).map_err(|_| ProtoError::FieldTooLong("payload"))?;

        let mut buf = BytesMut::with_capacity(FRAME_OVERHEAD + sender.len() + self.payload.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.kind as u8);
        buf.put_u8(sender_len);
        buf.put_slice(sender);
        buf.put_u32(payload_len);
        buf.put_slice(&self.payload);
        Ok(buf.to_vec())
    }

    pub fn decode(mut input: &[u8]) -> Result<Self, ProtoError> {
        if input.remaining() < 3 {
            return Err(ProtoError::Truncated("header"));
        }
        let version = input.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtoError::UnsupportedVersion(version));
        }
        let kind = FrameKind::try_from(input.get_u8())?;
        let sender_len = input.get_u8() as usize;
        if input.remaining() < sender_len + 4 {
            return Err(ProtoError::Truncated("sender_id"));
        }
        let sender_id = std::str::from_utf8(&input[..sender_len])
            .map_err(|_| ProtoError::InvalidUtf8("sender_id"))?
            .to_owned();
        input.advance(sender_len);
        let payload_len = input.get_u32() as usize;
        if input.remaining() != payload_len {
            return Err(ProtoError::Truncated("payload"));
        }
        Ok(Self {
            kind,
            sender_id,
            payload: input.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_documented_layout() {
        let frame = Frame::new(FrameKind::Ack, "ab", vec![9, 9]);
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes, vec![1, 6, 2, b'a', b'b', 0, 0, 0, 2, 9, 9]);
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn rejects_unknown_version_and_kind() {
        assert!(matches!(
            Frame::decode(&[2, 1, 0, 0, 0, 0, 0]),
            Err(ProtoError::UnsupportedVersion(2))
        ));
        assert!(matches!(
            Frame::decode(&[1, 42, 0, 0, 0, 0, 0]),
            Err(ProtoError::UnknownKind(42))
        ));
    }

    #[test]
    fn rejects_length_mismatch() {
        let mut bytes = Frame::new(FrameKind::Identity, "x", vec![1, 2, 3])
            .encode()
            .unwrap();
        bytes.pop();
        assert!(matches!(Frame::decode(&bytes), Err(ProtoError::Truncated("payload"))));
        assert!(Frame::decode(&[1, 1]).is_err());
    }

    #[test]
    fn sender_id_longer_than_255_bytes_is_refused() {
        let frame = Frame::new(FrameKind::Identity, "x".repeat(256), vec![]);
        assert!(matches!(frame.encode(), Err(ProtoError::FieldTooLong("sender_id"))));
    }

    #[test]
    fn cleartext_kinds() {
        assert!(FrameKind::Identity.is_cleartext());
        assert!(FrameKind::HandshakeStep.is_cleartext());
        assert!(!FrameKind::RelayEnvelope.is_cleartext());
    }
}
