//! Fragment structure and wire encoding.

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::types::MessageId;

use super::HEADER_SIZE;

/// What a decoded fragment carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    /// A slice of message payload.
    Data,
    /// Acknowledgment of a whole message.
    Ack,
}

/// One wire packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Message this fragment belongs to.
    pub message_id: MessageId,
    /// Position within the message (0-based).
    pub index: u16,
    /// Total fragments in the message, 0 for acknowledgments.
    pub count: u16,
    /// Payload bytes.
    pub payload: Bytes,
    /// CRC32 of the payload.
    pub checksum: u32,
}

impl Fragment {
    /// Create a data fragment.
    pub fn data(message_id: MessageId, index: u16, count: u16, payload: Bytes) -> Self {
        debug_assert!(count > 0 && index < count);
        debug_assert!(payload.len() <= u16::MAX as usize);
        let checksum = super::checksum(&payload);
        Self {
            message_id,
            index,
            count,
            payload,
            checksum,
        }
    }

    /// Create an acknowledgment for a message.
    pub fn ack(message_id: MessageId) -> Self {
        Self {
            message_id,
            index: 0,
            count: 0,
            payload: Bytes::new(),
            checksum: super::checksum(&[]),
        }
    }

    pub fn kind(&self) -> FragmentKind {
        if self.count == 0 {
            FragmentKind::Ack
        } else {
            FragmentKind::Data
        }
    }

    pub fn is_ack(&self) -> bool {
        self.kind() == FragmentKind::Ack
    }

    /// Size of the encoded fragment.
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Check the payload against the carried checksum.
    pub fn verify(&self) -> bool {
        super::checksum(&self.payload) == self.checksum
    }

    /// Encode to a datagram.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        let mut header = [0u8; HEADER_SIZE];
        LittleEndian::write_u64(&mut header[0..8], self.message_id.0);
        LittleEndian::write_u16(&mut header[8..10], self.index);
        LittleEndian::write_u16(&mut header[10..12], self.count);
        LittleEndian::write_u16(&mut header[12..14], self.payload.len() as u16);
        LittleEndian::write_u32(&mut header[14..18], self.checksum);
        buf.put_slice(&header);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a datagram, verifying length, indices and checksum.
    ///
    /// The payload is sliced out of `datagram` without copying.
    pub fn decode(datagram: &Bytes) -> Result<Self, ProtocolError> {
        if datagram.len() < HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                len: datagram.len(),
            });
        }

        let message_id = MessageId(LittleEndian::read_u64(&datagram[0..8]));
        let index = LittleEndian::read_u16(&datagram[8..10]);
        let count = LittleEndian::read_u16(&datagram[10..12]);
        let payload_len = LittleEndian::read_u16(&datagram[12..14]) as usize;
        let checksum = LittleEndian::read_u32(&datagram[14..18]);

        let actual = datagram.len() - HEADER_SIZE;
        if actual != payload_len {
            return Err(ProtocolError::LengthMismatch {
                declared: payload_len,
                actual,
            });
        }

        if count == 0 {
            if payload_len != 0 {
                return Err(ProtocolError::FragmentTooLarge {
                    size: payload_len,
                    max: 0,
                });
            }
        } else if index >= count {
            return Err(ProtocolError::InvalidFragmentIndex { index, count });
        }

        let fragment = Self {
            message_id,
            index,
            count,
            payload: datagram.slice(HEADER_SIZE..),
            checksum,
        };

        if !fragment.verify() {
            return Err(ProtocolError::ChecksumMismatch);
        }

        Ok(fragment)
    }
}
