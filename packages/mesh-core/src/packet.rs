//! Wire format for the universal packet envelope and its split (fragment) header.
//!
//! All multi-byte fields are little-endian. `PacketHeader` is the 5-byte
//! envelope every message carries; `SplitHeader` is the extra byte prepended
//! to every fragment of a message too large for one MTU.

use bytes::{Buf, BufMut};

use crate::error::WireError;
use crate::ids::NodeId;

pub const PACKET_HEADER_SIZE: usize = 5;
pub const SPLIT_HEADER_SIZE: usize = 1;

/// One-byte message type tag. Values `1..=15` are reserved for mesh-core
/// protocol messages; application modules use values `16..=255`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType(pub u8);

impl MessageType {
    pub const CLUSTER_WELCOME: MessageType = MessageType(1);
    pub const CLUSTER_ACK_1: MessageType = MessageType(2);
    pub const CLUSTER_ACK_2: MessageType = MessageType(3);
    pub const CLUSTER_INFO_UPDATE: MessageType = MessageType(4);
    /// Intermediate fragment of a split message.
    pub const SPLIT_WRITE_CMD: MessageType = MessageType(5);
    /// Final fragment of a split message.
    pub const SPLIT_WRITE_CMD_END: MessageType = MessageType(6);

    #[must_use]
    pub fn is_reserved(self) -> bool {
        (1..=15).contains(&self.0)
    }
}

/// The 5-byte envelope carried by every packet: `[message_type][sender][receiver]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub message_type: MessageType,
    pub sender: NodeId,
    pub receiver: NodeId,
}

impl PacketHeader {
    #[must_use]
    pub fn encode(&self) -> [u8; PACKET_HEADER_SIZE] {
        let mut buf = [0u8; PACKET_HEADER_SIZE];
        let mut w = &mut buf[..];
        w.put_u8(self.message_type.0);
        w.put_u16_le(self.sender.0);
        w.put_u16_le(self.receiver.0);
        buf
    }

    /// # Errors
    /// Returns [`WireError::Truncated`] if fewer than [`PACKET_HEADER_SIZE`] bytes remain.
    pub fn decode(mut bytes: impl Buf) -> Result<Self, WireError> {
        if bytes.remaining() < PACKET_HEADER_SIZE {
            return Err(WireError::Truncated);
        }
        let message_type = MessageType(bytes.get_u8());
        let sender = NodeId(bytes.get_u16_le());
        let receiver = NodeId(bytes.get_u16_le());
        Ok(Self {
            message_type,
            sender,
            receiver,
        })
    }
}

/// The 1-byte header prepended to every fragment of a split message.
///
/// `split_counter` occupies the low 5 bits; the high 3 bits are reserved
/// and must be zero on encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitHeader {
    /// [`MessageType::SPLIT_WRITE_CMD`] for an intermediate fragment,
    /// [`MessageType::SPLIT_WRITE_CMD_END`] for the last one.
    pub split_message_type: MessageType,
    pub split_counter: u8,
}

impl SplitHeader {
    pub const MAX_COUNTER: u8 = 0x1F;

    #[must_use]
    pub fn encode(&self) -> u8 {
        debug_assert!(self.split_counter <= Self::MAX_COUNTER);
        (self.split_message_type.0 << 5) | (self.split_counter & Self::MAX_COUNTER)
    }

    #[must_use]
    pub fn decode(byte: u8) -> Self {
        Self {
            split_message_type: MessageType(byte >> 5),
            split_counter: byte & Self::MAX_COUNTER,
        }
    }

    /// `true` if `byte`'s top 3 bits decode to [`MessageType::SPLIT_WRITE_CMD`]
    /// or [`MessageType::SPLIT_WRITE_CMD_END`].
    ///
    /// A single-fragment message is sent bare (just its [`PacketHeader`],
    /// no split header byte); a multi-fragment message prefixes every
    /// fragment with a split header. Since a split header only ever packs
    /// those two sentinel values into its 3-bit type field, a receiver that
    /// isn't already mid-reassembly can use this to tell the two wire shapes
    /// apart, *provided* senders avoid picking an application
    /// [`MessageType`] whose value's top 3 bits equal 5 or 6 (i.e. avoid
    /// `0xA0..=0xDF`) -- the same way `5` and `6` are reserved among
    /// single-byte message types.
    #[must_use]
    pub fn looks_like_fragment_marker(byte: u8) -> bool {
        let top = byte >> 5;
        top == Self::SPLIT_WRITE_CMD_TOP_BITS || top == Self::SPLIT_WRITE_CMD_END_TOP_BITS
    }

    const SPLIT_WRITE_CMD_TOP_BITS: u8 = MessageType::SPLIT_WRITE_CMD.0;
    const SPLIT_WRITE_CMD_END_TOP_BITS: u8 = MessageType::SPLIT_WRITE_CMD_END.0;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_header_round_trip() {
        let header = PacketHeader {
            message_type: MessageType(42),
            sender: NodeId(7),
            receiver: NodeId::BROADCAST,
        };
        let encoded = header.encode();
        assert_eq!(encoded.len(), PACKET_HEADER_SIZE);
        let decoded = PacketHeader::decode(&encoded[..]).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn packet_header_decode_truncated() {
        let bytes = [0u8; 3];
        assert!(matches!(
            PacketHeader::decode(&bytes[..]),
            Err(WireError::Truncated)
        ));
    }

    #[test]
    fn split_header_round_trip_intermediate() {
        let header = SplitHeader {
            split_message_type: MessageType::SPLIT_WRITE_CMD,
            split_counter: 17,
        };
        assert_eq!(SplitHeader::decode(header.encode()), header);
    }

    #[test]
    fn split_header_round_trip_end() {
        let header = SplitHeader {
            split_message_type: MessageType::SPLIT_WRITE_CMD_END,
            split_counter: 0,
        };
        assert_eq!(SplitHeader::decode(header.encode()), header);
    }

    #[test]
    fn split_counter_packs_into_five_bits() {
        let header = SplitHeader {
            split_message_type: MessageType(1),
            split_counter: SplitHeader::MAX_COUNTER,
        };
        let encoded = header.encode();
        assert_eq!(encoded & 0x1F, SplitHeader::MAX_COUNTER);
        assert_eq!(encoded >> 5, 1);
    }

    #[test]
    fn reserved_message_types() {
        assert!(MessageType::CLUSTER_WELCOME.is_reserved());
        assert!(!MessageType(200).is_reserved());
    }
}
