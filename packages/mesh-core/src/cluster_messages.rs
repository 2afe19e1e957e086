//! Wire bodies for the cluster-merge three-way handshake and the steady-state
//! `CLUSTER_INFO_UPDATE` broadcast. Each body follows a `CLUSTER_WELCOME`,
//! `CLUSTER_ACK_1`, `CLUSTER_ACK_2`, or `CLUSTER_INFO_UPDATE` [`crate::MessageType`]
//! tag and the 5-byte [`crate::PacketHeader`] envelope; this module only
//! covers what comes after those five bytes.

use bytes::{Buf, BufMut};

use crate::error::WireError;
use crate::ids::{ClusterId, NodeId};

pub const CLUSTER_WELCOME_SIZE: usize = 12;
pub const CLUSTER_ACK_1_SIZE: usize = 4;
pub const CLUSTER_ACK_2_SIZE: usize = 8;
pub const CLUSTER_INFO_UPDATE_SIZE: usize = 5;

/// Sent by the central side of a fresh mesh connection to open the merge handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterWelcome {
    pub sender: NodeId,
    pub cluster_id: ClusterId,
    pub cluster_size: i16,
    pub hops_to_sink: i16,
    pub mesh_write_handle: u16,
}

impl ClusterWelcome {
    #[must_use]
    pub fn encode(&self) -> [u8; CLUSTER_WELCOME_SIZE] {
        let mut buf = [0u8; CLUSTER_WELCOME_SIZE];
        let mut w = &mut buf[..];
        w.put_u16_le(self.sender.0);
        w.put_u32_le(self.cluster_id.0);
        w.put_i16_le(self.cluster_size);
        w.put_i16_le(self.hops_to_sink);
        w.put_u16_le(self.mesh_write_handle);
        buf
    }

    /// # Errors
    /// Returns [`WireError::Truncated`] if fewer than [`CLUSTER_WELCOME_SIZE`] bytes remain.
    pub fn decode(mut bytes: impl Buf) -> Result<Self, WireError> {
        if bytes.remaining() < CLUSTER_WELCOME_SIZE {
            return Err(WireError::Truncated);
        }
        Ok(Self {
            sender: NodeId(bytes.get_u16_le()),
            cluster_id: ClusterId(bytes.get_u32_le()),
            cluster_size: bytes.get_i16_le(),
            hops_to_sink: bytes.get_i16_le(),
            mesh_write_handle: bytes.get_u16_le(),
        })
    }
}

/// Sent by the smaller side after it dissolves its own cluster and adopts a
/// fresh singleton identity, acknowledging the welcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterAck1 {
    pub sender: NodeId,
    pub hops_to_sink: i16,
}

impl ClusterAck1 {
    #[must_use]
    pub fn encode(&self) -> [u8; CLUSTER_ACK_1_SIZE] {
        let mut buf = [0u8; CLUSTER_ACK_1_SIZE];
        let mut w = &mut buf[..];
        w.put_u16_le(self.sender.0);
        w.put_i16_le(self.hops_to_sink);
        buf
    }

    /// # Errors
    /// Returns [`WireError::Truncated`] if fewer than [`CLUSTER_ACK_1_SIZE`] bytes remain.
    pub fn decode(mut bytes: impl Buf) -> Result<Self, WireError> {
        if bytes.remaining() < CLUSTER_ACK_1_SIZE {
            return Err(WireError::Truncated);
        }
        Ok(Self {
            sender: NodeId(bytes.get_u16_le()),
            hops_to_sink: bytes.get_i16_le(),
        })
    }
}

/// Sent by the bigger side, absorbing the new node into its cluster and
/// handing back the surviving `cluster_id`/`cluster_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterAck2 {
    pub cluster_id: ClusterId,
    pub cluster_size: i16,
    pub hops_to_sink: i16,
}

impl ClusterAck2 {
    #[must_use]
    pub fn encode(&self) -> [u8; CLUSTER_ACK_2_SIZE] {
        let mut buf = [0u8; CLUSTER_ACK_2_SIZE];
        let mut w = &mut buf[..];
        w.put_u32_le(self.cluster_id.0);
        w.put_i16_le(self.cluster_size);
        w.put_i16_le(self.hops_to_sink);
        buf
    }

    /// # Errors
    /// Returns [`WireError::Truncated`] if fewer than [`CLUSTER_ACK_2_SIZE`] bytes remain.
    pub fn decode(mut bytes: impl Buf) -> Result<Self, WireError> {
        if bytes.remaining() < CLUSTER_ACK_2_SIZE {
            return Err(WireError::Truncated);
        }
        Ok(Self {
            cluster_id: ClusterId(bytes.get_u32_le()),
            cluster_size: bytes.get_i16_le(),
            hops_to_sink: bytes.get_i16_le(),
        })
    }
}

/// Steady-state propagation of a `cluster_size`/`hops_to_sink` change, sent on
/// every other mesh connection whenever either value changes locally.
/// `counter` occupies the low 3 bits; a receiver drops updates whose counter
/// isn't the expected next value on that connection (replay/reestablish guard).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterInfoUpdate {
    pub cluster_size_delta: i16,
    pub hops_to_sink: i16,
    pub counter: u8,
}

impl ClusterInfoUpdate {
    pub const COUNTER_MASK: u8 = 0b111;

    #[must_use]
    pub fn encode(&self) -> [u8; CLUSTER_INFO_UPDATE_SIZE] {
        let mut buf = [0u8; CLUSTER_INFO_UPDATE_SIZE];
        let mut w = &mut buf[..];
        w.put_i16_le(self.cluster_size_delta);
        w.put_i16_le(self.hops_to_sink);
        w.put_u8(self.counter & Self::COUNTER_MASK);
        buf
    }

    /// # Errors
    /// Returns [`WireError::Truncated`] if fewer than [`CLUSTER_INFO_UPDATE_SIZE`] bytes remain.
    pub fn decode(mut bytes: impl Buf) -> Result<Self, WireError> {
        if bytes.remaining() < CLUSTER_INFO_UPDATE_SIZE {
            return Err(WireError::Truncated);
        }
        Ok(Self {
            cluster_size_delta: bytes.get_i16_le(),
            hops_to_sink: bytes.get_i16_le(),
            counter: bytes.get_u8() & Self::COUNTER_MASK,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_welcome_round_trips() {
        let msg = ClusterWelcome {
            sender: NodeId(7),
            cluster_id: ClusterId(0x1234_5678),
            cluster_size: 3,
            hops_to_sink: -1,
            mesh_write_handle: 0x20,
        };
        assert_eq!(ClusterWelcome::decode(&msg.encode()[..]).unwrap(), msg);
    }

    #[test]
    fn cluster_ack1_round_trips() {
        let msg = ClusterAck1 {
            sender: NodeId(9),
            hops_to_sink: -1,
        };
        assert_eq!(ClusterAck1::decode(&msg.encode()[..]).unwrap(), msg);
    }

    #[test]
    fn cluster_ack2_round_trips() {
        let msg = ClusterAck2 {
            cluster_id: ClusterId(42),
            cluster_size: 4,
            hops_to_sink: 2,
        };
        assert_eq!(ClusterAck2::decode(&msg.encode()[..]).unwrap(), msg);
    }

    #[test]
    fn cluster_info_update_masks_counter_to_three_bits() {
        let msg = ClusterInfoUpdate {
            cluster_size_delta: -1,
            hops_to_sink: 3,
            counter: 0b1111_1010,
        };
        let decoded = ClusterInfoUpdate::decode(&msg.encode()[..]).unwrap();
        assert_eq!(decoded.counter, 0b010);
        assert_eq!(decoded.cluster_size_delta, -1);
    }
}
