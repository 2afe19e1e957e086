//! The JoinMe v0 advertisement payload: a 20-byte summary of a node's
//! cluster, broadcast in a BLE manufacturer-specific field so neighbors can
//! decide whether to connect.

use bytes::{Buf, BufMut};

use crate::error::WireError;
use crate::ids::{ClusterId, DeviceType, NodeId};

pub const JOIN_ME_PAYLOAD_SIZE: usize = 20;

/// Manufacturer identifier placed before the JoinMe payload in the
/// advertisement: `[flags(3)][manufacturer header(4)][mesh_identifier(1)=0xF0]...`.
pub const MESH_IDENTIFIER: u8 = 0xF0;
/// Message type byte following the mesh identifier in the advertisement envelope.
pub const JOIN_ME_MESSAGE_TYPE: u8 = 0x01;

fn device_type_to_byte(dt: DeviceType) -> u8 {
    match dt {
        DeviceType::Node => 0,
        DeviceType::Sink => 1,
        DeviceType::Asset => 2,
    }
}

fn device_type_from_byte(byte: u8) -> DeviceType {
    match byte {
        1 => DeviceType::Sink,
        2 => DeviceType::Asset,
        _ => DeviceType::Node,
    }
}

/// The 20-byte JoinMe v0 payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinMePayload {
    pub sender: NodeId,
    pub cluster_id: ClusterId,
    /// Signed: the store's `ClusterSize` is signed 16-bit.
    pub cluster_size: i16,
    /// 0..=7.
    pub free_in_connections: u8,
    /// 0..=31.
    pub free_out_connections: u8,
    pub battery_runtime: u8,
    pub tx_power_dbm: i8,
    pub device_type: DeviceType,
    /// -1 means unknown/no path.
    pub hops_to_sink: i16,
    pub mesh_write_handle: u16,
    pub ack_field: ClusterId,
}

impl JoinMePayload {
    #[must_use]
    pub fn encode(&self) -> [u8; JOIN_ME_PAYLOAD_SIZE] {
        debug_assert!(self.free_in_connections <= 0b111);
        debug_assert!(self.free_out_connections <= 0b1_1111);

        let mut buf = [0u8; JOIN_ME_PAYLOAD_SIZE];
        let mut w = &mut buf[..];
        w.put_u16_le(self.sender.0);
        w.put_u32_le(self.cluster_id.0);
        w.put_i16_le(self.cluster_size);
        w.put_u8((self.free_in_connections << 5) | (self.free_out_connections & 0b1_1111));
        w.put_u8(self.battery_runtime);
        w.put_i8(self.tx_power_dbm);
        w.put_u8(device_type_to_byte(self.device_type));
        w.put_i16_le(self.hops_to_sink);
        w.put_u16_le(self.mesh_write_handle);
        w.put_u32_le(self.ack_field.0);
        buf
    }

    /// # Errors
    /// Returns [`WireError::Truncated`] if fewer than [`JOIN_ME_PAYLOAD_SIZE`] bytes remain.
    pub fn decode(mut bytes: impl Buf) -> Result<Self, WireError> {
        if bytes.remaining() < JOIN_ME_PAYLOAD_SIZE {
            return Err(WireError::Truncated);
        }
        let sender = NodeId(bytes.get_u16_le());
        let cluster_id = ClusterId(bytes.get_u32_le());
        let cluster_size = bytes.get_i16_le();
        let slots_byte = bytes.get_u8();
        let free_in_connections = slots_byte >> 5;
        let free_out_connections = slots_byte & 0b1_1111;
        let battery_runtime = bytes.get_u8();
        let tx_power_dbm = bytes.get_i8();
        let device_type = device_type_from_byte(bytes.get_u8());
        let hops_to_sink = bytes.get_i16_le();
        let mesh_write_handle = bytes.get_u16_le();
        let ack_field = ClusterId(bytes.get_u32_le());

        Ok(Self {
            sender,
            cluster_id,
            cluster_size,
            free_in_connections,
            free_out_connections,
            battery_runtime,
            tx_power_dbm,
            device_type,
            hops_to_sink,
            mesh_write_handle,
            ack_field,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> JoinMePayload {
        JoinMePayload {
            sender: NodeId(12),
            cluster_id: ClusterId(0xDEAD_BEEF),
            cluster_size: 5,
            free_in_connections: 2,
            free_out_connections: 3,
            battery_runtime: 200,
            tx_power_dbm: -4,
            device_type: DeviceType::Sink,
            hops_to_sink: 1,
            mesh_write_handle: 0x20,
            ack_field: ClusterId(0x1234_5678),
        }
    }

    #[test]
    fn round_trips() {
        let payload = sample();
        let encoded = payload.encode();
        assert_eq!(encoded.len(), JOIN_ME_PAYLOAD_SIZE);
        assert_eq!(JoinMePayload::decode(&encoded[..]).unwrap(), payload);
    }

    #[test]
    fn unknown_hops_to_sink_round_trips_as_negative_one() {
        let mut payload = sample();
        payload.hops_to_sink = -1;
        let encoded = payload.encode();
        let decoded = JoinMePayload::decode(&encoded[..]).unwrap();
        assert_eq!(decoded.hops_to_sink, -1);
    }

    #[test]
    fn slot_counts_pack_without_crosstalk() {
        let mut payload = sample();
        payload.free_in_connections = 0b111;
        payload.free_out_connections = 0b1_1111;
        let decoded = JoinMePayload::decode(&payload.encode()[..]).unwrap();
        assert_eq!(decoded.free_in_connections, 0b111);
        assert_eq!(decoded.free_out_connections, 0b1_1111);
    }

    #[test]
    fn decode_truncated() {
        let bytes = [0u8; 10];
        assert!(matches!(
            JoinMePayload::decode(&bytes[..]),
            Err(WireError::Truncated)
        ));
    }
}
