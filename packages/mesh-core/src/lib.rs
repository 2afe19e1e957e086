//! FruityMesh Core -- wire formats, identifiers, and the radio/flash/module
//! contracts shared by the mesh runtime.
//!
//! This crate provides the foundation layer consumed by `mesh-node`:
//!
//! - **Ids** ([`ids`]): `NodeId`, `NetworkId`, `ClusterId`, `DeviceType`, and
//!   the reserved `NodeId` addressing ranges (broadcast, hop-limited, shortest-sink)
//! - **Packet** ([`packet`]): the 5-byte packet envelope and 1-byte split header
//! - **Record** ([`record`]): flash page and record-header wire layout
//! - **Advertisement** ([`advertisement`]): the 20-byte JoinMe v0 payload
//! - **Cluster messages** ([`cluster_messages`]): the merge-handshake and
//!   `CLUSTER_INFO_UPDATE` wire bodies
//! - **Priority** ([`priority`]): the four send-priority levels
//! - **Contracts** ([`contracts`]): `RadioTransport`, `FlashTransport`, `Module`
//! - **Crc8** ([`crc8`]): the checksum used to validate record bodies
//! - **Error** ([`error`]): `WireError`, shared across all wire decoders

pub mod advertisement;
pub mod cluster_messages;
pub mod contracts;
pub mod crc8;
pub mod error;
pub mod ids;
pub mod packet;
pub mod priority;
pub mod record;

pub use advertisement::{JoinMePayload, JOIN_ME_PAYLOAD_SIZE, MESH_IDENTIFIER};
pub use cluster_messages::{
    ClusterAck1, ClusterAck2, ClusterInfoUpdate, ClusterWelcome, CLUSTER_ACK_1_SIZE,
    CLUSTER_ACK_2_SIZE, CLUSTER_INFO_UPDATE_SIZE, CLUSTER_WELCOME_SIZE,
};
pub use contracts::{
    AdvParams, AppDisconnectReason, BleAddress, CharHandle, ConnHandle, ConnParams,
    ConnectedClusterSnapshot, FlashEvent, FlashOpToken, FlashTransport, HciDisconnectReason,
    MeshMessageReceived, Module, ModuleId, PageIndex, RadioEvent, RadioTransport, RebootReason,
    RoutingDecision, ScanParams, SendModuleActionMessage,
};
pub use crc8::crc8;
pub use error::WireError;
pub use ids::{ClusterId, DeviceType, NetworkId, NodeId, UniqueConnectionId};
pub use packet::{MessageType, PacketHeader, SplitHeader, PACKET_HEADER_SIZE, SPLIT_HEADER_SIZE};
pub use priority::Priority;
pub use record::{
    PageHeader, PageMagic, RecordFlags, RecordHeader, PAGE_HEADER_SIZE, RECORD_HEADER_SIZE,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }

    /// Verify all re-exports are accessible from the crate root.
    #[test]
    fn reexports_accessible() {
        let _ = NodeId::BROADCAST;
        let _ = NetworkId::UNENROLLED;
        let _ = ClusterId(0);
        let _ = DeviceType::Node;
        let _ = Priority::Medium;
        let _ = MessageType::CLUSTER_WELCOME;
        let _ = PacketHeader {
            message_type: MessageType(1),
            sender: NodeId(1),
            receiver: NodeId(2),
        };
        let _ = SplitHeader {
            split_message_type: MessageType::SPLIT_WRITE_CMD,
            split_counter: 0,
        };
        let _ = PageMagic::Swap;
        let _ = RecordFlags {
            padding_len: 0,
            record_active: true,
            mortal: false,
        };
        let _ = RoutingDecision::NONE;
        let _ = AppDisconnectReason::HandshakeTimeout;
        let _ = RebootReason::Watchdog;
        let _ = crc8(b"test");
    }
}
