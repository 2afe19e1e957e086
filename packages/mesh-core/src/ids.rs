//! Node, network, and cluster identifiers, and the special `NodeId` ranges
//! used for broadcast, hop-limited, and shortest-sink routing.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 16-bit node-unique identifier.
///
/// Values `0xF000..=0xFFFF` are reserved for the special addressing modes
/// described on [`NodeId`]'s associated constants; ordinary nodes are
/// assigned identifiers below that range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u16);

impl NodeId {
    /// Dispatch locally and forward to every other mesh connection.
    pub const BROADCAST: NodeId = NodeId(0xFFFF);
    /// Base of the hop-limited addressing range `[HOPS_BASE, HOPS_BASE + 1000)`.
    pub const HOPS_BASE: u16 = 0xF000;
    /// Forward on the connection with the smallest cached `hops_to_sink`.
    pub const SHORTEST_SINK: NodeId = NodeId(0xFDFF);
    /// No node is ever assigned this id; used as a sentinel in tests and tables.
    pub const INVALID: NodeId = NodeId(0);

    #[must_use]
    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }

    #[must_use]
    pub fn is_shortest_sink(self) -> bool {
        self == Self::SHORTEST_SINK
    }

    /// `true` if this id falls in the hop-limited range `[HOPS_BASE, HOPS_BASE + 1000)`.
    #[must_use]
    pub fn is_hop_limited(self) -> bool {
        self.0 >= Self::HOPS_BASE && self.0 < Self::HOPS_BASE + 1000
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 16-bit identifier grouping nodes that may mesh with each other.
///
/// `0` means unenrolled, `1` is the enrollment scratch network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkId(pub u16);

impl NetworkId {
    pub const UNENROLLED: NetworkId = NetworkId(0);
    pub const ENROLLMENT_SCRATCH: NetworkId = NetworkId(1);
}

/// Random 32-bit cluster identifier. The surviving id after a merge is the
/// larger cluster's id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterId(pub u32);

/// Process-wide unique identifier for a [`Connection`](crate::connection::ConnectionId
/// handle). Re-exported here because both `mesh-core` wire types and
/// `mesh-node` handles reference it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UniqueConnectionId(pub u32);

/// A device's role in `hops_to_sink` propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    /// Ordinary mesh node; computes `hops_to_sink` from neighbors.
    Node,
    /// Root for `hops_to_sink`; always advertises `hops_to_sink = 1`.
    Sink,
    /// Non-participating scanner (e.g. a provisioning dongle).
    Asset,
}

impl DeviceType {
    #[must_use]
    pub fn is_sink(self) -> bool {
        matches!(self, DeviceType::Sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_is_recognized() {
        assert!(NodeId::BROADCAST.is_broadcast());
        assert!(!NodeId(42).is_broadcast());
    }

    #[test]
    fn hop_limited_range_bounds() {
        assert!(NodeId(NodeId::HOPS_BASE).is_hop_limited());
        assert!(NodeId(NodeId::HOPS_BASE + 999).is_hop_limited());
        assert!(!NodeId(NodeId::HOPS_BASE + 1000).is_hop_limited());
        assert!(!NodeId(NodeId::HOPS_BASE - 1).is_hop_limited());
    }

    #[test]
    fn shortest_sink_is_not_hop_limited_or_broadcast() {
        assert!(NodeId::SHORTEST_SINK.is_shortest_sink());
        assert!(!NodeId::SHORTEST_SINK.is_broadcast());
    }

    #[test]
    fn device_type_sink_check() {
        assert!(DeviceType::Sink.is_sink());
        assert!(!DeviceType::Node.is_sink());
        assert!(!DeviceType::Asset.is_sink());
    }

    #[test]
    fn ordering_is_numeric() {
        assert!(ClusterId(1) < ClusterId(2));
        assert!(NodeId(1) < NodeId(2));
    }
}
