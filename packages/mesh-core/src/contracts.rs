//! External-collaborator contracts: the radio stack, the flash controller,
//! and application modules. These are the boundaries the mesh core consumes
//! or is consumed by; this crate only defines the shapes, never
//! implementations (those live on real hardware, or as in-memory fakes under
//! `mesh-node::testing`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ids::{ClusterId, NodeId};

// ---------------------------------------------------------------------------
// Radio stack contract
// ---------------------------------------------------------------------------

/// 48-bit random BLE address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BleAddress(pub [u8; 6]);

/// Radio-assigned handle for an open GATT connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnHandle(pub u16);

/// GATT characteristic handle targeted by a write/notify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharHandle(pub u16);

/// Advertising parameters for `bt_adv_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvParams {
    pub interval: Duration,
}

/// Scan parameters for `bt_scan_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanParams {
    pub window: Duration,
    pub interval: Duration,
}

/// Connection parameters hint for `bt_connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnParams {
    pub interval_hint: Duration,
}

/// HCI disconnect reason code, as reported by the radio stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HciDisconnectReason(pub u8);

impl HciDisconnectReason {
    pub const LOCAL_HOST_TERMINATED: HciDisconnectReason = HciDisconnectReason(0x16);
    pub const CONNECTION_TIMEOUT: HciDisconnectReason = HciDisconnectReason(0x08);
    pub const REMOTE_USER_TERMINATED: HciDisconnectReason = HciDisconnectReason(0x13);
}

/// Application-level reason a connection was torn down. Distinct from the
/// HCI code: this is the *mesh core's* reasoning, attached even when the HCI
/// code is uninformative (e.g. a local decision to force-disconnect).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppDisconnectReason {
    /// Remote closed the link; HCI code carried separately.
    RemoteInitiated,
    /// Cluster-merge handshake did not complete within `mesh_handshake_timeout_ds`.
    HandshakeTimeout,
    /// Reestablishment attempted to resume with a different negotiated MTU.
    MtuMismatchOnReestablish,
    /// More than `MAX_SEND_FAILURES` consecutive non-transient send failures.
    TooManySendRetries,
    /// Partner's `cluster_id` equals ours: a merge cycle, must not form.
    ClusterIdCollision,
    /// Connection slot budget reclaimed to serve a higher-priority request.
    LocalShutdown,
}

/// Events delivered asynchronously from the radio stack to the main loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    AdvertisementReport {
        peer_addr: BleAddress,
        rssi_dbm: i8,
        payload: Vec<u8>,
    },
    Connected {
        handle: ConnHandle,
        peer_addr: BleAddress,
    },
    Disconnected {
        handle: ConnHandle,
        reason: HciDisconnectReason,
    },
    Timeout {
        handle: ConnHandle,
    },
    WriteResponse {
        handle: ConnHandle,
        success: bool,
    },
    HandleValueNotification {
        handle: ConnHandle,
        char_handle: CharHandle,
        data: Vec<u8>,
    },
    DataTransmitted {
        handle: ConnHandle,
        unreliable_count: u16,
        reliable_count: u16,
    },
    MtuUpgraded {
        handle: ConnHandle,
        mtu: u16,
    },
    RssiChanged {
        handle: ConnHandle,
        rssi_dbm: i8,
    },
}

/// Radio stack surface the mesh core drives. Every method only *initiates*
/// work; results are reported later as [`RadioEvent`]s on the shared channel,
/// per the single-threaded, non-blocking dispatch model.
pub trait RadioTransport: Send + Sync {
    fn bt_adv_start(&self, params: AdvParams, payload: Vec<u8>);
    fn bt_adv_stop(&self);
    fn bt_scan_start(&self, params: ScanParams);
    fn bt_scan_stop(&self);
    fn bt_connect(&self, peer_addr: BleAddress, params: ConnParams);
    fn bt_disconnect(&self, handle: ConnHandle, hci_reason: HciDisconnectReason);
    fn bt_write(&self, handle: ConnHandle, char_handle: CharHandle, data: Vec<u8>, reliable: bool);
    fn bt_notify(&self, handle: ConnHandle, char_handle: CharHandle, data: Vec<u8>);
}

// ---------------------------------------------------------------------------
// Flash contract
// ---------------------------------------------------------------------------

/// Correlates a flash request with its completion event; the flash
/// controller echoes it back unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlashOpToken(pub u64);

/// Zero-based flash page index within the record-store's reserved region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageIndex(pub u16);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashEvent {
    FlashOperationSuccess { token: FlashOpToken },
    FlashOperationError { token: FlashOpToken },
}

/// Flash controller surface. `write` requires word-aligned, word-sized
/// buffers; erased flash reads as all-ones.
pub trait FlashTransport: Send + Sync {
    fn erase_page(&self, token: FlashOpToken, page: PageIndex);
    fn write(&self, token: FlashOpToken, page: PageIndex, byte_offset: u32, words: Vec<u32>);
}

// ---------------------------------------------------------------------------
// Module contract
// ---------------------------------------------------------------------------

/// Identifies a registered application module. Core modules use a single
/// byte; vendor modules use a 4-byte composite so third parties can avoid
/// colliding with core or each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleId {
    Core(u8),
    Vendor {
        prefix: u8,
        sub_id: u8,
        vendor_id: u16,
    },
}

impl ModuleId {
    /// Record-store id this module's persisted config lives under.
    ///
    /// Core modules persist under `record_id = module_id`; vendor modules are
    /// assigned a slot in `500..1000` by the registrar.
    #[must_use]
    pub fn config_record_id(self, vendor_slot: Option<u16>) -> u16 {
        match self {
            ModuleId::Core(id) => u16::from(id),
            ModuleId::Vendor { .. } => vendor_slot.unwrap_or(500),
        }
    }
}

/// A reassembled application message delivered up to a matching module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshMessageReceived {
    pub connection: crate::ids::UniqueConnectionId,
    pub message_type: crate::packet::MessageType,
    pub sender: NodeId,
    pub receiver: NodeId,
    pub data: Vec<u8>,
}

/// A module-originated message to be enqueued for sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendModuleActionMessage {
    pub message_type: crate::packet::MessageType,
    pub to: NodeId,
    pub action: u8,
    pub request_handle: u8,
    pub data: Vec<u8>,
    pub reliable: bool,
    /// If true, the message is also delivered to the sender's own listeners
    /// without touching the radio.
    pub loopback: bool,
}

/// Capability interface every application module implements. Dispatch is
/// synchronous and must not block, matching the rest of the core.
pub trait Module: Send + Sync {
    fn module_id(&self) -> ModuleId;

    /// Called for every reassembled message whose `message_type` this module
    /// has registered interest in.
    fn on_mesh_message_received(&self, message: &MeshMessageReceived);

    /// Offered a chance to veto or reprioritize a message before it is
    /// routed. Default: no opinion.
    fn routing_decision(&self, _message: &MeshMessageReceived) -> RoutingDecision {
        RoutingDecision::NONE
    }

    /// Overrides the default `MEDIUM` priority for messages this module
    /// originates. Returning `None` defers to the default.
    fn priority_of_message(&self, _message_type: crate::packet::MessageType) -> Option<crate::priority::Priority> {
        None
    }
}

/// Bitmask result of the connection manager's per-module routing policy hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingDecision(pub u8);

impl RoutingDecision {
    pub const NONE: RoutingDecision = RoutingDecision(0);
    pub const BLOCK: RoutingDecision = RoutingDecision(1 << 0);

    #[must_use]
    pub fn or(self, other: RoutingDecision) -> RoutingDecision {
        RoutingDecision(self.0 | other.0)
    }

    #[must_use]
    pub fn is_blocked(self) -> bool {
        self.0 & Self::BLOCK.0 != 0
    }
}

// ---------------------------------------------------------------------------
// Reboot
// ---------------------------------------------------------------------------

/// Persisted (RAM-retained, CRC-guarded) reason for the most recent reboot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebootReason {
    Unknown,
    Watchdog,
    HardFault,
    StackOverflow,
    BleStackAssert,
    UserRequested,
}

/// Snapshot of handshake-relevant cluster state exchanged between two
/// endpoints of a mesh connection during the merge handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectedClusterSnapshot {
    pub cluster_id: ClusterId,
    pub cluster_size: i16,
    pub hops_to_sink: i16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_decision_or_combines_block() {
        let a = RoutingDecision::NONE;
        let b = RoutingDecision::BLOCK;
        assert!(a.or(b).is_blocked());
        assert!(!a.or(RoutingDecision::NONE).is_blocked());
    }

    #[test]
    fn module_id_core_uses_byte_as_record_id() {
        assert_eq!(ModuleId::Core(7).config_record_id(None), 7);
    }

    #[test]
    fn module_id_vendor_uses_assigned_slot() {
        let id = ModuleId::Vendor {
            prefix: 1,
            sub_id: 2,
            vendor_id: 0xBEEF,
        };
        assert_eq!(id.config_record_id(Some(501)), 501);
        assert_eq!(id.config_record_id(None), 500);
    }
}
