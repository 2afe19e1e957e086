//! A single connection's full runtime record: identity, lifecycle state,
//! send/receive pipeline, and the bookkeeping the cluster-merge handshake
//! and RSSI-driven scoring need.

pub mod state;

use std::time::{Duration, Instant};

use mesh_core::{
    AppDisconnectReason, BleAddress, ConnHandle, ConnectedClusterSnapshot, HciDisconnectReason,
    NodeId, UniqueConnectionId,
};

pub use state::{ConnectionState, DisconnectOutcome, IllegalTransition};

use crate::config::PacketQueueConfig;
use crate::packet_queue::PacketQueue;

/// Which side opened the link. Mirrors the radio's GAP central/peripheral role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We initiated the GAP connection (we are GAP central).
    Central,
    /// The radio accepted an inbound connection (we are GAP peripheral).
    Peripheral,
}

/// What kind of traffic this connection is reserved for. Mesh connections
/// participate in clustering; app connections (MeshAccess) do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Mesh,
    App,
}

/// Exponential moving average of RSSI, scaled by 1000, with the
/// round-to-nearest read rule from `BaseConnection::GetAverageRSSI`.
#[derive(Debug, Clone, Copy)]
pub struct RssiTracker {
    ema_millidbm: i32,
    initialized: bool,
    last_sample_at: Option<Instant>,
}

impl RssiTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ema_millidbm: 0,
            initialized: false,
            last_sample_at: None,
        }
    }

    /// Smoothing weight given to each new sample: `1/ALPHA_DENOM`.
    const ALPHA_DENOM: i32 = 4;

    pub fn sample(&mut self, rssi_dbm: i8, now: Instant) {
        let sample = i32::from(rssi_dbm) * 1000;
        self.ema_millidbm = if self.initialized {
            self.ema_millidbm + (sample - self.ema_millidbm) / Self::ALPHA_DENOM
        } else {
            self.initialized = true;
            sample
        };
        self.last_sample_at = Some(now);
    }

    /// Rounded dBm reading, or `None` if no sample has ever landed or the
    /// most recent one is older than `max_age` (the connection's lifetime).
    #[must_use]
    pub fn average_dbm(&self, now: Instant, max_age: Duration) -> Option<i8> {
        let last = self.last_sample_at?;
        if now.duration_since(last) > max_age {
            return None;
        }
        if !self.initialized {
            return None;
        }
        let divisor = 1000;
        let rounded = if self.ema_millidbm < 0 {
            (self.ema_millidbm - divisor / 2) / divisor
        } else {
            (self.ema_millidbm + divisor / 2) / divisor
        };
        Some(rounded.clamp(i32::from(i8::MIN), i32::from(i8::MAX)) as i8)
    }
}

impl Default for RssiTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// The 3-bit cluster-update counter pair used to detect and drop duplicate
/// or replayed `CLUSTER_INFO_UPDATE`s on a reestablished link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusterUpdateCounters {
    pub outgoing: u8,
    pub next_expected_incoming: u8,
}

const COUNTER_MASK: u8 = 0b111;

impl ClusterUpdateCounters {
    #[must_use]
    pub fn next_outgoing(&mut self) -> u8 {
        let value = self.outgoing;
        self.outgoing = (self.outgoing + 1) & COUNTER_MASK;
        value
    }

    /// `true` if `counter` is the expected next incoming value; advances the
    /// expectation either way is the caller's job (only advance on accept).
    #[must_use]
    pub fn accepts(&self, counter: u8) -> bool {
        (counter & COUNTER_MASK) == self.next_expected_incoming
    }

    pub fn advance_incoming(&mut self) {
        self.next_expected_incoming = (self.next_expected_incoming + 1) & COUNTER_MASK;
    }
}

/// One connection's complete runtime record.
pub struct Connection {
    pub id: UniqueConnectionId,
    pub direction: Direction,
    pub kind: ConnectionKind,
    pub peer_addr: BleAddress,
    pub partner_node_id: Option<NodeId>,
    pub handle: Option<ConnHandle>,
    pub state: ConnectionState,
    pub mtu: u16,
    pub queue: PacketQueue,
    pub rssi: RssiTracker,
    pub created_at: Instant,
    pub disconnected_at: Option<Instant>,
    pub handshake_started_at: Option<Instant>,
    pub disconnect_reason: Option<(Option<HciDisconnectReason>, AppDisconnectReason)>,
    /// Arbitration tiebreaker assigned during the cluster-merge handshake;
    /// `None` until the handshake assigns it.
    pub master_bit: Option<bool>,
    pub cluster_snapshot: Option<ConnectedClusterSnapshot>,
    pub cluster_update_counters: ClusterUpdateCounters,
}

impl Connection {
    #[must_use]
    pub fn new_outbound(
        id: UniqueConnectionId,
        kind: ConnectionKind,
        peer_addr: BleAddress,
        default_mtu: u16,
        queue_config: PacketQueueConfig,
        now: Instant,
    ) -> Self {
        Self {
            id,
            direction: Direction::Central,
            kind,
            peer_addr,
            partner_node_id: None,
            handle: None,
            state: ConnectionState::Connecting,
            mtu: default_mtu,
            queue: PacketQueue::new(queue_config),
            rssi: RssiTracker::new(),
            created_at: now,
            disconnected_at: None,
            handshake_started_at: None,
            disconnect_reason: None,
            master_bit: None,
            cluster_snapshot: None,
            cluster_update_counters: ClusterUpdateCounters::default(),
        }
    }

    #[must_use]
    pub fn new_inbound(
        id: UniqueConnectionId,
        kind: ConnectionKind,
        peer_addr: BleAddress,
        handle: ConnHandle,
        default_mtu: u16,
        queue_config: PacketQueueConfig,
        now: Instant,
    ) -> Self {
        Self {
            id,
            direction: Direction::Peripheral,
            kind,
            peer_addr,
            partner_node_id: None,
            handle: Some(handle),
            state: ConnectionState::Connected,
            mtu: default_mtu,
            queue: PacketQueue::new(queue_config),
            rssi: RssiTracker::new(),
            created_at: now,
            disconnected_at: None,
            handshake_started_at: None,
            disconnect_reason: None,
            master_bit: None,
            cluster_snapshot: None,
            cluster_update_counters: ClusterUpdateCounters::default(),
        }
    }

    #[must_use]
    pub fn is_mesh(&self) -> bool {
        matches!(self.kind, ConnectionKind::Mesh)
    }

    pub fn disconnect(
        &mut self,
        hci_reason: Option<HciDisconnectReason>,
        app_reason: AppDisconnectReason,
        now: Instant,
    ) {
        self.state = self.state.on_disconnect();
        self.disconnected_at = Some(now);
        self.disconnect_reason = Some((hci_reason, app_reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rssi_ema_converges_toward_samples() {
        let mut r = RssiTracker::new();
        let t0 = Instant::now();
        for _ in 0..50 {
            r.sample(-60, t0);
        }
        assert_eq!(r.average_dbm(t0, Duration::from_secs(60)), Some(-60));
    }

    #[test]
    fn rssi_stale_sample_is_discarded() {
        let mut r = RssiTracker::new();
        let t0 = Instant::now();
        r.sample(-60, t0);
        let later = t0 + Duration::from_secs(120);
        assert_eq!(r.average_dbm(later, Duration::from_secs(60)), None);
    }

    #[test]
    fn cluster_update_counters_wrap_at_three_bits() {
        let mut c = ClusterUpdateCounters::default();
        for expected in 0..8u8 {
            assert_eq!(c.next_outgoing(), expected);
        }
        assert_eq!(c.next_outgoing(), 0);
    }

    #[test]
    fn cluster_update_counters_reject_out_of_window() {
        let mut c = ClusterUpdateCounters::default();
        assert!(c.accepts(0));
        assert!(!c.accepts(1));
        c.advance_incoming();
        assert!(c.accepts(1));
    }
}
