//! Cluster membership: the three-way merge handshake, steady-state
//! `CLUSTER_INFO_UPDATE` propagation, sink hop-count tracking, and the
//! master-bit arbitration that decides what happens to a node's cluster
//! identity when a mesh connection drops.

pub mod discovery;

use std::time::{Duration, Instant};

use mesh_core::{
    ClusterAck1, ClusterAck2, ClusterId, ClusterInfoUpdate, ClusterWelcome, DeviceType,
    JoinMePayload, NodeId,
};
use rand::Rng;

use crate::config::ClusteringConfig;
use crate::error::ClusterError;

pub use discovery::{Discovery, DiscoveryMode};

/// Supplies fresh `ClusterId`s. A trait seam so tests can pin the sequence
/// instead of depending on the system RNG.
pub trait ClusterIdSource: Send + Sync {
    fn next_cluster_id(&self) -> ClusterId;
}

/// Default source: a fresh random 32-bit id per call, same as the firmware's
/// `GenerateClusterID`.
#[derive(Debug, Default)]
pub struct RandomClusterIdSource;

impl ClusterIdSource for RandomClusterIdSource {
    fn next_cluster_id(&self) -> ClusterId {
        let mut rng = rand::rng();
        ClusterId(rng.random())
    }
}

/// Result of receiving a `CLUSTER_WELCOME`. The symmetric retry in
/// `WeAreBigger` mirrors `Connection::StartHandshake`'s behavior on an
/// inbound welcome: the bigger side answers with its own welcome rather than
/// sitting idle, so the protocol doesn't care which side opened the link.
#[derive(Debug, Clone, Copy)]
pub enum WelcomeOutcome {
    /// Partner's `cluster_id` collides with ours; the link must be dropped
    /// rather than merged.
    Reject(ClusterError),
    /// We are the bigger (or tied-and-lower-id) side: send our own welcome back.
    WeAreBigger { reply: ClusterWelcome },
    /// We are the smaller side: our cluster dissolves into a fresh singleton
    /// and we acknowledge with `ack1`.
    WeAreSmaller { ack1: ClusterAck1 },
}

/// One node's cluster membership state: identity, size, and distance to the
/// nearest sink, plus the discovery machinery that decides who to merge with
/// next.
pub struct Clusterer {
    config: ClusteringConfig,
    self_node_id: NodeId,
    device_type: DeviceType,
    cluster_id: ClusterId,
    cluster_size: i16,
    hops_to_sink: i16,
    discovery: Discovery,
    id_source: Box<dyn ClusterIdSource>,
    last_decision_at: Instant,
}

impl Clusterer {
    #[must_use]
    pub fn new(
        config: ClusteringConfig,
        self_node_id: NodeId,
        device_type: DeviceType,
        id_source: Box<dyn ClusterIdSource>,
        now: Instant,
    ) -> Self {
        let cluster_id = id_source.next_cluster_id();
        Self {
            discovery: Discovery::new(config, now),
            config,
            self_node_id,
            device_type,
            cluster_id,
            cluster_size: 1,
            hops_to_sink: if device_type.is_sink() { 1 } else { -1 },
            id_source,
            last_decision_at: now,
        }
    }

    #[must_use]
    pub fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    #[must_use]
    pub fn cluster_size(&self) -> i16 {
        self.cluster_size
    }

    #[must_use]
    pub fn hops_to_sink(&self) -> i16 {
        self.hops_to_sink
    }

    #[must_use]
    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    #[must_use]
    pub fn discovery_mut(&mut self) -> &mut Discovery {
        &mut self.discovery
    }

    /// Builds the `JoinMe` payload advertised while not full. Slot counts and
    /// radio parameters are supplied by the caller, which owns that state.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn join_me_payload(
        &self,
        free_in_connections: u8,
        free_out_connections: u8,
        battery_runtime: u8,
        tx_power_dbm: i8,
        mesh_write_handle: u16,
    ) -> JoinMePayload {
        JoinMePayload {
            sender: self.self_node_id,
            cluster_id: self.cluster_id,
            cluster_size: self.cluster_size,
            free_in_connections,
            free_out_connections,
            battery_runtime,
            tx_power_dbm,
            device_type: self.device_type,
            hops_to_sink: self.hops_to_sink,
            mesh_write_handle,
            ack_field: ClusterId(0),
        }
    }

    /// Feeds a decoded `JoinMe` payload into discovery. Returns `true` if the
    /// sender is a new candidate.
    pub fn on_advertisement(
        &mut self,
        addr: mesh_core::BleAddress,
        rssi_dbm: i8,
        payload: JoinMePayload,
        now: Instant,
    ) -> bool {
        self.discovery.on_advertisement(addr, rssi_dbm, payload, now)
    }

    pub fn prune_and_update_mode(&mut self, now: Instant) {
        self.discovery.prune_and_update_mode(now);
    }

    /// `true` once enough candidates or enough quiet time has passed to pick
    /// a connect target.
    #[must_use]
    pub fn should_decide(&self, now: Instant) -> bool {
        self.discovery.should_decide(now.duration_since(self.last_decision_at))
    }

    /// Picks the best candidate to connect to and resets the decision clock.
    /// Does not remove the candidate or touch backoff; the caller does that
    /// once it knows whether the connection attempt was even issued.
    pub fn decide(&mut self, now: Instant) -> Option<(mesh_core::BleAddress, JoinMePayload)> {
        self.last_decision_at = now;
        self.discovery
            .best_candidate(self.cluster_id, self.cluster_size, now)
    }

    pub fn on_connect_attempt_failed(&mut self, addr: mesh_core::BleAddress, now: Instant) {
        self.discovery.record_attempt_failure(addr, now);
    }

    pub fn on_connect_succeeded(&mut self, addr: mesh_core::BleAddress) {
        self.discovery.clear_backoff(addr);
        self.discovery.forget(addr);
    }

    /// Builds the `CLUSTER_WELCOME` we send to open a handshake on a freshly
    /// connected mesh link.
    #[must_use]
    pub fn begin_handshake(&self, mesh_write_handle: u16) -> ClusterWelcome {
        ClusterWelcome {
            sender: self.self_node_id,
            cluster_id: self.cluster_id,
            cluster_size: self.cluster_size,
            hops_to_sink: self.hops_to_sink,
            mesh_write_handle,
        }
    }

    /// Handles a received `CLUSTER_WELCOME`. "Bigger" means larger
    /// `cluster_size`, with `cluster_id` as the tiebreaker (lower id wins,
    /// mirroring `Connection::ReceivePacketHandler`'s comparison).
    pub fn on_cluster_welcome(&mut self, welcome: &ClusterWelcome, mesh_write_handle: u16) -> WelcomeOutcome {
        if welcome.cluster_id == self.cluster_id {
            return WelcomeOutcome::Reject(ClusterError::ClusterIdCollision);
        }

        let we_are_bigger = welcome.cluster_size < self.cluster_size
            || (welcome.cluster_size == self.cluster_size && welcome.cluster_id < self.cluster_id);

        if we_are_bigger {
            WelcomeOutcome::WeAreBigger {
                reply: self.begin_handshake(mesh_write_handle),
            }
        } else {
            self.cluster_id = self.id_source.next_cluster_id();
            self.cluster_size = 1;
            self.hops_to_sink = if self.device_type.is_sink() { 1 } else { -1 };
            WelcomeOutcome::WeAreSmaller {
                ack1: ClusterAck1 {
                    sender: self.self_node_id,
                    hops_to_sink: self.hops_to_sink,
                },
            }
        }
    }

    /// Handles a received `CLUSTER_ACK_1`: we are the bigger side, absorbing
    /// one new node. The caller is responsible for setting that connection's
    /// `master_bit = Some(true)`.
    #[must_use]
    pub fn on_cluster_ack1(&mut self, _ack1: &ClusterAck1) -> ClusterAck2 {
        self.cluster_size += 1;
        ClusterAck2 {
            cluster_id: self.cluster_id,
            cluster_size: self.cluster_size,
            hops_to_sink: self.hops_to_sink,
        }
    }

    /// Handles a received `CLUSTER_ACK_2`: we are the smaller side, adopting
    /// the surviving cluster identity. `other_hops` is every other mesh
    /// connection's last-known `hops_to_sink`, used to recompute ours
    /// alongside the new link's. The caller sets `master_bit = Some(false)`
    /// on this connection.
    pub fn on_cluster_ack2(&mut self, ack2: &ClusterAck2, other_hops: impl Iterator<Item = i16>) {
        self.cluster_id = ack2.cluster_id;
        self.cluster_size = ack2.cluster_size;
        self.hops_to_sink = self.compute_hops_to_sink(other_hops.chain(std::iter::once(ack2.hops_to_sink)));
    }

    /// Recomputes `hops_to_sink` from the `hops_to_sink` every live mesh
    /// connection last reported. Returns `true` if the value changed.
    pub fn recompute_hops_to_sink(&mut self, neighbor_hops: impl Iterator<Item = i16>) -> bool {
        let new = self.compute_hops_to_sink(neighbor_hops);
        let changed = new != self.hops_to_sink;
        self.hops_to_sink = new;
        changed
    }

    fn compute_hops_to_sink(&self, neighbor_hops: impl Iterator<Item = i16>) -> i16 {
        if self.device_type.is_sink() {
            return 1;
        }
        neighbor_hops
            .filter(|h| *h >= 0)
            .min()
            .map_or(-1, |h| h + 1)
    }

    /// Builds the steady-state update to send on every other mesh connection
    /// after `cluster_size` or `hops_to_sink` changes locally.
    #[must_use]
    pub fn build_info_update(&self, cluster_size_delta: i16, counter: u8) -> ClusterInfoUpdate {
        ClusterInfoUpdate {
            cluster_size_delta,
            hops_to_sink: self.hops_to_sink,
            counter: counter & ClusterInfoUpdate::COUNTER_MASK,
        }
    }

    /// Applies a received `CLUSTER_INFO_UPDATE`'s size delta. Clamps at 1
    /// with a telemetry counter rather than going negative or wrapping,
    /// since silently wrapping would corrupt every downstream hop's view of
    /// cluster size.
    pub fn apply_cluster_size_delta(&mut self, delta: i16) -> i16 {
        let mut new_size = i32::from(self.cluster_size) + i32::from(delta);
        if new_size < 1 {
            metrics::counter!("cluster_size_underflow_clamped").increment(1);
            new_size = 1;
        }
        self.cluster_size = new_size as i16;
        self.cluster_size
    }

    /// What happens to our cluster identity when a mesh connection drops.
    /// `master_bit` is that connection's arbitration bit; `None` means the
    /// handshake never completed on it, so it never contributed to our
    /// cluster size and nothing changes. `departing_size` is the last
    /// snapshot of the cluster that was on the other end of the link (used
    /// only when we keep our identity, to subtract its contribution).
    /// `remaining_hops` is every other still-live mesh connection's
    /// `hops_to_sink`.
    pub fn on_mesh_disconnect(
        &mut self,
        master_bit: Option<bool>,
        departing_size: i16,
        remaining_hops: impl Iterator<Item = i16>,
    ) -> DisconnectImpact {
        match master_bit {
            None => DisconnectImpact::Unaffected,
            // We were the smaller side on this link: it was our unique
            // upstream connection, since joining as the smaller side forces
            // every other mesh connection closed. Losing it dissolves us
            // back to a singleton.
            Some(false) => {
                self.cluster_id = self.id_source.next_cluster_id();
                self.cluster_size = 1;
                self.hops_to_sink = self.compute_hops_to_sink(remaining_hops);
                DisconnectImpact::Dissolved {
                    new_cluster_id: self.cluster_id,
                }
            }
            // We were the bigger side: keep our identity, shrink by what
            // that branch was carrying.
            Some(true) => {
                let contribution = departing_size.max(1);
                let before = self.cluster_size;
                let mut new_size = i32::from(self.cluster_size) - i32::from(contribution);
                if new_size < 1 {
                    metrics::counter!("cluster_size_underflow_clamped").increment(1);
                    new_size = 1;
                }
                self.cluster_size = new_size as i16;
                self.recompute_hops_to_sink(remaining_hops);
                DisconnectImpact::Shrunk {
                    delta: self.cluster_size - before,
                }
            }
        }
    }

    /// `adv_interval`/scan parameters to hand to the radio, per the current
    /// discovery mode.
    #[must_use]
    pub fn adv_interval(&self) -> Duration {
        self.discovery.adv_interval()
    }

    #[must_use]
    pub fn scan_window_and_interval(&self) -> (Duration, Duration) {
        self.discovery.scan_window_and_interval()
    }
}

/// Outcome of losing a mesh connection, from the cluster's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectImpact {
    /// The connection never finished the merge handshake; cluster state is unchanged.
    Unaffected,
    /// We dissolved back to a fresh singleton cluster.
    Dissolved { new_cluster_id: ClusterId },
    /// We kept our identity and shrank by the departing branch's size.
    Shrunk { delta: i16 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::BleAddress;

    struct FixedIdSource(std::sync::atomic::AtomicU32);

    impl FixedIdSource {
        fn new(start: u32) -> Self {
            Self(std::sync::atomic::AtomicU32::new(start))
        }
    }

    impl ClusterIdSource for FixedIdSource {
        fn next_cluster_id(&self) -> ClusterId {
            ClusterId(self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst))
        }
    }

    fn clusterer(node_id: u16, device_type: DeviceType) -> Clusterer {
        Clusterer::new(
            ClusteringConfig::default(),
            NodeId(node_id),
            device_type,
            Box::new(FixedIdSource::new(100)),
            Instant::now(),
        )
    }

    #[test]
    fn new_node_starts_as_singleton() {
        let c = clusterer(1, DeviceType::Node);
        assert_eq!(c.cluster_size(), 1);
        assert_eq!(c.hops_to_sink(), -1);
        assert_eq!(c.cluster_id(), ClusterId(100));
    }

    #[test]
    fn sink_device_starts_with_hops_one() {
        let c = clusterer(1, DeviceType::Sink);
        assert_eq!(c.hops_to_sink(), 1);
    }

    #[test]
    fn welcome_with_matching_cluster_id_is_rejected() {
        let mut c = clusterer(1, DeviceType::Node);
        let welcome = ClusterWelcome {
            sender: NodeId(2),
            cluster_id: c.cluster_id(),
            cluster_size: 1,
            hops_to_sink: -1,
            mesh_write_handle: 0x20,
        };
        assert!(matches!(
            c.on_cluster_welcome(&welcome, 0x20),
            WelcomeOutcome::Reject(ClusterError::ClusterIdCollision)
        ));
    }

    #[test]
    fn smaller_partner_welcome_makes_us_bigger() {
        let mut c = clusterer(1, DeviceType::Node);
        let welcome = ClusterWelcome {
            sender: NodeId(2),
            cluster_id: ClusterId(999),
            cluster_size: 1,
            hops_to_sink: -1,
            mesh_write_handle: 0x21,
        };
        match c.on_cluster_welcome(&welcome, 0x22) {
            WelcomeOutcome::WeAreBigger { reply } => {
                assert_eq!(reply.cluster_id, c.cluster_id());
                assert_eq!(reply.mesh_write_handle, 0x22);
            }
            other => panic!("expected WeAreBigger, got {other:?}"),
        }
    }

    #[test]
    fn bigger_partner_welcome_makes_us_smaller_and_dissolves() {
        let mut c = clusterer(1, DeviceType::Node);
        let original_id = c.cluster_id();
        let welcome = ClusterWelcome {
            sender: NodeId(2),
            cluster_id: ClusterId(999),
            cluster_size: 10,
            hops_to_sink: 2,
            mesh_write_handle: 0x21,
        };
        match c.on_cluster_welcome(&welcome, 0x22) {
            WelcomeOutcome::WeAreSmaller { ack1 } => {
                assert_eq!(ack1.sender, NodeId(1));
            }
            other => panic!("expected WeAreSmaller, got {other:?}"),
        }
        assert_ne!(c.cluster_id(), original_id);
        assert_eq!(c.cluster_size(), 1);
    }

    #[test]
    fn tied_size_breaks_ties_on_lower_cluster_id() {
        let mut c = clusterer(1, DeviceType::Node);
        let higher_id = ClusterId(c.cluster_id().0 + 1);
        let welcome = ClusterWelcome {
            sender: NodeId(2),
            cluster_id: higher_id,
            cluster_size: 1,
            hops_to_sink: -1,
            mesh_write_handle: 0x21,
        };
        assert!(matches!(
            c.on_cluster_welcome(&welcome, 0x22),
            WelcomeOutcome::WeAreBigger { .. }
        ));
    }

    #[test]
    fn ack1_grows_cluster_size_and_echoes_identity() {
        let mut c = clusterer(1, DeviceType::Node);
        let ack1 = ClusterAck1 {
            sender: NodeId(2),
            hops_to_sink: -1,
        };
        let ack2 = c.on_cluster_ack1(&ack1);
        assert_eq!(c.cluster_size(), 2);
        assert_eq!(ack2.cluster_id, c.cluster_id());
        assert_eq!(ack2.cluster_size, 2);
    }

    #[test]
    fn ack2_adopts_surviving_identity_and_hops() {
        let mut c = clusterer(1, DeviceType::Node);
        let ack2 = ClusterAck2 {
            cluster_id: ClusterId(42),
            cluster_size: 5,
            hops_to_sink: 1,
        };
        c.on_cluster_ack2(&ack2, std::iter::empty());
        assert_eq!(c.cluster_id(), ClusterId(42));
        assert_eq!(c.cluster_size(), 5);
        assert_eq!(c.hops_to_sink(), 2);
    }

    #[test]
    fn hops_to_sink_is_one_plus_minimum_neighbor() {
        let mut c = clusterer(1, DeviceType::Node);
        let changed = c.recompute_hops_to_sink([5, -1, 2, 9].into_iter());
        assert!(changed);
        assert_eq!(c.hops_to_sink(), 3);
    }

    #[test]
    fn hops_to_sink_unknown_when_no_neighbor_knows() {
        let mut c = clusterer(1, DeviceType::Node);
        c.recompute_hops_to_sink([-1, -1].into_iter());
        assert_eq!(c.hops_to_sink(), -1);
    }

    #[test]
    fn sink_device_ignores_neighbor_hops() {
        let mut c = clusterer(1, DeviceType::Sink);
        c.recompute_hops_to_sink([0].into_iter());
        assert_eq!(c.hops_to_sink(), 1);
    }

    #[test]
    fn info_update_delta_is_applied() {
        let mut c = clusterer(1, DeviceType::Node);
        c.apply_cluster_size_delta(4);
        assert_eq!(c.cluster_size(), 5);
        c.apply_cluster_size_delta(-2);
        assert_eq!(c.cluster_size(), 3);
    }

    #[test]
    fn info_update_delta_clamps_at_one() {
        let mut c = clusterer(1, DeviceType::Node);
        c.apply_cluster_size_delta(-100);
        assert_eq!(c.cluster_size(), 1);
    }

    #[test]
    fn losing_master_bit_false_connection_dissolves_us() {
        let mut c = clusterer(1, DeviceType::Node);
        let ack2 = ClusterAck2 {
            cluster_id: ClusterId(42),
            cluster_size: 5,
            hops_to_sink: 1,
        };
        c.on_cluster_ack2(&ack2, std::iter::empty());
        let original = c.cluster_id();
        let impact = c.on_mesh_disconnect(Some(false), 0, std::iter::empty());
        assert!(matches!(impact, DisconnectImpact::Dissolved { .. }));
        assert_ne!(c.cluster_id(), original);
        assert_eq!(c.cluster_size(), 1);
    }

    #[test]
    fn losing_master_bit_true_connection_shrinks_us() {
        let mut c = clusterer(1, DeviceType::Node);
        let ack1 = ClusterAck1 { sender: NodeId(2), hops_to_sink: -1 };
        c.on_cluster_ack1(&ack1);
        c.apply_cluster_size_delta(8);
        assert_eq!(c.cluster_size(), 10);
        let impact = c.on_mesh_disconnect(Some(true), 3, std::iter::empty());
        assert_eq!(impact, DisconnectImpact::Shrunk { delta: -3 });
        assert_eq!(c.cluster_size(), 7);
    }

    #[test]
    fn shrink_below_one_is_clamped() {
        let mut c = clusterer(1, DeviceType::Node);
        let impact = c.on_mesh_disconnect(Some(true), 50, std::iter::empty());
        assert_eq!(impact, DisconnectImpact::Shrunk { delta: 0 });
        assert_eq!(c.cluster_size(), 1);
    }

    #[test]
    fn unfinished_handshake_disconnect_is_unaffected() {
        let mut c = clusterer(1, DeviceType::Node);
        let size_before = c.cluster_size();
        let impact = c.on_mesh_disconnect(None, 0, std::iter::empty());
        assert_eq!(impact, DisconnectImpact::Unaffected);
        assert_eq!(c.cluster_size(), size_before);
    }

    #[test]
    fn join_me_payload_reflects_current_state() {
        let c = clusterer(7, DeviceType::Node);
        let payload = c.join_me_payload(2, 3, 200, -4, 0x20);
        assert_eq!(payload.sender, NodeId(7));
        assert_eq!(payload.cluster_id, c.cluster_id());
        assert_eq!(payload.cluster_size, c.cluster_size());
    }

    #[test]
    fn decide_respects_candidate_pool() {
        let mut c = clusterer(1, DeviceType::Node);
        let now = Instant::now();
        assert!(c.decide(now).is_none());
        c.on_advertisement(
            BleAddress([9; 6]),
            -50,
            JoinMePayload {
                sender: NodeId(9),
                cluster_id: ClusterId(5),
                cluster_size: 1,
                free_in_connections: 2,
                free_out_connections: 2,
                battery_runtime: 100,
                tx_power_dbm: -4,
                device_type: DeviceType::Node,
                hops_to_sink: -1,
                mesh_write_handle: 0x20,
                ack_field: ClusterId(0),
            },
            now,
        );
        let (addr, payload) = c.decide(now).unwrap();
        assert_eq!(addr, BleAddress([9; 6]));
        assert_eq!(payload.sender, NodeId(9));
    }
}
