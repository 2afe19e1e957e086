//! Owns the connection table, arbitrates slot budgets, dispatches radio
//! events to the right connection, and implements the inbound routing
//! policy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use mesh_core::{
    AppDisconnectReason, BleAddress, ConnHandle, HciDisconnectReason, MeshMessageReceived,
    MessageType, Module, NodeId, PacketHeader, RoutingDecision, UniqueConnectionId,
};
use tracing::{info, instrument, warn};

use crate::config::{ConnectionManagerConfig, PacketQueueConfig};
use crate::connection::{Connection, ConnectionKind, ConnectionState, Direction};
use crate::error::ConnectionError;

/// What the connection manager wants done with one inbound message, after
/// its own routing policy and every module's `routing_decision` hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub dispatch_locally: bool,
    /// Connections to re-send the (possibly hop-decremented) message on.
    pub forward_to: Vec<UniqueConnectionId>,
    /// Receiver field to use when forwarding (differs from the inbound
    /// header on hop-limited messages, which are decremented at each relay).
    pub forward_receiver: NodeId,
}

impl RouteDecision {
    fn drop() -> Self {
        Self {
            dispatch_locally: false,
            forward_to: Vec::new(),
            forward_receiver: NodeId::INVALID,
        }
    }
}

/// A disconnect the manager just processed, for the clustering service to
/// react to (master-bit dissolve, reestablishment bookkeeping).
#[derive(Debug, Clone)]
pub struct DisconnectNotice {
    pub connection_id: UniqueConnectionId,
    pub was_mesh: bool,
    pub was_handshake_done: bool,
    pub master_bit: Option<bool>,
    pub entering_reestablish: bool,
    /// `connected_cluster_size` last snapshotted on this connection, i.e.
    /// the size of the subtree that just departed. `1` if no snapshot was
    /// ever recorded (handshake never completed).
    pub departing_cluster_size: i16,
}

/// Table of active/pending connections plus the radio-facing dispatch logic.
pub struct ConnectionManager {
    config: ConnectionManagerConfig,
    queue_config: PacketQueueConfig,
    connections: HashMap<UniqueConnectionId, Connection>,
    handle_index: HashMap<ConnHandle, UniqueConnectionId>,
    pending_outbound: HashMap<BleAddress, UniqueConnectionId>,
    next_id: u32,
    self_node_id: NodeId,
    self_is_sink: bool,
    modules: Vec<Arc<dyn Module>>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(config: ConnectionManagerConfig, queue_config: PacketQueueConfig, self_node_id: NodeId) -> Self {
        Self::new_with_device_type(config, queue_config, self_node_id, false)
    }

    /// As [`Self::new`], but records whether this node is a `Sink` so
    /// `NODE_ID_SHORTEST_SINK` routing can dispatch locally instead of
    /// forwarding (spec.md 4.4's `self.device_type == Sink` rule).
    #[must_use]
    pub fn new_with_device_type(
        config: ConnectionManagerConfig,
        queue_config: PacketQueueConfig,
        self_node_id: NodeId,
        self_is_sink: bool,
    ) -> Self {
        Self {
            config,
            queue_config,
            connections: HashMap::new(),
            handle_index: HashMap::new(),
            pending_outbound: HashMap::new(),
            next_id: 1,
            self_node_id,
            self_is_sink,
            modules: Vec::new(),
        }
    }

    pub fn register_module(&mut self, module: Arc<dyn Module>) {
        self.modules.push(module);
    }

    #[must_use]
    pub fn get(&self, id: UniqueConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: UniqueConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    #[must_use]
    pub fn iter(&self) -> impl Iterator<Item = (&UniqueConnectionId, &Connection)> {
        self.connections.iter()
    }

    fn count(&self, direction: Direction, kind: ConnectionKind) -> usize {
        self.connections
            .values()
            .filter(|c| c.direction == direction && c.kind == kind && !c.state.is_terminal())
            .count()
    }

    fn total_count(&self) -> usize {
        self.connections.values().filter(|c| !c.state.is_terminal()).count()
    }

    fn issue_id(&mut self) -> UniqueConnectionId {
        let id = UniqueConnectionId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Reserves an outbound mesh/app slot and hands the caller a connection
    /// id in `Connecting` state. The caller is responsible for actually
    /// calling `RadioTransport::bt_connect`.
    ///
    /// # Errors
    /// `NoFreeSlot` if the relevant out-slot budget, or the total connection
    /// budget, is already exhausted.
    #[instrument(skip(self))]
    pub fn request_connect(
        &mut self,
        peer_addr: BleAddress,
        kind: ConnectionKind,
        now: Instant,
    ) -> Result<UniqueConnectionId, ConnectionError> {
        if self.total_count() >= self.config.max_total_connections as usize {
            return Err(ConnectionError::NoFreeSlot);
        }
        match kind {
            ConnectionKind::Mesh => {
                if self.count(Direction::Central, ConnectionKind::Mesh)
                    >= self.config.max_mesh_out_connections as usize
                {
                    return Err(ConnectionError::NoFreeSlot);
                }
            }
            ConnectionKind::App => return Err(ConnectionError::NoFreeSlot), // app connections are inbound-only
        }

        let id = self.issue_id();
        let conn = Connection::new_outbound(
            id,
            kind,
            peer_addr,
            self.queue_config.max_mtu,
            self.queue_config,
            now,
        );
        self.connections.insert(id, conn);
        self.pending_outbound.insert(peer_addr, id);
        Ok(id)
    }

    /// Accepts a radio-reported inbound connection into a free mesh or app
    /// in-slot, per whichever GATT service the peer wrote to.
    ///
    /// # Errors
    /// `NoFreeSlot` if the relevant in-slot budget is exhausted.
    #[instrument(skip(self))]
    pub fn accept_inbound(
        &mut self,
        peer_addr: BleAddress,
        handle: ConnHandle,
        kind: ConnectionKind,
        now: Instant,
    ) -> Result<UniqueConnectionId, ConnectionError> {
        if self.total_count() >= self.config.max_total_connections as usize {
            return Err(ConnectionError::NoFreeSlot);
        }
        let limit = match kind {
            ConnectionKind::Mesh => self.config.max_mesh_in_connections as usize,
            ConnectionKind::App => self.config.max_app_in_connections as usize,
        };
        if self.count(Direction::Peripheral, kind) >= limit {
            return Err(ConnectionError::NoFreeSlot);
        }

        let id = self.issue_id();
        let conn = Connection::new_inbound(
            id,
            kind,
            peer_addr,
            handle,
            self.queue_config.max_mtu,
            self.queue_config,
            now,
        );
        self.connections.insert(id, conn);
        self.handle_index.insert(handle, id);
        Ok(id)
    }

    /// Resolves a radio `Connected` event: either completes a pending
    /// outbound request or, if none matches, treats it as an inbound accept
    /// for mesh connections (the default service).
    pub fn on_radio_connected(&mut self, peer_addr: BleAddress, handle: ConnHandle, now: Instant) -> Option<UniqueConnectionId> {
        if let Some(id) = self.pending_outbound.remove(&peer_addr) {
            self.handle_index.insert(handle, id);
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.handle = Some(handle);
                if let Ok(next) = conn.state.on_radio_connected() {
                    conn.state = next;
                } else {
                    warn!(?id, "connection manager: unexpected radio_connected for outbound link");
                }
                return Some(id);
            }
            None
        } else {
            self.accept_inbound(peer_addr, handle, ConnectionKind::Mesh, now).ok()
        }
    }

    /// Resolves a radio `Disconnected` event and transitions the connection,
    /// either into `Reestablishing` (mesh connections that had completed
    /// handshake, within the extended timeout) or straight to `Disconnected`.
    pub fn on_radio_disconnected(
        &mut self,
        handle: ConnHandle,
        hci_reason: HciDisconnectReason,
        now: Instant,
    ) -> Option<DisconnectNotice> {
        let id = *self.handle_index.get(&handle)?;
        let conn = self.connections.get_mut(&id)?;
        let was_handshake_done = matches!(conn.state, ConnectionState::HandshakeDone);
        let was_mesh = conn.is_mesh();
        let master_bit = conn.master_bit;
        let departing_cluster_size = conn.cluster_snapshot.map_or(1, |s| s.cluster_size);

        let entering_reestablish = was_mesh
            && was_handshake_done
            && conn.state.on_transport_lost_recoverable().is_ok();

        if entering_reestablish {
            conn.state = ConnectionState::Reestablishing;
            conn.disconnected_at = Some(now);
        } else {
            conn.disconnect(Some(hci_reason), AppDisconnectReason::RemoteInitiated, now);
        }
        self.handle_index.remove(&handle);

        Some(DisconnectNotice {
            connection_id: id,
            was_mesh,
            was_handshake_done,
            master_bit,
            entering_reestablish,
            departing_cluster_size,
        })
    }

    /// Forces a connection closed locally (handshake timeout, too many send
    /// retries, explicit shutdown, ...).
    pub fn force_disconnect(&mut self, id: UniqueConnectionId, reason: AppDisconnectReason, now: Instant) {
        if let Some(conn) = self.connections.get_mut(&id) {
            info!(?id, ?reason, "connection manager: force disconnect");
            conn.disconnect(None, reason, now);
            if let Some(handle) = conn.handle {
                self.handle_index.remove(&handle);
            }
        }
    }

    /// Sweeps handshake and reestablish-window timeouts. Returns the ids of
    /// connections that just timed out, with a typed reason, so the caller
    /// can tell the radio to tear down the link and clustering to react.
    pub fn sweep_timeouts(&mut self, now: Instant) -> Vec<(UniqueConnectionId, AppDisconnectReason)> {
        let mut timed_out = Vec::new();
        for (id, conn) in &mut self.connections {
            match conn.state {
                ConnectionState::Handshaking | ConnectionState::ReestablishingHandshake => {
                    if let Some(started) = conn.handshake_started_at {
                        if now.duration_since(started) > self.config.mesh_handshake_timeout {
                            conn.disconnect(None, AppDisconnectReason::HandshakeTimeout, now);
                            timed_out.push((*id, AppDisconnectReason::HandshakeTimeout));
                        }
                    }
                }
                ConnectionState::Reestablishing => {
                    if let Some(disconnected) = conn.disconnected_at {
                        if now.duration_since(disconnected) > self.config.mesh_extended_connection_timeout {
                            conn.disconnect(None, AppDisconnectReason::RemoteInitiated, now);
                            timed_out.push((*id, AppDisconnectReason::RemoteInitiated));
                        }
                    }
                }
                _ => {}
            }
        }
        timed_out
    }

    /// Drops fully `Disconnected` entries whose queues are empty.
    pub fn reap_disconnected(&mut self) {
        self.connections
            .retain(|_, conn| !conn.state.is_terminal() || conn.queue.is_buffer_full());
    }

    // -----------------------------------------------------------------
    // Inbound routing
    // -----------------------------------------------------------------

    /// Computes the routing decision for one reassembled, decrypted message,
    /// per the rules in 4.4, then folds in every registered module's
    /// `routing_decision` veto.
    #[must_use]
    pub fn route_inbound(&self, from: UniqueConnectionId, header: PacketHeader) -> RouteDecision {
        if header.message_type == MessageType::CLUSTER_INFO_UPDATE {
            // Consumed by the connection state machine / clustering service
            // directly; never blindly forwarded.
            return RouteDecision::drop();
        }

        let mut decision = self.base_route(from, header.receiver);

        if decision.dispatch_locally || !decision.forward_to.is_empty() {
            let message = MeshMessageReceived {
                connection: from,
                message_type: header.message_type,
                sender: header.sender,
                receiver: header.receiver,
                data: Vec::new(),
            };
            let mut blocked = RoutingDecision::NONE;
            for module in &self.modules {
                blocked = blocked.or(module.routing_decision(&message));
            }
            if blocked.is_blocked() {
                return RouteDecision::drop();
            }
        }
        decision.forward_to.retain(|id| *id != from);
        decision
    }

    fn base_route(&self, from: UniqueConnectionId, receiver: NodeId) -> RouteDecision {
        if receiver == self.self_node_id {
            return RouteDecision {
                dispatch_locally: true,
                forward_to: Vec::new(),
                forward_receiver: receiver,
            };
        }

        if receiver.is_broadcast() {
            return RouteDecision {
                dispatch_locally: true,
                forward_to: self.other_mesh_connections(from),
                forward_receiver: receiver,
            };
        }

        if receiver.is_hop_limited() {
            let dispatch_locally = receiver.0 <= NodeId::HOPS_BASE + 1;
            let decremented = receiver.0 - 1;
            let forward_to = if decremented > NodeId::HOPS_BASE {
                self.other_mesh_connections(from)
            } else {
                Vec::new()
            };
            return RouteDecision {
                dispatch_locally,
                forward_to,
                forward_receiver: NodeId(decremented),
            };
        }

        if receiver.is_shortest_sink() {
            if self.self_is_sink {
                return RouteDecision {
                    dispatch_locally: true,
                    forward_to: Vec::new(),
                    forward_receiver: receiver,
                };
            }
            if let Some(best) = self.connection_with_smallest_hops_to_sink(from) {
                return RouteDecision {
                    dispatch_locally: false,
                    forward_to: vec![best],
                    forward_receiver: receiver,
                };
            }
            return RouteDecision::drop();
        }

        // Unknown destination: flood.
        RouteDecision {
            dispatch_locally: false,
            forward_to: self.other_mesh_connections(from),
            forward_receiver: receiver,
        }
    }

    fn other_mesh_connections(&self, from: UniqueConnectionId) -> Vec<UniqueConnectionId> {
        self.connections
            .iter()
            .filter(|(id, c)| **id != from && c.is_mesh() && c.state.is_data_ready())
            .map(|(id, _)| *id)
            .collect()
    }

    fn connection_with_smallest_hops_to_sink(&self, from: UniqueConnectionId) -> Option<UniqueConnectionId> {
        self.connections
            .iter()
            .filter(|(id, c)| **id != from && c.is_mesh() && c.state.is_data_ready())
            .filter_map(|(id, c)| {
                c.cluster_snapshot
                    .filter(|s| s.hops_to_sink >= 0)
                    .map(|s| (*id, s.hops_to_sink))
            })
            .min_by_key(|(id, hops)| (*hops, id.0))
            .map(|(id, _)| id)
    }

    // -----------------------------------------------------------------
    // RSSI
    // -----------------------------------------------------------------

    pub fn note_rssi(&mut self, handle: ConnHandle, rssi_dbm: i8, now: Instant) {
        if let Some(id) = self.handle_index.get(&handle) {
            if let Some(conn) = self.connections.get_mut(id) {
                conn.rssi.sample(rssi_dbm, now);
            }
        }
    }

    /// Free outbound mesh slots, for the `JoinMe` payload this node advertises.
    #[must_use]
    pub fn free_mesh_out_slots(&self) -> u8 {
        self.config
            .max_mesh_out_connections
            .saturating_sub(self.count(Direction::Central, ConnectionKind::Mesh) as u8)
    }

    /// Free inbound mesh slots, for the `JoinMe` payload this node advertises.
    #[must_use]
    pub fn free_mesh_in_slots(&self) -> u8 {
        self.config
            .max_mesh_in_connections
            .saturating_sub(self.count(Direction::Peripheral, ConnectionKind::Mesh) as u8)
    }

    /// Resolves a connection id to its radio handle, e.g. to send on it.
    #[must_use]
    pub fn handle_of(&self, id: UniqueConnectionId) -> Option<ConnHandle> {
        self.connections.get(&id).and_then(|c| c.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::BleAddress;

    fn addr(byte: u8) -> BleAddress {
        BleAddress([byte; 6])
    }

    fn manager() -> ConnectionManager {
        ConnectionManager::new(
            ConnectionManagerConfig::default(),
            PacketQueueConfig::default(),
            NodeId(1),
        )
    }

    #[test]
    fn out_slot_budget_is_enforced() {
        let mut mgr = manager();
        let now = Instant::now();
        for i in 0..ConnectionManagerConfig::default().max_mesh_out_connections {
            assert!(mgr.request_connect(addr(i), ConnectionKind::Mesh, now).is_ok());
        }
        assert_eq!(
            mgr.request_connect(addr(99), ConnectionKind::Mesh, now),
            Err(ConnectionError::NoFreeSlot)
        );
    }

    #[test]
    fn broadcast_dispatches_locally_and_floods_other_connections() {
        let mut mgr = manager();
        let now = Instant::now();
        let a = mgr.request_connect(addr(1), ConnectionKind::Mesh, now).unwrap();
        let b = mgr.request_connect(addr(2), ConnectionKind::Mesh, now).unwrap();
        for id in [a, b] {
            let conn = mgr.get_mut(id).unwrap();
            conn.state = ConnectionState::HandshakeDone;
        }

        let header = PacketHeader {
            message_type: MessageType(50),
            sender: NodeId(7),
            receiver: NodeId::BROADCAST,
        };
        let decision = mgr.route_inbound(a, header);
        assert!(decision.dispatch_locally);
        assert_eq!(decision.forward_to, vec![b]);
    }

    #[test]
    fn local_receiver_does_not_forward() {
        let mgr = manager();
        let header = PacketHeader {
            message_type: MessageType(50),
            sender: NodeId(7),
            receiver: NodeId(1),
        };
        let decision = mgr.route_inbound(UniqueConnectionId(999), header);
        assert!(decision.dispatch_locally);
        assert!(decision.forward_to.is_empty());
    }

    #[test]
    fn hop_limited_decrements_and_stops_at_budget() {
        let mut mgr = manager();
        let now = Instant::now();
        let a = mgr.request_connect(addr(1), ConnectionKind::Mesh, now).unwrap();
        let b = mgr.request_connect(addr(2), ConnectionKind::Mesh, now).unwrap();
        mgr.get_mut(a).unwrap().state = ConnectionState::HandshakeDone;
        mgr.get_mut(b).unwrap().state = ConnectionState::HandshakeDone;

        let header = PacketHeader {
            message_type: MessageType(50),
            sender: NodeId(7),
            receiver: NodeId(NodeId::HOPS_BASE + 2),
        };
        let decision = mgr.route_inbound(a, header);
        assert!(!decision.dispatch_locally);
        assert_eq!(decision.forward_receiver, NodeId(NodeId::HOPS_BASE + 1));
        assert!(decision.forward_to.contains(&b));

        let exhausted = PacketHeader {
            receiver: NodeId(NodeId::HOPS_BASE + 1),
            ..header
        };
        let decision = mgr.route_inbound(a, exhausted);
        assert!(decision.dispatch_locally);
        assert!(decision.forward_to.is_empty());
    }

    #[test]
    fn shortest_sink_forwards_on_smallest_hop_connection_when_not_a_sink() {
        let mut mgr = manager();
        let now = Instant::now();
        let a = mgr.request_connect(addr(1), ConnectionKind::Mesh, now).unwrap();
        let b = mgr.request_connect(addr(2), ConnectionKind::Mesh, now).unwrap();
        let c = mgr.request_connect(addr(3), ConnectionKind::Mesh, now).unwrap();
        for (id, hops) in [(a, 3), (b, 1), (c, 2)] {
            let conn = mgr.get_mut(id).unwrap();
            conn.state = ConnectionState::HandshakeDone;
            conn.cluster_snapshot = Some(mesh_core::ConnectedClusterSnapshot {
                cluster_id: mesh_core::ClusterId(0),
                cluster_size: 1,
                hops_to_sink: hops,
            });
        }

        let header = PacketHeader {
            message_type: MessageType(50),
            sender: NodeId(7),
            receiver: NodeId::SHORTEST_SINK,
        };
        let decision = mgr.route_inbound(a, header);
        assert!(!decision.dispatch_locally);
        assert_eq!(decision.forward_to, vec![b]);
    }

    #[test]
    fn shortest_sink_dispatches_locally_when_self_is_sink() {
        let mgr = ConnectionManager::new_with_device_type(
            ConnectionManagerConfig::default(),
            PacketQueueConfig::default(),
            NodeId(1),
            true,
        );
        let header = PacketHeader {
            message_type: MessageType(50),
            sender: NodeId(7),
            receiver: NodeId::SHORTEST_SINK,
        };
        let decision = mgr.route_inbound(UniqueConnectionId(999), header);
        assert!(decision.dispatch_locally);
        assert!(decision.forward_to.is_empty());
    }

    #[test]
    fn cluster_info_update_is_never_forwarded() {
        let mgr = manager();
        let header = PacketHeader {
            message_type: MessageType::CLUSTER_INFO_UPDATE,
            sender: NodeId(7),
            receiver: NodeId::BROADCAST,
        };
        let decision = mgr.route_inbound(UniqueConnectionId(1), header);
        assert!(!decision.dispatch_locally);
        assert!(decision.forward_to.is_empty());
    }
}
