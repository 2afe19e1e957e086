//! Boots and drives the mesh core: owns every mutable runtime component and
//! dispatches radio/flash events plus the periodic timer tick from one
//! `tokio::select!` loop. Single-threaded by construction: `record_store`,
//! `connection_manager`, and `clusterer` are plain fields mutated in place
//! between `.await` points, not `Arc<Mutex<_>>` guarded shared state.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use mesh_core::{
    AdvParams, AppDisconnectReason, CharHandle, ConnParams, ConnectedClusterSnapshot, DeviceType,
    FlashEvent, FlashTransport, JoinMePayload, MessageType, NodeId, PacketHeader, Priority,
    RadioEvent, RadioTransport, RebootReason, ScanParams, UniqueConnectionId,
};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::clustering::{Clusterer, RandomClusterIdSource, WelcomeOutcome};
use crate::config::CoreConfig;
use crate::connection::ConnectionKind;
use crate::connection_manager::ConnectionManager;
use crate::health::{CoreHealth, HealthHandle};
use crate::packet_queue::{SendData, SubmitOutcome};
use crate::record_store::RecordStore;
use crate::service::{ManagedService, ServiceContext, ServiceRegistry};

/// GATT characteristic every mesh connection writes the protocol onto. Real
/// firmware negotiates this per-link during service discovery; fixed here
/// since the core's contracts don't yet model discovery.
const MESH_WRITE_CHAR: CharHandle = CharHandle(0x20);

macro_rules! managed_marker {
    ($ty:ident, $name:literal) => {
        pub struct $ty;

        #[async_trait]
        impl ManagedService for $ty {
            fn name(&self) -> &'static str {
                $name
            }

            async fn init(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
                info!(service = $name, "service init");
                Ok(())
            }

            async fn reset(&self) -> anyhow::Result<()> {
                Ok(())
            }

            async fn shutdown(&self, terminate: bool) -> anyhow::Result<()> {
                info!(service = $name, terminate, "service shutdown");
                Ok(())
            }
        }
    };
}

managed_marker!(RecordStoreService, "record_store");
managed_marker!(ConnectionManagerService, "connection_manager");
managed_marker!(ClusteringService, "clustering");

/// The mesh core's complete runtime state. Constructed once at boot via
/// [`CoreState::boot`] and then driven by [`CoreState::run`] until it
/// receives a shutdown signal.
pub struct CoreState {
    config: Arc<CoreConfig>,
    self_node_id: NodeId,
    radio: Arc<dyn RadioTransport>,
    flash: Arc<dyn FlashTransport>,
    radio_events: mpsc::UnboundedReceiver<RadioEvent>,
    flash_events: mpsc::UnboundedReceiver<FlashEvent>,
    record_store: RecordStore,
    connection_manager: ConnectionManager,
    clusterer: Clusterer,
    registry: ServiceRegistry,
    reboot_reason: RebootReason,
    health: HealthHandle,
}

impl CoreState {
    /// Boots a fresh core: allocates every component, registers the
    /// lifecycle-managed services, and starts the radio in its initial
    /// discovery mode. `reboot_reason` is whatever the bootloader persisted
    /// from the previous run.
    #[instrument(skip_all, fields(node_id = %self_node_id))]
    pub async fn boot(
        config: CoreConfig,
        self_node_id: NodeId,
        device_type: DeviceType,
        reboot_reason: RebootReason,
        radio: Arc<dyn RadioTransport>,
        flash: Arc<dyn FlashTransport>,
        radio_events: mpsc::UnboundedReceiver<RadioEvent>,
        flash_events: mpsc::UnboundedReceiver<FlashEvent>,
    ) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let now = Instant::now();

        let record_store = RecordStore::new_erased(config.record_store);
        let connection_manager = ConnectionManager::new_with_device_type(
            config.connection_manager,
            config.packet_queue,
            self_node_id,
            device_type.is_sink(),
        );
        let clusterer = Clusterer::new(
            config.clustering,
            self_node_id,
            device_type,
            Box::new(RandomClusterIdSource),
            now,
        );

        let health = HealthHandle::new(CoreHealth::Booting);

        let registry = ServiceRegistry::new();
        registry.register(RecordStoreService);
        registry.register(ConnectionManagerService);
        registry.register(ClusteringService);
        registry
            .init_all(&ServiceContext {
                config: config.clone(),
            })
            .await?;

        let mut state = Self {
            config,
            self_node_id,
            radio,
            flash,
            radio_events,
            flash_events,
            record_store,
            connection_manager,
            clusterer,
            registry,
            reboot_reason,
            health,
        };

        info!(?reboot_reason, "mesh core booted");
        state.refresh_discovery_radio();
        state.health.set(CoreHealth::Running);
        Ok(state)
    }

    #[must_use]
    pub fn reboot_reason(&self) -> RebootReason {
        self.reboot_reason
    }

    /// A cheap, cloneable handle to this core's lifecycle health state.
    /// Readable from outside the event loop, e.g. by a status command.
    #[must_use]
    pub fn health_handle(&self) -> HealthHandle {
        self.health.clone()
    }

    #[must_use]
    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    #[must_use]
    pub fn clusterer(&self) -> &Clusterer {
        &self.clusterer
    }

    #[must_use]
    pub fn connection_manager(&self) -> &ConnectionManager {
        &self.connection_manager
    }

    /// Runs the core's main loop until `shutdown` resolves. Every iteration
    /// is timed against `watchdog_budget`; an iteration that overruns it is
    /// logged and counted, matching the firmware's software watchdog (a real
    /// overrun would instead reset the chip).
    pub async fn run(mut self, mut shutdown: impl std::future::Future<Output = ()> + Unpin) {
        let mut ticker = tokio::time::interval(self.config.timer_tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let iteration_started = Instant::now();
            tokio::select! {
                biased;
                () = &mut shutdown => {
                    info!("mesh core: shutdown requested");
                    self.health.set(CoreHealth::Draining);
                    break;
                }
                Some(event) = self.radio_events.recv() => {
                    self.handle_radio_event(event, Instant::now());
                }
                Some(event) = self.flash_events.recv() => {
                    self.handle_flash_event(event);
                }
                _ = ticker.tick() => {
                    self.handle_tick(Instant::now());
                }
            }

            let elapsed = iteration_started.elapsed();
            if elapsed > self.config.watchdog_budget {
                metrics::counter!("watchdog_budget_exceeded").increment(1);
                warn!(?elapsed, "mesh core: event-loop iteration exceeded watchdog budget");
            }
        }

        if let Err(err) = self.registry.shutdown_all(false).await {
            warn!(%err, "mesh core: service shutdown reported an error");
        }
        self.health.set(CoreHealth::Stopped);
    }

    // -----------------------------------------------------------------
    // Radio events
    // -----------------------------------------------------------------

    #[instrument(skip(self, event))]
    fn handle_radio_event(&mut self, event: RadioEvent, now: Instant) {
        match event {
            RadioEvent::AdvertisementReport { peer_addr, rssi_dbm, payload } => {
                self.handle_advertisement(peer_addr, rssi_dbm, &payload, now);
            }
            RadioEvent::Connected { handle, peer_addr } => {
                if let Some(id) = self.connection_manager.on_radio_connected(peer_addr, handle, now) {
                    self.clusterer.on_connect_succeeded(peer_addr);
                    self.begin_connection_handshake(id, now);
                }
            }
            RadioEvent::Disconnected { handle, reason } => {
                if let Some(notice) = self.connection_manager.on_radio_disconnected(handle, reason, now) {
                    self.handle_disconnect_notice(&notice, now);
                }
            }
            RadioEvent::Timeout { handle } => {
                debug!(?handle, "mesh core: radio reported connect timeout");
            }
            RadioEvent::WriteResponse { handle, success } => {
                if !success {
                    self.handle_write_failure(handle, now);
                }
            }
            RadioEvent::DataTransmitted { handle, unreliable_count, reliable_count } => {
                self.handle_data_transmitted(handle, unreliable_count, reliable_count);
            }
            RadioEvent::HandleValueNotification { handle, data, .. } => {
                self.handle_incoming_fragment(handle, &data, now);
            }
            RadioEvent::MtuUpgraded { handle, mtu } => {
                self.for_connection_by_handle(handle, |conn| conn.mtu = mtu);
            }
            RadioEvent::RssiChanged { handle, rssi_dbm } => {
                self.connection_manager.note_rssi(handle, rssi_dbm, now);
            }
        }
    }

    fn handle_advertisement(&mut self, peer_addr: mesh_core::BleAddress, rssi_dbm: i8, payload: &[u8], now: Instant) {
        let Ok(join_me) = JoinMePayload::decode(payload) else {
            return;
        };
        self.clusterer.on_advertisement(peer_addr, rssi_dbm, join_me, now);
    }

    /// A non-`BUSY`/`NO_RESOURCES` write failure reported by the radio.
    /// Counts against the connection's failure budget; past
    /// `MAX_SEND_FAILURES` the connection is force-disconnected with
    /// `TooManySendRetries`.
    fn handle_write_failure(&mut self, handle: mesh_core::ConnHandle, now: Instant) {
        let Some(id) = self.connection_manager_handle_lookup(handle) else {
            return;
        };
        let tripped = self
            .connection_manager
            .get_mut(id)
            .is_some_and(|conn| conn.queue.record_send_failure());
        if tripped {
            metrics::counter!("too_many_send_retries_disconnects").increment(1);
            warn!(?id, "mesh core: send failure budget exhausted, disconnecting");
            self.connection_manager
                .force_disconnect(id, AppDisconnectReason::TooManySendRetries, now);
            self.radio.bt_disconnect(handle, mesh_core::HciDisconnectReason::LOCAL_HOST_TERMINATED);
        }
    }

    fn handle_data_transmitted(&mut self, handle: mesh_core::ConnHandle, unreliable_count: u16, reliable_count: u16) {
        self.for_connection_by_handle(handle, |conn| {
            let _events = conn.queue.on_tx_complete(unreliable_count, reliable_count);
        });
        self.pump_connection_by_handle(handle);
    }

    fn handle_incoming_fragment(&mut self, handle: mesh_core::ConnHandle, data: &[u8], now: Instant) {
        let Some(id) = self.connection_manager_handle_lookup(handle) else {
            return;
        };
        let outcome = {
            let Some(conn) = self.connection_manager.get_mut(id) else {
                return;
            };
            conn.queue.on_fragment_received(data)
        };
        match outcome {
            crate::packet_queue::ReassemblyOutcome::Complete(bytes) => {
                self.handle_reassembled_message(id, &bytes, now);
            }
            crate::packet_queue::ReassemblyOutcome::Pending => {}
            crate::packet_queue::ReassemblyOutcome::MissingFragment => {
                warn!(?id, "mesh core: reassembly detected a missing fragment");
            }
        }
    }

    fn handle_reassembled_message(&mut self, id: UniqueConnectionId, bytes: &[u8], now: Instant) {
        let Ok(header) = PacketHeader::decode(bytes) else {
            return;
        };
        let body = &bytes[mesh_core::PACKET_HEADER_SIZE..];

        match header.message_type {
            MessageType::CLUSTER_WELCOME => self.on_cluster_welcome_received(id, body, now),
            MessageType::CLUSTER_ACK_1 => self.on_cluster_ack1_received(id, body),
            MessageType::CLUSTER_ACK_2 => self.on_cluster_ack2_received(id, body),
            MessageType::CLUSTER_INFO_UPDATE => self.on_cluster_info_update_received(id, body),
            _ => {
                let decision = self.connection_manager.route_inbound(id, header);
                if decision.dispatch_locally {
                    debug!(?header.message_type, sender = ?header.sender, "mesh core: dispatched message locally");
                }
                for forward_to in decision.forward_to {
                    self.forward_raw(forward_to, header.message_type, header.sender, decision.forward_receiver, body);
                }
            }
        }
    }

    fn forward_raw(&mut self, to: UniqueConnectionId, message_type: MessageType, sender: NodeId, receiver: NodeId, payload: &[u8]) {
        let Some(conn) = self.connection_manager.get_mut(to) else {
            return;
        };
        let send_data = SendData {
            message_type,
            sender,
            receiver,
            reliable: true,
        };
        if let Err(err) = conn.queue.queue_data(send_data, payload, Priority::Medium, conn.mtu) {
            warn!(?to, %err, "mesh core: failed to forward message");
        }
        self.pump_connection(to);
    }

    // -----------------------------------------------------------------
    // Cluster-merge handshake
    // -----------------------------------------------------------------

    fn begin_connection_handshake(&mut self, id: UniqueConnectionId, now: Instant) {
        let Some(conn) = self.connection_manager.get_mut(id) else {
            return;
        };
        if !conn.is_mesh() {
            return;
        }
        conn.handshake_started_at = Some(now);
        if let Ok(next) = conn.state.on_encryption_ready() {
            conn.state = next;
        }
        let welcome = self.clusterer.begin_handshake(MESH_WRITE_CHAR.0);
        self.send_cluster_message(id, MessageType::CLUSTER_WELCOME, &welcome.encode());
    }

    fn on_cluster_welcome_received(&mut self, id: UniqueConnectionId, body: &[u8], now: Instant) {
        let Ok(welcome) = mesh_core::ClusterWelcome::decode(body) else {
            return;
        };
        match self.clusterer.on_cluster_welcome(&welcome, MESH_WRITE_CHAR.0) {
            WelcomeOutcome::Reject(err) => {
                warn!(?id, %err, "mesh core: rejecting cluster welcome");
                self.connection_manager
                    .force_disconnect(id, AppDisconnectReason::ClusterIdCollision, now);
            }
            WelcomeOutcome::WeAreBigger { reply } => {
                self.send_cluster_message(id, MessageType::CLUSTER_WELCOME, &reply.encode());
            }
            WelcomeOutcome::WeAreSmaller { ack1 } => {
                // Smaller side: every other mesh connection we hold must be
                // torn down before we merge into the partner's cluster.
                let others: Vec<UniqueConnectionId> = self
                    .connection_manager
                    .iter()
                    .filter(|(other, conn)| **other != id && conn.is_mesh())
                    .map(|(other, _)| *other)
                    .collect();
                for other in others {
                    self.connection_manager
                        .force_disconnect(other, AppDisconnectReason::LocalShutdown, now);
                }
                if let Some(conn) = self.connection_manager.get_mut(id) {
                    conn.master_bit = Some(false);
                }
                self.send_cluster_message(id, MessageType::CLUSTER_ACK_1, &ack1.encode());
            }
        }
    }

    fn on_cluster_ack1_received(&mut self, id: UniqueConnectionId, body: &[u8]) {
        let Ok(ack1) = mesh_core::ClusterAck1::decode(body) else {
            return;
        };
        let ack2 = self.clusterer.on_cluster_ack1(&ack1);
        if let Some(conn) = self.connection_manager.get_mut(id) {
            conn.master_bit = Some(true);
            conn.cluster_snapshot = Some(ConnectedClusterSnapshot {
                cluster_id: ack2.cluster_id,
                cluster_size: 1,
                hops_to_sink: ack1.hops_to_sink,
            });
            if let Ok(next) = conn.state.on_handshake_done() {
                conn.state = next;
            }
        }
        self.send_cluster_message(id, MessageType::CLUSTER_ACK_2, &ack2.encode());
        // The new member just grew us by +1; every other mesh neighbor we
        // already had needs to hear about it (spec.md: "after handshake,
        // both sides propagate a CLUSTER_INFO_UPDATE through all other mesh
        // connections").
        self.propagate_cluster_info_update(1, Some(id));
    }

    fn on_cluster_ack2_received(&mut self, id: UniqueConnectionId, body: &[u8]) {
        let Ok(ack2) = mesh_core::ClusterAck2::decode(body) else {
            return;
        };
        let other_hops: Vec<i16> = self
            .connection_manager
            .iter()
            .filter(|(other, conn)| **other != id && conn.is_mesh())
            .filter_map(|(_, conn)| conn.cluster_snapshot.map(|s| s.hops_to_sink))
            .collect();
        self.clusterer.on_cluster_ack2(&ack2, other_hops.into_iter());
        if let Some(conn) = self.connection_manager.get_mut(id) {
            conn.cluster_snapshot = Some(ConnectedClusterSnapshot {
                cluster_id: ack2.cluster_id,
                cluster_size: ack2.cluster_size,
                hops_to_sink: ack2.hops_to_sink,
            });
            if let Ok(next) = conn.state.on_handshake_done() {
                conn.state = next;
            }
        }
    }

    fn on_cluster_info_update_received(&mut self, id: UniqueConnectionId, body: &[u8]) {
        let Ok(update) = mesh_core::ClusterInfoUpdate::decode(body) else {
            return;
        };
        let accepted = self
            .connection_manager
            .get_mut(id)
            .is_some_and(|conn| conn.cluster_update_counters.accepts(update.counter));
        if !accepted {
            warn!(?id, "mesh core: dropping out-of-window cluster info update");
            return;
        }
        if let Some(conn) = self.connection_manager.get_mut(id) {
            conn.cluster_update_counters.advance_incoming();
            if let Some(snapshot) = conn.cluster_snapshot.as_mut() {
                snapshot.cluster_size += update.cluster_size_delta;
                snapshot.hops_to_sink = update.hops_to_sink;
            }
        }
        self.clusterer.apply_cluster_size_delta(update.cluster_size_delta);
        let other_hops: Vec<i16> = self
            .connection_manager
            .iter()
            .filter(|(other, conn)| **other != id && conn.is_mesh())
            .filter_map(|(_, conn)| conn.cluster_snapshot.map(|s| s.hops_to_sink))
            .collect();
        self.clusterer.recompute_hops_to_sink(other_hops.into_iter());
        self.propagate_cluster_info_update(update.cluster_size_delta, Some(id));
    }

    /// Broadcasts a `CLUSTER_INFO_UPDATE` on every data-ready mesh connection
    /// except `skip` (the one the change just arrived on, if any).
    fn propagate_cluster_info_update(&mut self, cluster_size_delta: i16, skip: Option<UniqueConnectionId>) {
        let targets: Vec<UniqueConnectionId> = self
            .connection_manager
            .iter()
            .filter(|(id, conn)| Some(**id) != skip && conn.is_mesh() && conn.state.is_data_ready())
            .map(|(id, _)| *id)
            .collect();
        for target in targets {
            let Some(conn) = self.connection_manager.get_mut(target) else {
                continue;
            };
            let counter = conn.cluster_update_counters.next_outgoing();
            let update = self.clusterer.build_info_update(cluster_size_delta, counter);
            self.send_cluster_message(target, MessageType::CLUSTER_INFO_UPDATE, &update.encode());
        }
    }

    fn send_cluster_message(&mut self, id: UniqueConnectionId, message_type: MessageType, body: &[u8]) {
        let Some(conn) = self.connection_manager.get_mut(id) else {
            return;
        };
        let send_data = SendData {
            message_type,
            sender: self.self_node_id,
            receiver: NodeId::BROADCAST,
            reliable: true,
        };
        if let Err(err) = conn.queue.queue_data(send_data, body, Priority::Vital, conn.mtu) {
            warn!(?id, %err, "mesh core: failed to queue cluster protocol message");
            return;
        }
        self.pump_connection(id);
    }

    // -----------------------------------------------------------------
    // Disconnects
    // -----------------------------------------------------------------

    fn handle_disconnect_notice(&mut self, notice: &crate::connection_manager::DisconnectNotice, _now: Instant) {
        if !notice.was_mesh || !notice.was_handshake_done || notice.entering_reestablish {
            return;
        }
        let departing_size = notice.departing_cluster_size;
        let other_hops: Vec<i16> = self
            .connection_manager
            .iter()
            .filter(|(other, conn)| **other != notice.connection_id && conn.is_mesh())
            .filter_map(|(_, conn)| conn.cluster_snapshot.map(|s| s.hops_to_sink))
            .collect();
        let impact = self
            .clusterer
            .on_mesh_disconnect(notice.master_bit, departing_size, other_hops.into_iter());
        match impact {
            crate::clustering::DisconnectImpact::Unaffected => {}
            crate::clustering::DisconnectImpact::Dissolved { new_cluster_id } => {
                info!(?new_cluster_id, "mesh core: cluster dissolved after losing upstream link");
                self.propagate_cluster_info_update(0, None);
            }
            crate::clustering::DisconnectImpact::Shrunk { delta } => {
                if delta != 0 {
                    self.propagate_cluster_info_update(delta, None);
                }
            }
        }
        self.refresh_discovery_radio();
    }

    // -----------------------------------------------------------------
    // Flash
    // -----------------------------------------------------------------

    fn handle_flash_event(&mut self, event: FlashEvent) {
        self.record_store.on_flash_event(event, self.flash.as_ref());
    }

    // -----------------------------------------------------------------
    // Timer tick
    // -----------------------------------------------------------------

    fn handle_tick(&mut self, now: Instant) {
        self.record_store.pump(self.flash.as_ref());

        let timed_out = self.connection_manager.sweep_timeouts(now);
        for (id, reason) in timed_out {
            if let Some(handle) = self.connection_manager.handle_of(id) {
                self.radio.bt_disconnect(handle, mesh_core::HciDisconnectReason::LOCAL_HOST_TERMINATED);
            }
            debug!(?id, ?reason, "mesh core: connection timed out");
        }
        self.connection_manager.reap_disconnected();

        self.clusterer.prune_and_update_mode(now);
        if self.clusterer.should_decide(now) {
            if let Some((addr, _payload)) = self.clusterer.decide(now) {
                self.try_connect(addr, now);
            }
        }

        self.refresh_discovery_radio();
        self.pump_all_connections();
    }

    fn try_connect(&mut self, addr: mesh_core::BleAddress, now: Instant) {
        if self.connection_manager.free_mesh_out_slots() == 0 {
            return;
        }
        match self.connection_manager.request_connect(addr, ConnectionKind::Mesh, now) {
            Ok(_id) => {
                self.radio.bt_connect(
                    addr,
                    ConnParams {
                        interval_hint: std::time::Duration::from_millis(30),
                    },
                );
            }
            Err(err) => {
                debug!(%err, "mesh core: declined to connect, no free slot");
                self.clusterer.on_connect_attempt_failed(addr, now);
            }
        }
    }

    fn refresh_discovery_radio(&mut self) {
        let join_me = self.clusterer.join_me_payload(
            self.connection_manager.free_mesh_in_slots(),
            self.connection_manager.free_mesh_out_slots(),
            100,
            -4,
            MESH_WRITE_CHAR.0,
        );
        self.radio.bt_adv_start(
            AdvParams {
                interval: self.clusterer.adv_interval(),
            },
            join_me.encode().to_vec(),
        );
        let (window, interval) = self.clusterer.scan_window_and_interval();
        self.radio.bt_scan_start(ScanParams { window, interval });
    }

    fn pump_all_connections(&mut self) {
        let ids: Vec<UniqueConnectionId> = self.connection_manager.iter().map(|(id, _)| *id).collect();
        for id in ids {
            self.pump_connection(id);
        }
    }

    fn pump_connection(&mut self, id: UniqueConnectionId) {
        let Some(handle) = self.connection_manager.handle_of(id) else {
            return;
        };
        let radio = self.radio.clone();
        let Some(conn) = self.connection_manager.get_mut(id) else {
            return;
        };
        conn.queue.fill_transmit_buffers(|fragment, reliable| {
            radio.bt_write(handle, MESH_WRITE_CHAR, fragment.to_vec(), reliable);
            SubmitOutcome::Submitted
        });
    }

    fn pump_connection_by_handle(&mut self, handle: mesh_core::ConnHandle) {
        if let Some(id) = self.connection_manager_handle_lookup(handle) {
            self.pump_connection(id);
        }
    }

    fn for_connection_by_handle(&mut self, handle: mesh_core::ConnHandle, f: impl FnOnce(&mut crate::connection::Connection)) {
        if let Some(id) = self.connection_manager_handle_lookup(handle) {
            if let Some(conn) = self.connection_manager.get_mut(id) {
                f(conn);
            }
        }
    }

    fn connection_manager_handle_lookup(&self, handle: mesh_core::ConnHandle) -> Option<UniqueConnectionId> {
        self.connection_manager
            .iter()
            .find(|(_, conn)| conn.handle == Some(handle))
            .map(|(id, _)| *id)
    }
}
