//! Runtime configuration for the mesh core.
//!
//! One top-level struct with nested sub-configs, each owned by the
//! component it parameterizes. `CoreConfig::default()` is a complete, valid
//! configuration usable in tests without further setup.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Page geometry and retry policy for the record store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RecordStoreConfig {
    /// Number of flash pages reserved for the store, including the swap page.
    /// Must be >= 2.
    pub num_pages: u16,
    pub page_size: usize,
    /// Bounded retry budget for a single flash transaction before it is
    /// aborted and the requester notified with `InternalError`.
    pub flash_retry_count: u8,
}

impl Default for RecordStoreConfig {
    fn default() -> Self {
        Self {
            num_pages: 3,
            page_size: 4096,
            flash_retry_count: 5,
        }
    }
}

/// Per-connection send-queue sizing and MTU ceiling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PacketQueueConfig {
    /// Total buffer budget across `LOW`/`MEDIUM`/`HIGH`, in bytes.
    pub default_buffer_bytes: usize,
    /// Extra budget reserved for `VITAL` traffic, in bytes.
    pub high_prio_buffer_bytes: usize,
    /// Ceiling a negotiated MTU is clamped to before fragment counts are computed.
    pub max_mtu: u16,
    /// Consecutive non-transient send failures before the connection is
    /// force-disconnected with `TooManySendRetries`.
    pub max_send_failures: u8,
    /// Largest logical (header + payload) message the fragmenter/reassembler
    /// will handle; also the size of each connection's reassembly buffer.
    /// Independent of MTU -- a small MTU just means more fragments.
    pub max_mesh_packet_size: usize,
}

impl Default for PacketQueueConfig {
    fn default() -> Self {
        Self {
            default_buffer_bytes: 2_000,
            high_prio_buffer_bytes: 100,
            max_mtu: 251,
            max_send_failures: 10,
            max_mesh_packet_size: 200,
        }
    }
}

/// Connection slot limits and handshake/reestablishment timing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConnectionManagerConfig {
    pub max_mesh_out_connections: u8,
    pub max_mesh_in_connections: u8,
    pub max_app_in_connections: u8,
    pub max_total_connections: u8,
    pub mesh_handshake_timeout: Duration,
    pub mesh_extended_connection_timeout: Duration,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            max_mesh_out_connections: 3,
            max_mesh_in_connections: 2,
            max_app_in_connections: 2,
            max_total_connections: 5,
            mesh_handshake_timeout: Duration::from_millis(4_000),
            mesh_extended_connection_timeout: Duration::from_secs(10),
        }
    }
}

/// Discovery cadence, decision scoring weights, and backoff parameters for
/// the clustering protocol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClusteringConfig {
    pub adv_interval_high: Duration,
    pub adv_interval_low: Duration,
    pub scan_window_high: Duration,
    pub scan_interval_high: Duration,
    pub scan_window_low: Duration,
    pub scan_interval_low: Duration,
    pub high_to_low_discovery_time: Duration,
    pub max_time_until_decision: Duration,
    pub num_nodes_for_decision: usize,
    pub stable_connection_rssi_threshold_dbm: i8,
    pub weight_free_slots: i32,
    pub weight_rssi: i32,
    pub weight_smaller_cluster: i32,
    pub weight_bigger_cluster_id: i32,
    /// Initial backoff after a failed connection attempt; doubled per
    /// consecutive failure against the same peer.
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            adv_interval_high: Duration::from_millis(100),
            adv_interval_low: Duration::from_millis(1_000),
            scan_window_high: Duration::from_millis(30),
            scan_interval_high: Duration::from_millis(60),
            scan_window_low: Duration::from_millis(30),
            scan_interval_low: Duration::from_millis(300),
            high_to_low_discovery_time: Duration::from_secs(60),
            max_time_until_decision: Duration::from_millis(2_000),
            num_nodes_for_decision: 4,
            stable_connection_rssi_threshold_dbm: -85,
            weight_free_slots: 10,
            weight_rssi: 1,
            weight_smaller_cluster: 1_000,
            weight_bigger_cluster_id: 1,
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(60),
        }
    }
}

/// Top-level runtime configuration; constructed once at boot and shared by
/// reference across every service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CoreConfig {
    pub record_store: RecordStoreConfig,
    pub packet_queue: PacketQueueConfig,
    pub connection_manager: ConnectionManagerConfig,
    pub clustering: ClusteringConfig,
    /// Main-loop timer tick, per the 2-decisecond resolution in the concurrency model.
    pub timer_tick: Duration,
    /// Watchdog budget: an iteration exceeding this triggers a reboot.
    pub watchdog_budget: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            record_store: RecordStoreConfig::default(),
            packet_queue: PacketQueueConfig::default(),
            connection_manager: ConnectionManagerConfig::default(),
            clustering: ClusteringConfig::default(),
            timer_tick: Duration::from_millis(200),
            watchdog_budget: Duration::from_secs(1),
        }
    }
}
