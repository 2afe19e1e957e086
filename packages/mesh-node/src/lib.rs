//! FruityMesh core runtime: the record store, packet queue, connection
//! manager, and clustering protocol that sit beneath an application's
//! mesh-aware modules.
//!
//! `mesh-core` defines the wire formats and the `RadioTransport`/
//! `FlashTransport`/`Module` contracts; this crate is the single-threaded
//! state machine that drives them from one `tokio::select!` loop. There is
//! no internal locking: every mutable piece of state (`RecordStore`,
//! `ConnectionManager`, `Clusterer`) is owned directly by
//! [`core_state::CoreState`] and mutated in place between `.await` points.

pub mod clustering;
pub mod config;
pub mod connection;
pub mod connection_manager;
pub mod core_state;
pub mod error;
pub mod health;
pub mod packet_queue;
pub mod record_store;
pub mod service;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use clustering::{ClusterIdSource, Clusterer, DisconnectImpact, Discovery, DiscoveryMode};
pub use config::CoreConfig;
pub use connection_manager::{ConnectionManager, DisconnectNotice, RouteDecision};
pub use core_state::CoreState;
pub use error::CoreError;
pub use health::{CoreHealth, HealthHandle};
pub use record_store::{RecordStore, RecordStoreCompletion};
pub use service::{ManagedService, ServiceContext, ServiceRegistry};
