//! Lifecycle-managed service plumbing shared by every long-lived component
//! (`RecordStore`, `ConnectionManager`, the clustering service, ...).
//!
//! There is no classify/middleware/router pipeline here: the mesh core
//! dispatches radio and flash events directly from its `tokio::select!`
//! loop. `ServiceRegistry` only provides ordered init/shutdown and
//! type-erased lookup for the services that loop drives.

pub mod registry;

pub use registry::{ManagedService, ServiceContext, ServiceRegistry};
