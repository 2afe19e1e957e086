//! Lock-free health-state handle for `CoreState`, readable by anything that
//! holds a clone without going through the single-threaded event loop (e.g. a
//! CLI/terminal module's `status` command, or an external liveness probe).
//!
//! The core's own state transitions (record store, connection table,
//! clustering) are plain fields mutated between `.await` points since nothing
//! else runs concurrently with `CoreState::run`; this is the one piece of
//! state meant to be read from *outside* that loop, hence the separate
//! lock-free cell instead of a plain field.

use std::sync::Arc;

use arc_swap::ArcSwap;

/// Coarse lifecycle state of the mesh core, independent of cluster/connection
/// state. `Booting -> Running -> Draining -> Stopped`, matching the order
/// `CoreState::boot`/`run`/shutdown progress through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreHealth {
    /// `CoreState::boot` is still registering services and starting the radio.
    Booting,
    /// The main event loop is running normally.
    Running,
    /// Shutdown was requested; the event loop is tearing down services.
    Draining,
    /// The event loop has returned and every service has shut down.
    Stopped,
}

/// A shareable, lock-free cell holding the current [`CoreHealth`]. Cloning is
/// cheap (an `Arc` bump); every clone observes the same state.
#[derive(Debug, Clone)]
pub struct HealthHandle(Arc<ArcSwap<CoreHealth>>);

impl HealthHandle {
    #[must_use]
    pub fn new(initial: CoreHealth) -> Self {
        Self(Arc::new(ArcSwap::from_pointee(initial)))
    }

    pub fn set(&self, state: CoreHealth) {
        self.0.store(Arc::new(state));
    }

    #[must_use]
    pub fn get(&self) -> CoreHealth {
        **self.0.load()
    }
}

impl Default for HealthHandle {
    fn default() -> Self {
        Self::new(CoreHealth::Booting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_booting() {
        let h = HealthHandle::default();
        assert_eq!(h.get(), CoreHealth::Booting);
    }

    #[test]
    fn clones_observe_the_same_transitions() {
        let h = HealthHandle::new(CoreHealth::Booting);
        let clone = h.clone();
        h.set(CoreHealth::Running);
        assert_eq!(clone.get(), CoreHealth::Running);
        clone.set(CoreHealth::Draining);
        assert_eq!(h.get(), CoreHealth::Draining);
    }
}
