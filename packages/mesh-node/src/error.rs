//! Per-component error enums and the crate-root aggregate.
//!
//! Each enum's variants map 1:1 onto a row of the error-category table:
//! `Configuration` errors are returned synchronously and never enqueued;
//! `Transient` errors are retried internally up to a bounded budget and are
//! only promoted to a connection-level error once that budget is spent;
//! `Protocol`/`Connection-level` errors carry the typed reason attached to
//! the disconnect or completion event they produce.

use thiserror::Error;

use mesh_core::AppDisconnectReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecordStoreError {
    #[error("record store has no free space for this write")]
    NoSpace,
    #[error("record store queue is full")]
    Busy,
    #[error("module {0:?} has locked down the store; writes are refused until it unlocks")]
    LockedDown(mesh_core::ModuleId),
    #[error("flash operation failed after the retry budget was exhausted")]
    InternalError,
    #[error("record body exceeds the page's maximum payload size")]
    RecordTooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketQueueError {
    #[error("message does not fit in the connection's free buffer budget")]
    QueueFull,
    #[error("message exceeds the maximum mesh packet size")]
    MessageTooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("handshake did not complete within the configured timeout")]
    HandshakeTimeout,
    #[error("reestablishment offered a different MTU than before the drop")]
    MtuMismatchOnReestablish,
    #[error("{0} consecutive send failures exceeded the retry budget")]
    TooManySendFailures(u8),
    #[error("no free slot in the requested connection category")]
    NoFreeSlot,
    #[error("unique connection id did not resolve to a live connection")]
    StaleHandle,
}

impl ConnectionError {
    #[must_use]
    pub fn as_disconnect_reason(self) -> Option<AppDisconnectReason> {
        match self {
            ConnectionError::HandshakeTimeout => Some(AppDisconnectReason::HandshakeTimeout),
            ConnectionError::MtuMismatchOnReestablish => {
                Some(AppDisconnectReason::MtuMismatchOnReestablish)
            }
            ConnectionError::TooManySendFailures(_) => {
                Some(AppDisconnectReason::TooManySendRetries)
            }
            ConnectionError::NoFreeSlot | ConnectionError::StaleHandle => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ClusterError {
    #[error("partner's cluster id matches ours; this merge would create a cycle")]
    ClusterIdCollision,
    #[error("received a cluster-info update counter outside the expected window")]
    UnexpectedUpdateCounter,
}

/// Aggregate error for code that crosses component boundaries (boot, the
/// test harness). Individual services return their own typed enum; this
/// only exists at seams where several components' errors can occur.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    RecordStore(#[from] RecordStoreError),
    #[error(transparent)]
    PacketQueue(#[from] PacketQueueError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}
