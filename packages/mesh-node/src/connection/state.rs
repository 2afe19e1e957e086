//! The per-link lifecycle state machine.
//!
//! This module only models the *shape* of the lifecycle and which
//! transitions are legal from which state; the cluster-merge handshake
//! content (`CLUSTER_WELCOME`/`CLUSTER_ACK_1`/`CLUSTER_ACK_2`) is owned by
//! `crate::clustering`, since it needs cross-connection cluster state this
//! module deliberately does not carry.

use mesh_core::AppDisconnectReason;

/// Lifecycle state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Outbound GAP connect requested; radio has not yet confirmed the link.
    Connecting,
    /// Radio confirmed the link; waiting for encryption to settle (or skip).
    Connected,
    /// Cluster-merge (or mesh-access) handshake in progress.
    Handshaking,
    /// Handshake complete; normal data flow.
    HandshakeDone,
    /// Transport link dropped but the mesh-level connection is still
    /// considered recoverable within `mesh_extended_connection_timeout`.
    Reestablishing,
    /// Transport reconnected to the same partner; re-syncing handles without
    /// redoing cluster merge.
    ReestablishingHandshake,
    /// Terminal: the connection is gone and its resources may be reclaimed.
    Disconnected,
}

/// An attempted transition that isn't legal from the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: ConnectionState,
    pub event: &'static str,
}

impl ConnectionState {
    /// Radio reports the outbound or inbound link is up.
    pub fn on_radio_connected(self) -> Result<Self, IllegalTransition> {
        match self {
            ConnectionState::Connecting => Ok(ConnectionState::Connected),
            ConnectionState::Reestablishing => Ok(ConnectionState::ReestablishingHandshake),
            _ => Err(IllegalTransition { from: self, event: "radio_connected" }),
        }
    }

    /// Encryption settled (or was never required for this link).
    pub fn on_encryption_ready(self) -> Result<Self, IllegalTransition> {
        match self {
            ConnectionState::Connected => Ok(ConnectionState::Handshaking),
            _ => Err(IllegalTransition { from: self, event: "encryption_ready" }),
        }
    }

    /// The three-way cluster-merge handshake (or the short reconnect
    /// handshake) completed successfully.
    pub fn on_handshake_done(self) -> Result<Self, IllegalTransition> {
        match self {
            ConnectionState::Handshaking | ConnectionState::ReestablishingHandshake => {
                Ok(ConnectionState::HandshakeDone)
            }
            _ => Err(IllegalTransition { from: self, event: "handshake_done" }),
        }
    }

    /// Transport-level disconnect while the mesh connection is still
    /// recoverable (`elapsed_since_disconnect < reestablish_time`).
    pub fn on_transport_lost_recoverable(self) -> Result<Self, IllegalTransition> {
        match self {
            ConnectionState::HandshakeDone => Ok(ConnectionState::Reestablishing),
            _ => Err(IllegalTransition { from: self, event: "transport_lost_recoverable" }),
        }
    }

    /// Any terminal disconnect: explicit, timeout, or reestablish window
    /// expired. Legal from every non-terminal state.
    #[must_use]
    pub fn on_disconnect(self) -> Self {
        ConnectionState::Disconnected
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Disconnected)
    }

    #[must_use]
    pub fn is_data_ready(self) -> bool {
        matches!(self, ConnectionState::HandshakeDone)
    }
}

/// Bundles a typed reason with the terminal transition: every
/// connection-level error surfaces only as a disconnect with a reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectOutcome {
    pub state: ConnectionState,
    pub reason: AppDisconnectReason,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_through_handshake() {
        let s = ConnectionState::Connecting;
        let s = s.on_radio_connected().unwrap();
        assert_eq!(s, ConnectionState::Connected);
        let s = s.on_encryption_ready().unwrap();
        assert_eq!(s, ConnectionState::Handshaking);
        let s = s.on_handshake_done().unwrap();
        assert_eq!(s, ConnectionState::HandshakeDone);
        assert!(s.is_data_ready());
    }

    #[test]
    fn reestablish_path_skips_full_handshake() {
        let s = ConnectionState::HandshakeDone;
        let s = s.on_transport_lost_recoverable().unwrap();
        assert_eq!(s, ConnectionState::Reestablishing);
        let s = s.on_radio_connected().unwrap();
        assert_eq!(s, ConnectionState::ReestablishingHandshake);
        let s = s.on_handshake_done().unwrap();
        assert_eq!(s, ConnectionState::HandshakeDone);
    }

    #[test]
    fn disconnect_is_legal_from_any_state() {
        for s in [
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Handshaking,
            ConnectionState::HandshakeDone,
            ConnectionState::Reestablishing,
            ConnectionState::ReestablishingHandshake,
        ] {
            assert_eq!(s.on_disconnect(), ConnectionState::Disconnected);
        }
    }

    #[test]
    fn illegal_transition_is_rejected() {
        assert!(ConnectionState::Connecting.on_handshake_done().is_err());
        assert!(ConnectionState::Disconnected.on_radio_connected().is_err());
    }
}
