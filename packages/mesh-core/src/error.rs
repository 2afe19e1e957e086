//! Error types shared by wire encode/decode across the workspace.

use thiserror::Error;

/// Failure decoding a fixed-layout wire structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("buffer shorter than the structure's fixed header size")]
    Truncated,
    #[error("CRC8 mismatch: expected {expected:#04x}, computed {computed:#04x}")]
    CrcMismatch { expected: u8, computed: u8 },
}
