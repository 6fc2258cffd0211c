//! Error types for the bridge.

use dvbapi_protocol::ProtocolError;
use thiserror::Error;

/// Errors raised while serving a CAM-server connection.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A request addressed a slot beyond the table.
    #[error("Demux slot {slot} out of range (capacity {capacity})")]
    SlotOutOfRange { slot: usize, capacity: usize },

    /// Every demux slot is occupied.
    #[error("No free demux slot (capacity {0})")]
    NoFreeSlot(usize),

    /// Registry state contradicts itself.
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// Startup configuration is unusable.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Handshake with the CAM server failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Protocol error on this connection.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Socket I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Fatal errors terminate the process after descrambling is disabled.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::SlotOutOfRange { .. } | BridgeError::NoFreeSlot(_) | BridgeError::Invariant(_)
        )
    }
}
