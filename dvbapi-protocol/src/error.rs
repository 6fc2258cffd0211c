//! Error types for the descrambling-control protocol.

use thiserror::Error;

/// Protocol-level errors that can occur while encoding or decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Opcode is unknown; nothing was consumed.
    #[error("Unknown opcode: 0x{0:08X}")]
    UnknownOpcode(u32),

    /// A different message arrived where a specific one was required.
    #[error("Unexpected message: expected 0x{expected:08X}, got 0x{actual:08X}")]
    UnexpectedMessage { expected: u32, actual: u32 },

    /// PMT section is larger than the CA_PMT buffer allows.
    #[error("PMT too large: {0} bytes (max: {1})")]
    PmtTooLarge(usize, usize),

    /// Section is shorter than its own length field claims.
    #[error("Truncated section: expected {expected} bytes, got {actual}")]
    TruncatedSection { expected: usize, actual: usize },

    /// Section fields are inconsistent.
    #[error("Malformed section: {0}")]
    MalformedSection(&'static str),

    /// Section CRC-32 does not match.
    #[error("Section CRC mismatch: computed 0x{computed:08X}, stored 0x{stored:08X}")]
    CrcMismatch { computed: u32, stored: u32 },
}
