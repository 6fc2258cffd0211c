//! Message type definitions for the descrambling-control protocol.

use serde::{Deserialize, Serialize};

/// Protocol version announced in the client hello.
pub const PROTOCOL_VERSION: u16 = 2;

/// Name announced in the client hello.
pub const CLIENT_NAME: &str = "ca-bridge";

/// Largest PMT section accepted for CA_PMT construction.
pub const MAX_PMT_SIZE: usize = 4096;

/// Filter index reserved for the PMT subscription of a slot.
pub const PMT_FILTER_INDEX: u8 = 255;

/// Number of compare/mask bytes carried by a filter-set request.
pub const FILTER_LEN: usize = 12;

/// Length of a full control word (even half followed by odd half).
pub const CONTROL_WORD_LEN: usize = 16;

/// Application object tag of a CA_PMT, including the two-byte length marker.
pub const CA_PMT_TAG: [u8; 4] = [0x9F, 0x80, 0x32, 0x82];

/// Application object tag of a stop-slot message.
pub const CA_STOP_TAG: [u8; 4] = [0x9F, 0x80, 0x3F, 0x04];

/// CA_PMT command: ok descrambling.
pub const CMD_OK_DESCRAMBLING: u8 = 0x01;

/// Private descriptor carrying the demux and adapter index.
pub const DEMUX_DESCRIPTOR_TAG: u8 = 0x82;

/// Opcodes, sent as 32-bit big-endian values.
pub mod opcode {
    /// Set a PID on a descrambler.
    pub const CA_SET_PID: u32 = 0x4008_6F87;
    /// Set a control word half.
    pub const CA_SET_DESCR: u32 = 0x4010_6F86;
    /// Start a section filter.
    pub const DMX_SET_FILTER: u32 = 0x403C_6F2B;
    /// Stop a section filter.
    pub const DMX_STOP: u32 = 0x0000_6F2A;
    /// Captured section for a running filter.
    pub const FILTER_DATA: u32 = 0xFFFF_0000;
    /// Client identification.
    pub const CLIENT_INFO: u32 = 0xFFFF_0001;
    /// Server identification.
    pub const SERVER_INFO: u32 = 0xFFFF_0002;
    /// ECM statistics from the server.
    pub const ECM_INFO: u32 = 0xFFFF_0003;

    /// Returns true for every opcode the server may send.
    pub fn is_inbound(value: u32) -> bool {
        matches!(
            value,
            CA_SET_PID | CA_SET_DESCR | DMX_SET_FILTER | DMX_STOP | SERVER_INFO | ECM_INFO
        )
    }
}

/// CA_PMT list management value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ListManagement {
    More = 0x00,
    First = 0x01,
    Last = 0x02,
    Only = 0x03,
}

impl From<ListManagement> for u8 {
    fn from(value: ListManagement) -> Self {
        value as u8
    }
}

/// Control word parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Parity {
    Even = 0,
    Odd = 1,
}

impl Parity {
    /// Byte offset of this half inside a 16-byte control word.
    pub fn offset(self) -> usize {
        match self {
            Parity::Even => 0,
            Parity::Odd => 8,
        }
    }
}

impl TryFrom<u32> for Parity {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, u32> {
        match value {
            0 => Ok(Parity::Even),
            1 => Ok(Parity::Odd),
            _ => Err(value),
        }
    }
}

/// Server identification received during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub protocol_version: u16,
    pub server_name: String,
}

/// Section filter parameters of a filter-set request.
///
/// `filter[0]`/`mask[0]` apply to the table id; the remaining bytes apply to
/// the section starting after its length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionFilter {
    pub pid: u16,
    pub filter: [u8; FILTER_LEN],
    pub mask: [u8; FILTER_LEN],
}

/// ECM statistics reported by the server. Consumed for framing, logged only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcmInfo {
    pub service_id: u16,
    pub caid: u16,
    pub pid: u16,
    pub provider_id: u32,
    pub ecm_time_ms: u32,
    pub card_system: String,
    pub reader: String,
    pub source: String,
    pub protocol: String,
    pub hops: u8,
}

/// Requests sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Associates a PID with a descrambler index.
    SetPid { slot: u8, pid: u32, index: i32 },
    /// Sets one parity half of the control word.
    SetDescrambler {
        slot: u8,
        index: u32,
        parity: u32,
        control_word: [u8; 8],
    },
    /// Starts (or replaces) a section filter.
    SetFilter {
        slot: u8,
        filter_index: u8,
        filter: SectionFilter,
    },
    /// Stops a section filter.
    StopFilter {
        slot: u8,
        filter_index: u8,
        pid: u16,
        flags: u8,
    },
    /// ECM statistics.
    EcmInfo { slot: u8, info: EcmInfo },
    /// Server identification repeated after the handshake.
    ServerInfo(ServerHello),
}

impl Request {
    /// Opcode this request was decoded from.
    pub fn opcode(&self) -> u32 {
        match self {
            Request::SetPid { .. } => opcode::CA_SET_PID,
            Request::SetDescrambler { .. } => opcode::CA_SET_DESCR,
            Request::SetFilter { .. } => opcode::DMX_SET_FILTER,
            Request::StopFilter { .. } => opcode::DMX_STOP,
            Request::EcmInfo { .. } => opcode::ECM_INFO,
            Request::ServerInfo(_) => opcode::SERVER_INFO,
        }
    }
}
