//! Wire protocol for the descrambling-control socket.
//!
//! This crate defines the binary protocol spoken between a CAM server and
//! the ca-bridge running on the receiver. All multi-byte fields are
//! big-endian.
//!
//! # Messages
//!
//! ```text
//! bridge -> server   client-info, CA_PMT, stop-slot, filter-data
//! server -> bridge   server-info, pid-set, key-set, filter-set,
//!                    filter-stop, ECM-info
//! ```
//!
//! # Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use dvbapi_protocol::{decode_request, encode_request, Request};
//!
//! let msg = Request::SetPid { slot: 0, pid: 0x101, index: 0 };
//! let mut buf = BytesMut::from(&encode_request(&msg)[..]);
//! assert_eq!(decode_request(&mut buf).unwrap(), Some(msg));
//! ```

pub mod codec;
pub mod error;
pub mod psi;
pub mod types;

pub use codec::{
    decode_request, decode_server_hello, encode_ca_pmt, encode_ca_pmt_placeholder,
    encode_client_hello, encode_filter_section, encode_request, encode_server_hello,
    encode_stop_demux, skip_to_next_opcode, OPCODE_SIZE,
};
pub use error::ProtocolError;
pub use types::{
    opcode, EcmInfo, ListManagement, Parity, Request, SectionFilter, ServerHello, CLIENT_NAME,
    CONTROL_WORD_LEN, FILTER_LEN, MAX_PMT_SIZE, PMT_FILTER_INDEX, PROTOCOL_VERSION,
};
