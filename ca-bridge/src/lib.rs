//! Conditional-access bridge between a CAM server and the receiver's
//! tuning and descrambling subsystems.
//!
//! The CAM server connects to a Unix socket and speaks the protocol from
//! [`dvbapi_protocol`]. The bridge keeps a small table of demux slots, one
//! per hardware demultiplexer, and binds the receiver's tuning profiles
//! (main view, picture-in-picture, capture) to them as they tune. PMT
//! changes are announced to the server as CA_PMT messages and the control
//! words it sends back are installed on every bank bound to the slot.

pub mod bridge;
pub mod error;
pub mod logging;
pub mod platform;
pub mod server;

pub use bridge::{BridgeConfig, CaBridge, ProfileKey, TunePurpose};
pub use error::BridgeError;
pub use server::{Server, ServerConfig};
