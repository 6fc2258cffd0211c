//! Socket side of the bridge.

pub mod listener;
pub mod session;

pub use listener::{Server, ServerConfig};
pub use session::Session;
