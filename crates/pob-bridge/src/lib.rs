//! Subprocess bridge to the Path of Building calculation engine.
//!
//! The engine runs as a single LuaJIT child process speaking a
//! line-delimited JSON protocol over its standard streams. This crate owns
//! that process: spawning it, waiting for its ready handshake, serializing
//! commands against it, and tearing it down.
//!
//! ```text
//! caller --send_command--> Bridge --(session lock)--> stdin  --> child
//!                                 <--StdoutQueue<-- stdout pump <--
//!                                     log sink  <-- stderr pump <--
//! ```

pub mod bridge;
pub mod config;
pub mod error;

pub use bridge::{Bridge, BridgeState, ShutdownReport};
pub use config::BridgeConfig;
pub use error::{BridgeError, ErrorKind};

/// A JSON object, the shape of every command's params and result.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;
