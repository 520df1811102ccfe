//! The subprocess bridge.
//!
//! # Architecture
//!
//! ```text
//! Bridge (façade, lifecycle state machine)
//!     |
//!     |-- process::spawn(LaunchSpec) --> BridgeProcess
//!     |        |-- stdin  (written only under the session lock)
//!     |        |-- stdout --> pump::spawn_stdout_pump --> StdoutQueue
//!     |        |-- stderr --> pump::spawn_stderr_pump --> tracing
//!     |        `-- exit monitor task --> ExitWatch
//!     |
//!     `-- channel::exchange(process, command, params, timeout)
//! ```
//!
//! One session (process + queue + lock) exists per started child. Starting
//! again after a shutdown installs a fresh session, so lines queued by a
//! previous child can never be read by the next one.

pub mod channel;
pub mod envelope;
mod facade;
pub mod framing;
pub mod process;
pub mod pump;
pub mod queue;

pub use envelope::{RequestEnvelope, ResponseEnvelope};
pub use facade::{Bridge, BridgeState, ShutdownReport};
pub use framing::FramedLineReader;
pub use process::{BridgeProcess, ExitWatch, LaunchSpec};
pub use queue::{QueueRead, StdoutEvent, StdoutQueue};
