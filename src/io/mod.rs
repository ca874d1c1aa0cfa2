//! I/O layer - process supervision and raw line transport
//!
//! Generic abstractions shared by the protocol layers:
//!
//! - **Transport**: bidirectional line exchange over stdio pipes
//! - **Process**: daemon process lifecycle with exit observation
//!
//! Nothing in this module knows about the wire protocol; message
//! classification and correlation live under `crate::rpc`.

pub mod process;
pub mod transport;

// Re-export main types for convenience
pub use process::{
    DaemonProcessManager, ProcessError, ProcessExitEvent, ProcessExitHandler, ProcessManager,
    ProcessState, StderrMonitor, StopMode,
};
pub use transport::{MockTransport, StdioTransport, Transport};
