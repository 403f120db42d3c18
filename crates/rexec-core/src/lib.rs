//! rexec-core: shared pieces of the rexec remote command service.
//!
//! Provides the plain-text wire protocol constants, the error taxonomy
//! shared by server and client, and the `StopSignal` abstraction used for
//! cross-process shutdown.

pub mod error;
pub mod protocol;
pub mod stop_flag;

// Re-export commonly used items at crate root.
pub use error::{RexecError, RexecResult};
pub use protocol::{decode_lossy, is_exit_token, DEFAULT_PORT};
pub use stop_flag::{FileStopSignal, ManualStopSignal, NeverStop, StopSignal};
