//! Command execution: allow-list registry, process runner, dispatch policy.

pub mod dispatch;
pub mod exec;
pub mod registry;

pub use dispatch::{DispatchOutcome, DispatchPolicy, Dispatcher};
pub use registry::{CommandRegistry, CommandSpec, BUILTIN_TOKENS};
