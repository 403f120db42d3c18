//! Dispatch policy: allow-listed tokens or unrestricted shell lines.
//!
//! The policy is chosen once per server. Every dispatch runs on the calling
//! connection's task; failures come back as reply text, never as errors.

use super::exec;
use super::registry::{CommandKind, CommandRegistry};
use rexec_core::protocol::{
    error_result, not_allowed, EMPTY_ALLOWED_OUTPUT, EMPTY_UNRESTRICTED_OUTPUT,
};
use rexec_core::RexecError;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// How received commands are interpreted.
#[derive(Debug, Clone)]
pub enum DispatchPolicy {
    /// Only tokens present in the registry run.
    AllowListed(Arc<CommandRegistry>),
    /// The received text is handed to the system shell as-is.
    Unrestricted,
}

/// Result of one dispatch, carrying the reply to send back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Completed(String),
    NotAllowed(String),
    Failed(String),
}

impl DispatchOutcome {
    pub fn reply(&self) -> &str {
        match self {
            DispatchOutcome::Completed(text)
            | DispatchOutcome::NotAllowed(text)
            | DispatchOutcome::Failed(text) => text,
        }
    }
}

/// Applies a [`DispatchPolicy`] with a per-command time bound.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    policy: DispatchPolicy,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(policy: DispatchPolicy, timeout: Duration) -> Self {
        Self { policy, timeout }
    }

    /// Tokens to advertise after authentication, if allow-listing is on.
    pub fn allowed_tokens(&self) -> Option<Vec<String>> {
        match &self.policy {
            DispatchPolicy::AllowListed(registry) => Some(registry.tokens()),
            DispatchPolicy::Unrestricted => None,
        }
    }

    /// Run one trimmed command and produce its reply.
    pub async fn dispatch(&self, command: &str) -> DispatchOutcome {
        match &self.policy {
            DispatchPolicy::AllowListed(registry) => self.dispatch_allowed(registry, command).await,
            DispatchPolicy::Unrestricted => {
                match exec::run_shell_line(command, self.timeout).await {
                    Ok(out) => DispatchOutcome::Completed(non_empty(out, EMPTY_UNRESTRICTED_OUTPUT)),
                    Err(e) => failed(command, e),
                }
            }
        }
    }

    async fn dispatch_allowed(&self, registry: &CommandRegistry, token: &str) -> DispatchOutcome {
        let Some(spec) = registry.get(token) else {
            return DispatchOutcome::NotAllowed(not_allowed(token));
        };

        let result = match &spec.kind {
            CommandKind::Shell(argv) => exec::run_argv(argv, self.timeout)
                .await
                .map(|out| non_empty(out, EMPTY_ALLOWED_OUTPUT)),
            CommandKind::Function(func) => {
                let func = func.clone();
                match tokio::task::spawn_blocking(move || func()).await {
                    Ok(result) => result,
                    Err(e) => Err(RexecError::Execution(format!("command panicked: {e}"))),
                }
            }
        };

        match result {
            Ok(out) => DispatchOutcome::Completed(out),
            Err(e) => failed(token, e),
        }
    }
}

fn non_empty(output: String, placeholder: &str) -> String {
    if output.is_empty() {
        placeholder.to_string()
    } else {
        output
    }
}

fn failed(command: &str, e: RexecError) -> DispatchOutcome {
    warn!(command = %command, error = %e, "command failed");
    DispatchOutcome::Failed(error_result(e))
}
