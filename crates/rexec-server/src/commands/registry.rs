//! Allow-listed commands.
//!
//! Maps a command token to either a fixed argv (run as a child process) or
//! an in-process function. The registry is built once before the listener
//! starts and has no mutating methods afterwards.

use rexec_core::{RexecError, RexecResult};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, UdpSocket};
use std::sync::Arc;
use tracing::{debug, info};

/// Zero-argument in-process command.
pub type CommandFn = Arc<dyn Fn() -> RexecResult<String> + Send + Sync>;

/// Tokens always present in the default registry.
pub const BUILTIN_TOKENS: &[&str] = &["get_ip", "ping_router"];

/// What running a command means.
#[derive(Clone)]
pub enum CommandKind {
    /// Spawn `argv[0]` with the remaining elements as arguments.
    Shell(Vec<String>),
    /// Call a function inside the server process.
    Function(CommandFn),
}

impl fmt::Debug for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::Shell(argv) => f.debug_tuple("Shell").field(argv).finish(),
            CommandKind::Function(_) => f.write_str("Function(..)"),
        }
    }
}

/// A single allow-listed command.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub token: String,
    pub kind: CommandKind,
}

impl CommandSpec {
    pub fn shell<I, S>(token: impl Into<String>, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            token: token.into(),
            kind: CommandKind::Shell(argv.into_iter().map(Into::into).collect()),
        }
    }

    pub fn function<F>(token: impl Into<String>, func: F) -> Self
    where
        F: Fn() -> RexecResult<String> + Send + Sync + 'static,
    {
        Self {
            token: token.into(),
            kind: CommandKind::Function(Arc::new(func)),
        }
    }
}

/// Immutable token → command table.
#[derive(Debug, Default)]
pub struct CommandRegistry {
    commands: BTreeMap<String, CommandSpec>,
}

impl CommandRegistry {
    /// Build a registry from specs, rejecting duplicate tokens and empty argvs.
    pub fn from_specs(specs: impl IntoIterator<Item = CommandSpec>) -> RexecResult<Self> {
        let mut commands = BTreeMap::new();
        for spec in specs {
            if let CommandKind::Shell(argv) = &spec.kind {
                if argv.first().map_or(true, |program| program.is_empty()) {
                    return Err(RexecError::ConfigInvalid(format!(
                        "command '{}' has an empty argv",
                        spec.token
                    )));
                }
            }
            if commands.contains_key(&spec.token) {
                return Err(RexecError::ConfigInvalid(format!(
                    "duplicate command token '{}'",
                    spec.token
                )));
            }
            commands.insert(spec.token.clone(), spec);
        }
        Ok(Self { commands })
    }

    /// Built-in commands plus extra shell commands from config.
    pub fn with_builtins(extra: &BTreeMap<String, Vec<String>>) -> RexecResult<Self> {
        let specs = builtin_specs().into_iter().chain(
            extra
                .iter()
                .map(|(token, argv)| CommandSpec::shell(token.clone(), argv.clone())),
        );
        let registry = Self::from_specs(specs)?;
        info!(count = registry.len(), "command registry built");
        Ok(registry)
    }

    /// Exact, case-sensitive lookup.
    pub fn get(&self, token: &str) -> Option<&CommandSpec> {
        self.commands.get(token)
    }

    /// Registered tokens in sorted order.
    pub fn tokens(&self) -> Vec<String> {
        self.commands.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }
}

fn builtin_specs() -> Vec<CommandSpec> {
    let count_flag = if cfg!(windows) { "-n" } else { "-c" };
    vec![
        CommandSpec::function("get_ip", primary_ipv4),
        CommandSpec::shell("ping_router", ["ping", count_flag, "4", "192.168.1.1"]),
    ]
}

/// The IPv4 address this host would use for outbound traffic.
///
/// Connecting a UDP socket sends nothing; it only asks the OS to pick a
/// route. Hosts without a route report loopback.
pub fn primary_ipv4() -> RexecResult<String> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    match socket
        .connect((Ipv4Addr::new(8, 8, 8, 8), 80))
        .and_then(|_| socket.local_addr())
    {
        Ok(addr) if !addr.ip().is_unspecified() => Ok(addr.ip().to_string()),
        Ok(_) => Ok(Ipv4Addr::LOCALHOST.to_string()),
        Err(e) => {
            debug!(error = %e, "no outbound route, reporting loopback");
            Ok(Ipv4Addr::LOCALHOST.to_string())
        }
    }
}
