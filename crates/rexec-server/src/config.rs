//! Server configuration: TOML file + CLI overrides.

use crate::commands::BUILTIN_TOKENS;
use rexec_core::protocol::DEFAULT_PORT;
use rexec_core::{RexecError, RexecResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub stop_flag: StopFlagSection,
    /// Extra allow-listed shell commands: `token = ["argv0", "arg", ...]`.
    #[serde(default)]
    pub commands: BTreeMap<String, Vec<String>>,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_access_code")]
    pub access_code: String,
    #[serde(default = "default_true")]
    pub allow_list: bool,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            access_code: default_access_code(),
            allow_list: true,
            max_connections: default_max_connections(),
            poll_interval_ms: default_poll_interval_ms(),
            command_timeout_secs: default_command_timeout_secs(),
            log_capacity: default_log_capacity(),
        }
    }
}

/// `[stop_flag]` section of the config TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopFlagSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_stop_flag_path")]
    pub path: String,
}

impl Default for StopFlagSection {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_stop_flag_path(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_access_code() -> String {
    "1957".to_string()
}
fn default_max_connections() -> usize {
    64
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_command_timeout_secs() -> u64 {
    30
}
fn default_log_capacity() -> usize {
    200
}
fn default_stop_flag_path() -> String {
    "~/server_stop.flag".to_string()
}
fn default_true() -> bool {
    true
}

/// Default config file location (`~/.rexec/server.toml`).
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".rexec")
        .join("server.toml")
}

/// Values given on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind_address: Option<String>,
    pub port: Option<u16>,
    pub access_code: Option<String>,
    pub allow_list: Option<bool>,
    pub max_connections: Option<usize>,
    pub stop_flag_enabled: Option<bool>,
    pub stop_flag_path: Option<String>,
}

impl ConfigOverrides {
    /// Whether no setting was given.
    pub fn is_empty(&self) -> bool {
        self.bind_address.is_none()
            && self.port.is_none()
            && self.access_code.is_none()
            && self.allow_list.is_none()
            && self.max_connections.is_none()
            && self.stop_flag_enabled.is_none()
            && self.stop_flag_path.is_none()
    }
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub access_code: String,
    pub allow_list: bool,
    pub max_connections: usize,
    pub poll_interval: Duration,
    pub command_timeout: Duration,
    pub log_capacity: usize,
    pub stop_flag_enabled: bool,
    pub stop_flag_path: PathBuf,
    pub commands: BTreeMap<String, Vec<String>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default(), &ConfigOverrides::default())
    }
}

impl ServerConfig {
    /// Load config from a TOML file, apply CLI overrides, then validate.
    ///
    /// A missing file yields the defaults. Nothing is bound or created here.
    pub fn load(config_path: Option<&Path>, overrides: &ConfigOverrides) -> RexecResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content).map_err(|e| {
                        RexecError::ConfigInvalid(format!("{}: {e}", expanded.display()))
                    })?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let config = Self::from_file(file_config, overrides);
        config.validate()?;
        Ok(config)
    }

    fn from_file(file: ConfigFile, overrides: &ConfigOverrides) -> Self {
        let ConfigFile {
            server,
            stop_flag,
            commands,
        } = file;

        let access_code = overrides
            .access_code
            .clone()
            .unwrap_or(server.access_code)
            .trim()
            .to_string();
        let stop_flag_path = overrides
            .stop_flag_path
            .clone()
            .unwrap_or(stop_flag.path);

        Self {
            bind_address: overrides
                .bind_address
                .clone()
                .unwrap_or(server.bind_address),
            port: overrides.port.unwrap_or(server.port),
            access_code,
            allow_list: overrides.allow_list.unwrap_or(server.allow_list),
            max_connections: overrides.max_connections.unwrap_or(server.max_connections),
            poll_interval: Duration::from_millis(server.poll_interval_ms),
            command_timeout: Duration::from_secs(server.command_timeout_secs),
            log_capacity: server.log_capacity,
            stop_flag_enabled: overrides.stop_flag_enabled.unwrap_or(stop_flag.enabled),
            stop_flag_path: expand_tilde_str(&stop_flag_path),
            commands,
        }
    }

    /// Reject configurations the server cannot run with.
    pub fn validate(&self) -> RexecResult<()> {
        self.bind_ip()?;
        if self.port == 0 {
            return Err(invalid("port must be between 1 and 65535"));
        }
        if self.access_code.is_empty() {
            return Err(invalid("access code must not be empty"));
        }
        if self.max_connections == 0 {
            return Err(invalid("max_connections must be at least 1"));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid("poll_interval_ms must be at least 1"));
        }
        if self.command_timeout.is_zero() {
            return Err(invalid("command_timeout_secs must be at least 1"));
        }
        if self.log_capacity == 0 {
            return Err(invalid("log_capacity must be at least 1"));
        }
        for (token, argv) in &self.commands {
            if token.trim().is_empty() || token.trim() != token {
                return Err(invalid(format!("command token {token:?} is not a bare word")));
            }
            if BUILTIN_TOKENS.contains(&token.as_str()) {
                return Err(invalid(format!("command '{token}' shadows a built-in command")));
            }
            if argv.first().map_or(true, |program| program.is_empty()) {
                return Err(invalid(format!("command '{token}' has an empty argv")));
            }
        }
        Ok(())
    }

    fn bind_ip(&self) -> RexecResult<IpAddr> {
        self.bind_address
            .trim()
            .parse::<IpAddr>()
            .map_err(|e| invalid(format!("bind address {:?}: {e}", self.bind_address)))
    }

    /// Address the listener binds to.
    pub fn socket_addr(&self) -> RexecResult<SocketAddr> {
        Ok(SocketAddr::new(self.bind_ip()?, self.port))
    }

    /// Convert back into the on-disk representation.
    pub fn to_file(&self) -> ConfigFile {
        ConfigFile {
            server: ServerSection {
                bind_address: self.bind_address.clone(),
                port: self.port,
                access_code: self.access_code.clone(),
                allow_list: self.allow_list,
                max_connections: self.max_connections,
                poll_interval_ms: self.poll_interval.as_millis() as u64,
                command_timeout_secs: self.command_timeout.as_secs(),
                log_capacity: self.log_capacity,
            },
            stop_flag: StopFlagSection {
                enabled: self.stop_flag_enabled,
                path: self.stop_flag_path.to_string_lossy().into_owned(),
            },
            commands: self.commands.clone(),
        }
    }

    /// Apply `overrides` to the file at `path` (or the defaults if it does
    /// not exist yet) and write the result back. Nothing is written if the
    /// result does not validate.
    pub fn update_file(path: &Path, overrides: &ConfigOverrides) -> RexecResult<Self> {
        let config = Self::load(Some(path), overrides)?;
        config.save(path)?;
        Ok(config)
    }

    /// Write the configuration back to a TOML file.
    pub fn save(&self, path: &Path) -> RexecResult<()> {
        let content = toml::to_string_pretty(&self.to_file())
            .map_err(|e| RexecError::Other(format!("config serialize error: {e}")))?;
        let path = expand_tilde(path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&path, content)?;
        info!(path = %path.display(), "config saved");
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> RexecError {
    RexecError::ConfigInvalid(message.into())
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
