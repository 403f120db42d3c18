//! Client configuration at `~/.rexec/client.toml`.
//!
//! Provides the default host, port, access code and timeout.
//! CLI flags always override config file values.

use anyhow::{Context, Result};
use rexec_core::DEFAULT_PORT;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Default connection settings.
    #[serde(default)]
    pub default: DefaultConfig,
}

/// Default connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultConfig {
    /// Default server host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Default server port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Access code to present (unset = must be given on the command line).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_code: Option<String>,

    /// Connect and first-reply timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DefaultConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            access_code: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_timeout_secs() -> u64 {
    5
}

/// Default config file location (`~/.rexec/client.toml`).
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".rexec")
        .join("client.toml")
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Save the configuration to a TOML file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("failed to serialize config")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("failed to write config to {}", path.display()))?;

        Ok(())
    }
}

/// Parse a `host[:port]` target. A bare host keeps `default_port`.
pub fn parse_target(target: &str, default_port: u16) -> Result<(String, u16)> {
    let target = target.trim();
    if target.is_empty() {
        anyhow::bail!("empty host");
    }
    // Bracketed or bare IPv6 literals carry colons of their own.
    if let Some(rest) = target.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .with_context(|| format!("unterminated '[' in target '{target}'"))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(port, target)?,
            None if tail.is_empty() => default_port,
            None => anyhow::bail!("unexpected text after ']' in target '{target}'"),
        };
        return Ok((host.to_string(), port));
    }
    match target.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            if host.is_empty() {
                anyhow::bail!("empty host in target '{target}'");
            }
            Ok((host.to_string(), parse_port(port, target)?))
        }
        _ => Ok((target.to_string(), default_port)),
    }
}

fn parse_port(port: &str, target: &str) -> Result<u16> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => anyhow::bail!("invalid port in target '{target}'"),
        Ok(port) => Ok(port),
    }
}
