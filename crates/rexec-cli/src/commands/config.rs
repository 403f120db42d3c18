//! `rexec config` — inspect or update the client config file.

use anyhow::{Context, Result};
use std::path::Path;

use crate::config::{parse_target, Config};

/// Fields to overwrite in the `[default]` section.
#[derive(Debug, Default)]
pub struct Changes {
    /// `host[:port]`; an explicit port here wins over `port`.
    pub host: Option<String>,
    pub port: Option<u16>,
    pub access_code: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl Changes {
    fn is_empty(&self) -> bool {
        self.host.is_none()
            && self.port.is_none()
            && self.access_code.is_none()
            && self.timeout_secs.is_none()
    }
}

/// Print the config file with the access code masked.
pub fn show(path: &Path) -> Result<()> {
    let cfg = Config::load(path)?;
    println!("# {}", path.display());
    print!("{}", render_masked(&cfg)?);
    Ok(())
}

/// Apply `changes` to the config at `path` and write it back.
pub fn set(path: &Path, changes: Changes) -> Result<()> {
    if changes.is_empty() {
        anyhow::bail!("nothing to set: pass --host, --port, --code or --timeout");
    }
    let mut cfg = Config::load(path)?;
    apply(&mut cfg, changes)?;
    cfg.save(path)?;
    println!("Saved {}", path.display());
    Ok(())
}

fn apply(cfg: &mut Config, changes: Changes) -> Result<()> {
    if let Some(port) = changes.port {
        if port == 0 {
            anyhow::bail!("port must be between 1 and 65535");
        }
        cfg.default.port = port;
    }
    if let Some(host) = changes.host {
        let (host, port) = parse_target(&host, cfg.default.port)?;
        cfg.default.host = host;
        cfg.default.port = port;
    }
    if let Some(code) = changes.access_code {
        let code = code.trim();
        if code.is_empty() {
            anyhow::bail!("access code must not be empty");
        }
        cfg.default.access_code = Some(code.to_string());
    }
    if let Some(timeout) = changes.timeout_secs {
        cfg.default.timeout_secs = timeout.max(1);
    }
    Ok(())
}

fn render_masked(cfg: &Config) -> Result<String> {
    let mut shown = cfg.clone();
    if let Some(code) = shown.default.access_code.as_mut() {
        *code = "*".repeat(code.chars().count());
    }
    toml::to_string_pretty(&shown).context("failed to serialize config")
}
