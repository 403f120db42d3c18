//! CLI subcommand implementations.

pub mod config;
pub mod connect;
pub mod exec;

use std::time::Duration;

/// Where and how to connect, resolved from flags and the config file.
#[derive(Debug, Clone)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub access_code: String,
    pub timeout: Duration,
}
