//! rexec — client for the rexec remote command server.
//!
//! Connects over TCP, presents the access code, and either runs an
//! interactive command loop or a single command.

mod commands;
mod config;
mod session;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use commands::Target;
use std::path::PathBuf;
use std::time::Duration;
use tracing::error;

/// rexec — remote command client
#[derive(Parser)]
#[command(name = "rexec", version, about = "Run commands on a rexec server")]
struct Cli {
    /// Server port
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Access code
    #[arg(short = 'c', long = "code", global = true, env = "REXEC_ACCESS_CODE", hide_env_values = true)]
    code: Option<String>,

    /// Connect and first-reply timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Config file path
    #[arg(long = "config", global = true)]
    config: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open an interactive session
    Connect {
        /// Server as host[:port] (defaults to the configured host)
        host: Option<String>,
    },

    /// Run a single command and print its output
    Exec {
        /// Server as host[:port]
        host: String,
        /// Command to run
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Show or update the client config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the config (access code masked)
    Show,
    /// Save connection defaults; combine with --port, --code and --timeout
    Set {
        /// Default server as host[:port]
        #[arg(long)]
        host: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing.
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("rexec=debug,rexec_cli=debug,rexec_core=debug")
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("rexec=warn,rexec_cli=warn")
            .with_target(false)
            .init();
    }

    let result = run(cli).await;
    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("rexec: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli
        .config
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(config::default_config_path);
    let cfg = config::Config::load(&config_path)?;

    let resolve = |host: Option<&str>| -> Result<Target> {
        let default_port = cli.port.unwrap_or(cfg.default.port);
        let (host, port) = match host {
            Some(host) => config::parse_target(host, default_port)?,
            None => (cfg.default.host.clone(), default_port),
        };
        let access_code = cli
            .code
            .clone()
            .or_else(|| cfg.default.access_code.clone())
            .context("no access code: pass --code, set REXEC_ACCESS_CODE, or add access_code to the config")?;
        Ok(Target {
            host,
            port,
            access_code,
            timeout: Duration::from_secs(cli.timeout.unwrap_or(cfg.default.timeout_secs).max(1)),
        })
    };

    match &cli.command {
        Command::Connect { host } => commands::connect::run(&resolve(host.as_deref())?).await,
        Command::Exec { host, command } => {
            let target = resolve(Some(host))?;
            commands::exec::run(&target, &command.join(" ")).await
        }
        Command::Config { action } => match action {
            ConfigAction::Show => commands::config::show(&config_path),
            ConfigAction::Set { host } => commands::config::set(
                &config_path,
                commands::config::Changes {
                    host: host.clone(),
                    port: cli.port,
                    access_code: cli.code.clone(),
                    timeout_secs: cli.timeout,
                },
            ),
        },
    }
}
