//! rexec-server: access-code gated remote command execution.
//!
//! Listens on TCP, authenticates each client with a shared access code and
//! runs the commands it sends, either from an allow-list or through the
//! system shell. Stops on Ctrl+C/SIGTERM, on the admin console's `stop`, or
//! when the stop-flag file appears.

mod commands;
mod config;
mod console;
mod handler;
mod log_sink;
mod registry;
mod server;
mod shutdown;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use config::{ConfigOverrides, ServerConfig};
use rexec_core::FileStopSignal;
use server::RexecServer;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// rexec-server — remote command execution server
#[derive(Parser, Debug)]
#[command(name = "rexec-server", version, about = "Remote command execution server")]
struct Cli {
    /// Config file path (default: ~/.rexec/server.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server (default)
    Serve(ServeArgs),

    /// Ask a running server to stop by creating its stop-flag file
    Stop {
        /// Flag file to create (defaults to the configured path)
        #[arg(long)]
        flag: Option<String>,
    },

    /// Manage the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args, Debug, Default)]
struct ServeArgs {
    #[command(flatten)]
    settings: SettingsArgs,

    /// Read admin commands from stdin
    #[arg(long)]
    console: bool,
}

/// Settings shared by `serve` and `config init|set`.
#[derive(clap::Args, Debug, Default)]
struct SettingsArgs {
    /// Address to bind
    #[arg(short, long)]
    bind: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Shared access code
    #[arg(long, env = "REXEC_ACCESS_CODE", hide_env_values = true)]
    access_code: Option<String>,

    /// Run any command through the system shell instead of the allow-list
    #[arg(long, conflicts_with = "allow_list")]
    unrestricted: bool,

    /// Only run allow-listed commands
    #[arg(long)]
    allow_list: bool,

    /// Maximum concurrent connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Stop-flag file to poll
    #[arg(long)]
    stop_flag: Option<String>,

    /// Do not poll a stop-flag file
    #[arg(long, conflicts_with = "stop_flag")]
    no_stop_flag: bool,
}

impl SettingsArgs {
    fn overrides(&self) -> ConfigOverrides {
        let allow_list = if self.unrestricted {
            Some(false)
        } else {
            self.allow_list.then_some(true)
        };
        let stop_flag_enabled = if self.no_stop_flag {
            Some(false)
        } else {
            self.stop_flag.as_ref().map(|_| true)
        };
        ConfigOverrides {
            bind_address: self.bind.clone(),
            port: self.port,
            access_code: self.access_code.clone(),
            allow_list,
            max_connections: self.max_connections,
            stop_flag_enabled,
            stop_flag_path: self.stop_flag.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Write a new config file from the defaults and any given settings
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,

        #[command(flatten)]
        settings: SettingsArgs,
    },
    /// Change settings in the config file, keeping everything else
    Set(SettingsArgs),
    /// Print the resolved config
    Show,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config_path = cli
        .config
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(config::default_config_path);
    let result = match cli.command {
        None => serve(&config_path, ServeArgs::default()).await,
        Some(Command::Serve(args)) => serve(&config_path, args).await,
        Some(Command::Stop { flag }) => stop(&config_path, flag),
        Some(Command::Config { action }) => config_action(&config_path, action),
    };

    // Exit explicitly: a console blocked on stdin would otherwise hold the
    // runtime open until the next line arrives.
    let code = match result {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %format!("{e:#}"), "rexec-server failed");
            1
        }
    };
    std::process::exit(code);
}

async fn serve(config_path: &Path, args: ServeArgs) -> anyhow::Result<()> {
    let config = ServerConfig::load(Some(config_path), &args.settings.overrides())
        .context("failed to load config")?;

    let server = Arc::new(RexecServer::new(config).context("failed to create server")?);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %server.config().bind_address,
        port = server.config().port,
        "starting rexec-server"
    );
    let mut run = tokio::spawn(server.clone().run());

    if args.console {
        let console_server = server.clone();
        tokio::spawn(async move {
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            if let Err(e) = console::run_console(console_server, stdin, tokio::io::stdout()).await {
                warn!(error = %e, "admin console stopped");
            }
        });
    }

    let joined = tokio::select! {
        joined = &mut run => joined,
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            if !server.request_shutdown() {
                // Still binding; nothing to drain.
                run.abort();
            }
            run.await
        }
    };

    match joined {
        Ok(result) => result.context("server error")?,
        Err(e) if e.is_cancelled() => {}
        Err(e) => bail!("server task failed: {e}"),
    }

    info!("rexec-server stopped");
    Ok(())
}

fn stop(config_path: &Path, flag: Option<String>) -> anyhow::Result<()> {
    let overrides = ConfigOverrides {
        stop_flag_path: flag,
        ..ConfigOverrides::default()
    };
    let config = ServerConfig::load(Some(config_path), &overrides).context("failed to load config")?;
    if !config.stop_flag_enabled {
        warn!("stop flag is disabled in the config, the server may not notice it");
    }

    let signal = FileStopSignal::new(&config.stop_flag_path);
    signal
        .raise()
        .with_context(|| format!("failed to create {}", config.stop_flag_path.display()))?;
    println!("Stop flag written to {}", config.stop_flag_path.display());
    Ok(())
}

fn config_action(config_path: &Path, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init { force, settings } => {
            let path = config::expand_tilde(config_path);
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            ServerConfig::load(None, &settings.overrides())
                .context("invalid settings")?
                .save(&path)
                .context("failed to write config")?;
            println!("Wrote config to {}", path.display());
        }
        ConfigAction::Set(settings) => {
            let overrides = settings.overrides();
            if overrides.is_empty() {
                bail!("nothing to set, see `rexec-server config set --help`");
            }
            ServerConfig::update_file(config_path, &overrides)
                .context("failed to update config")?;
            println!("Saved {}", config::expand_tilde(config_path).display());
        }
        ConfigAction::Show => {
            let config = ServerConfig::load(Some(config_path), &ConfigOverrides::default())
                .context("failed to load config")?;
            let mut file = config.to_file();
            file.server.access_code = "*".repeat(file.server.access_code.len());
            let rendered = toml::to_string_pretty(&file).context("failed to render config")?;
            print!("{rendered}");
        }
    }
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
