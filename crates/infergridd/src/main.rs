//! infergridd: the InferGrid control plane daemon.
//!
//! Single binary that assembles every subsystem:
//! - State store (redb)
//! - Capacity allocator, scheduler and router
//! - Health registry, runtime probes and safety monitor
//! - Fleet reconciler and deployment controller
//! - Credential vault
//! - HTTP API
//!
//! # Usage
//!
//! ```text
//! infergridd serve --port 8080 --data-dir /var/lib/infergrid --config infergrid.toml
//! infergridd config --print-defaults
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use infergrid_core::ControlPlaneConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,infergridd=debug,infergrid=debug";

#[derive(Parser)]
#[command(name = "infergridd", about = "InferGrid control plane daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane: API server plus reconcile and health loops.
    Serve {
        /// Port to listen on (overrides `server.port`).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state (overrides `server.data_dir`).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Path to infergrid.toml.
        #[arg(long, env = "INFERGRID_CONFIG")]
        config: Option<PathBuf>,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
    /// Inspect configuration.
    Config {
        /// Print the default configuration as TOML.
        #[arg(long)]
        print_defaults: bool,

        /// Validate a configuration file and exit.
        #[arg(long)]
        check: Option<PathBuf>,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ControlPlaneConfig> {
    let mut config = match path {
        Some(path) => ControlPlaneConfig::from_file(path)?,
        None => ControlPlaneConfig::default(),
    };
    config.apply_env(|name| std::env::var(name).ok());
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            port,
            data_dir,
            config,
            log_json,
        } => {
            init_tracing(log_json);
            let mut config = load_config(config.as_ref())?;
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.server.data_dir = data_dir;
            }
            info!(port = config.server.port, data_dir = ?config.server.data_dir, "configuration loaded");
            infergridd::control_plane::run(config).await
        }
        Command::Config { print_defaults, check } => {
            if print_defaults {
                print!("{}", ControlPlaneConfig::default().to_toml_string()?);
                return Ok(());
            }
            match check {
                Some(path) => {
                    load_config(Some(&path))?;
                    println!("{}: ok", path.display());
                    Ok(())
                }
                None => anyhow::bail!("nothing to do: pass --print-defaults or --check <path>"),
            }
        }
    }
}
