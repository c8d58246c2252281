//! wadb CLI
//!
//! Thin command-line surface over the client library. It parses
//! addresses and prints results; all protocol decisions live below.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use wadb_client::{Config, ConnectionManager};

/// wadb - wireless debugging client.
#[derive(Parser, Debug)]
#[command(name = "wadb")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Run a one-shot shell command on the device
    Run {
        /// Device address as host:port
        address: String,

        /// Command line to execute
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Pair with a device using the code it displays
    Pair {
        /// Pairing endpoint address as host:port
        address: String,

        /// Six-digit pairing code
        code: String,
    },

    /// Check whether this client is trusted by the device
    Check {
        /// Device address as host:port
        address: String,
    },
}

/// Splits `host:port`, accepting bracketed IPv6 literals.
fn parse_address(address: &str) -> Result<(String, u16)> {
    let (host, port) = address
        .rsplit_once(':')
        .with_context(|| format!("address {address:?} is not host:port"))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid port in {address:?}"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        bail!("address {address:?} has an empty host");
    }
    Ok((host.to_string(), port))
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.validate().context("invalid configuration")?;
    let manager = ConnectionManager::new(config);

    match cli.command {
        Commands::Run { address, command } => {
            let (host, port) = parse_address(&address)?;
            let output = manager
                .run_shell_command(&host, port, &command.join(" "))
                .await?;
            print!("{output}");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Pair { address, code } => {
            let (host, port) = parse_address(&address)?;
            manager.pair(&host, port, &code).await?;
            println!("Paired with {address}");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Check { address } => {
            let (host, port) = parse_address(&address)?;
            if manager.is_paired(&host, port).await {
                println!("{address}: paired");
                Ok(ExitCode::SUCCESS)
            } else {
                println!("{address}: not paired");
                Ok(ExitCode::FAILURE)
            }
        }
    }
}
