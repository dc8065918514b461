use std::{path::PathBuf, process::ExitCode};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{fmt, EnvFilter};
use trestle_core::{Host, HostConfig, InventorySource, PluginRegistry, EXIT_OK, EXIT_STARTUP_FAILURE};
// Linked for its plugin registrations.
use trestle_demo_plugins as _;

#[derive(Parser, Debug)]
#[command(name = "trestle", author, version, about = "Plugin host for HTTP services")]
struct Cli {
    /// Sets the log level (error, warn, info, debug, trace) or a full filter.
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover, activate and serve plugins using the supplied configuration.
    Run {
        #[arg(short, long, value_name = "FILE", default_value = "config/trestle.toml")]
        config: PathBuf,
    },
    /// Interact with configuration files.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Inspect the plugins linked into this binary.
    Plugins {
        #[command(subcommand)]
        command: PluginCommands,
    },
    /// Dump the resolved configuration as JSON.
    Diag {
        #[arg(short, long, value_name = "FILE", default_value = "config/trestle.toml")]
        config: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Validates the provided configuration file.
    Validate {
        #[arg(value_name = "FILE")]
        config: PathBuf,
    },
    /// Prints the bundled example configuration.
    Example,
}

#[derive(Subcommand, Debug)]
enum PluginCommands {
    /// Lists discovered plugins in activation order.
    List {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Serialize)]
struct PluginRow<'a> {
    order: usize,
    name: &'a str,
    version: String,
    dependencies: &'a [String],
    origin: &'a str,
    description: Option<&'a str>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    let result = match cli.command {
        Commands::Run { config } => return handle_run(config).await,
        Commands::Config { command } => handle_config(command),
        Commands::Plugins { command } => handle_plugins(command),
        Commands::Diag { config } => handle_diag(config),
    };
    match result {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_STARTUP_FAILURE)
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).try_init().ok();
}

async fn handle_run(config_path: PathBuf) -> ExitCode {
    let config = match HostConfig::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "failed to load configuration");
            return ExitCode::from(EXIT_STARTUP_FAILURE);
        }
    };
    match Host::new(config).run().await {
        Ok(summary) => {
            tracing::info!(routes = summary.routes_bound, "shutdown complete");
            ExitCode::from(EXIT_OK)
        }
        Err(err) => {
            tracing::error!(error = %err, "trestle host failed");
            ExitCode::from(err.exit_code())
        }
    }
}

fn handle_config(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Validate { config } => {
            let cfg = HostConfig::load(&config)?;
            cfg.validate()?;
            println!("configuration OK: {}", config.display());
        }
        ConfigCommands::Example => {
            println!("{}", include_str!("../../../config/trestle.toml"));
        }
    }
    Ok(())
}

fn handle_plugins(command: PluginCommands) -> Result<()> {
    match command {
        PluginCommands::List { json } => {
            let descriptors = PluginRegistry::discover(&InventorySource)?;
            let ordered = PluginRegistry::resolve_order(&descriptors)?;
            let rows: Vec<PluginRow<'_>> = ordered
                .iter()
                .enumerate()
                .map(|(idx, d)| PluginRow {
                    order: idx + 1,
                    name: d.name(),
                    version: d.version().to_string(),
                    dependencies: d.dependencies(),
                    origin: d.origin(),
                    description: d.identity().description.as_deref(),
                })
                .collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if rows.is_empty() {
                println!("no plugins are linked into this binary");
            } else {
                for row in rows {
                    let deps = if row.dependencies.is_empty() {
                        String::new()
                    } else {
                        format!(" (after {})", row.dependencies.join(", "))
                    };
                    println!(
                        "{}. {} v{}{deps} [{}]{}",
                        row.order,
                        row.name,
                        row.version,
                        row.origin,
                        row.description
                            .map(|d| format!(": {d}"))
                            .unwrap_or_default()
                    );
                }
            }
        }
    }
    Ok(())
}

fn handle_diag(path: PathBuf) -> Result<()> {
    let cfg = HostConfig::load(&path)
        .with_context(|| format!("diagnostics need a readable config at {}", path.display()))?;
    let json = serde_json::to_string_pretty(&cfg)?;
    println!("{json}");
    Ok(())
}
