// nrctl: operator tool for router tunables, ping replies and route tables

mod config;
mod topology;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use netrouter_core::ping::{self, MAX_RTR_NIS};
use netrouter_core::NiState;
use std::path::PathBuf;
use tracing::debug;

#[derive(Parser)]
#[command(name = "nrctl")]
#[command(about = "NetRouter: route table and router health tools", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file to use instead of the platform default
    #[arg(long, global = true)]
    config_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or change router tunables
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Decode a captured ping reply given as hex
    Decode {
        hex: String,
        /// Most interface entries to decode
        #[arg(short, long, default_value_t = MAX_RTR_NIS)]
        max: usize,
    },
    /// Apply a static topology's routes and check them for conflicts
    Check { topology: PathBuf },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config { action } => cmd_config(cli.config_file, action),
        Commands::Decode { hex, max } => cmd_decode(&hex, max),
        Commands::Check { topology } => cmd_check(cli.config_file, &topology),
    }
}

fn load_config(path: Option<PathBuf>) -> Result<config::ConfigFile> {
    match path {
        Some(path) => config::ConfigFile::load_from(&path),
        None => config::ConfigFile::load(),
    }
}

fn cmd_config(path: Option<PathBuf>, action: ConfigAction) -> Result<()> {
    let mut file = load_config(path)?;

    match action {
        ConfigAction::Set { key, value } => {
            file.set(&key, &value)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            let effective = file.effective()?;
            match effective.get(&key) {
                Some(value) => println!("{} = {}", key.bright_cyan(), value),
                None => anyhow::bail!("Unknown config key: {}", key),
            }
        }

        ConfigAction::List => {
            println!("{}", "Router configuration".bold());
            println!();
            for (key, value) in file.list() {
                println!("  {:<28} {}", key.bright_cyan(), value);
            }
        }
    }

    Ok(())
}

fn cmd_decode(input: &str, max: usize) -> Result<()> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = hex::decode(&compact).context("Reply is not valid hex")?;
    let info = ping::parse(&bytes, bytes.len(), max).context("Invalid ping reply")?;

    println!("{}", "Ping reply".bold());
    println!("  Version:    {}", info.version);
    println!("  PID:        {}", info.pid);
    println!("  Interfaces: {} declared, {} decoded", info.nnis, info.entries.len());
    println!();

    for entry in &info.entries {
        let status = match entry.state() {
            Some(NiState::Up) => "up".green(),
            Some(NiState::Down) => "down".red(),
            Some(NiState::Invalid) => "unknown".dimmed(),
            None => format!("{:#010x}", entry.status).yellow(),
        };
        println!("  {:<24} {}", entry.nid.to_string().bright_cyan(), status);
    }

    Ok(())
}

fn cmd_check(config_path: Option<PathBuf>, path: &std::path::Path) -> Result<()> {
    let router_config = load_config(config_path)?.effective()?;
    let topology = topology::Topology::load(path)?;
    debug!(
        "Topology {}: {} interfaces, {} routes",
        path.display(),
        topology.interfaces.len(),
        topology.routes.len()
    );
    let (router, applied) = topology::build(&topology, router_config)?;

    println!("{}", "Routes".bold());
    for a in &applied {
        match &a.result {
            Ok(()) => println!("  {} {}", "✓".green(), a.description),
            Err(e) => println!("  {} {}: {}", "✗".red(), a.description, e),
        }
    }
    println!();

    println!("{}", "Route table".bold());
    let routes = router.routes();
    if routes.is_empty() {
        println!("  {}", "(empty)".dimmed());
    }
    for (i, r) in routes.iter().enumerate() {
        println!("  {:>3}. {:<10} {:>3} hops via {}", i, r.net.to_string().bright_cyan(), r.hops, r.gateway);
    }
    println!();

    router.check_routes().context("Route table is inconsistent")?;
    println!("{} No conflicting egress interfaces", "✓".green());
    Ok(())
}
