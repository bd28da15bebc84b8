//! Command-line interface

pub mod serve;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Hestia — on-demand HTTP gateway for managed backend services
#[derive(Parser)]
#[command(name = "hestia", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the gateway
    Serve(ServeArgs),
    /// Load and validate the configuration, then exit
    Validate(ValidateArgs),
}

#[derive(Args)]
pub struct ServeArgs {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = crate::config::DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Override listen port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Override listen host
    #[arg(long)]
    pub host: Option<String>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Args)]
pub struct ValidateArgs {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = crate::config::DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
}
