//! Command-line definitions.

use crate::config::Overrides;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "skyway")]
#[command(author, version, about = "Skyway CI control plane", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to ./skyway.yaml when present)
    #[arg(short, long, global = true, env = "SKYWAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Keep all state in memory
    #[arg(long, global = true)]
    pub dev: bool,

    /// PostgreSQL connection string
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// NATS server URL
    #[arg(long, global = true)]
    pub nats_url: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the control plane (default)
    Run,

    /// Apply database migrations and exit
    Migrate,

    /// Print the effective configuration and exit
    CheckConfig,
}

impl Cli {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            dev_mode: self.dev,
            database_url: self.database_url.clone(),
            nats_url: self.nats_url.clone(),
            log_level: self.log_level.clone(),
        }
    }

    pub fn subcommand(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Run)
    }
}
