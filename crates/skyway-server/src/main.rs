//! Skyway control plane entrypoint.

mod app;
mod cli;
mod config;
mod shutdown;
mod stores;

use anyhow::Context;
use app::App;
use clap::Parser;
use cli::{Cli, Commands};
use config::ServerConfig;
use skyway_db::Database;
use skyway_trace::{init_tracer, shutdown_tracer};
use skyway_worker::HttpWorkerClient;
use std::process;
use std::sync::Arc;
use stores::Stores;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let result = run(cli).await;
    shutdown_tracer();
    if let Err(e) = result {
        if tracing::enabled!(tracing::Level::ERROR) {
            error!(error = %format!("{e:#}"), "skyway terminated with error");
        } else {
            eprintln!("Error: {e:#}");
        }
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = ServerConfig::load(cli.config.as_deref(), &cli.overrides()).context("invalid configuration")?;

    match cli.subcommand() {
        Commands::CheckConfig => {
            let mut shown = config.clone();
            if shown.encryption_key.is_some() {
                shown.encryption_key = Some(skyway_secrets::REDACTED.to_string());
            }
            print!("{}", serde_yaml::to_string(&shown)?);
            Ok(())
        }
        Commands::Migrate => {
            init_tracer(&config.log)?;
            let db = Database::connect(&config.database_url).await?;
            db.migrate().await?;
            info!("Migrations applied");
            Ok(())
        }
        Commands::Run => {
            init_tracer(&config.log)?;
            info!(version = env!("CARGO_PKG_VERSION"), dev_mode = config.dev_mode, "Starting skyway");

            let stores = if config.dev_mode {
                info!("Dev mode: state is kept in memory");
                Stores::memory()
            } else {
                Stores::connect(&config).await.context("failed to connect stores")?
            };
            let app = App::new(config, stores, Arc::new(HttpWorkerClient::new())).await?;
            app.run(shutdown::shutdown_signal()).await
        }
    }
}
