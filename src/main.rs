mod api;
mod cli;
mod config;
mod db;
mod models;
mod services;
mod utils;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::AppConfig;

#[derive(Parser)]
#[command(name = "arbscout")]
#[command(about = "Sports betting arbitrage monitor backed by The Odds API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        #[arg(short, long, default_value = "3000")]
        port: u16,
    },
    /// Run one refresh cycle and print the report
    Refresh,
    /// List the upstream sports catalogue
    Sports,
    /// Show recorded opportunities
    Opportunities {
        #[arg(short, long)]
        sport: Option<String>,
        #[arg(short, long)]
        min_profit: Option<f64>,
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
    /// Delete opportunities older than the given number of days
    Purge {
        #[arg(short, long, default_value = "30")]
        days: i64,
    },
    /// Initialize the database
    InitDb,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Load environment variables
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let config = AppConfig::from_env()?;

    match cli.command {
        Some(Commands::Serve { port }) => {
            tracing::info!("Starting arbscout API server on port {}", port);
            api::serve(port, config).await?;
        }
        Some(Commands::Refresh) => {
            cli::refresh_once(&config).await?;
        }
        Some(Commands::Sports) => {
            cli::show_sports(&config).await?;
        }
        Some(Commands::Opportunities { sport, min_profit, limit }) => {
            cli::show_opportunities(&config, sport, min_profit, limit).await?;
        }
        Some(Commands::Purge { days }) => {
            cli::purge(&config, days).await?;
        }
        Some(Commands::InitDb) => {
            tracing::info!("Initializing database...");
            cli::init_db(&config).await?;
        }
        None => {
            // Default to serving
            tracing::info!("Starting arbscout API server on port 3000");
            api::serve(3000, config).await?;
        }
    }

    Ok(())
}
