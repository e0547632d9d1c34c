//! Dipbot - riskless dip arbitrage on UP/DOWN prediction-market pairs.

use anyhow::Result;
use clap::Parser;
use dotenv::dotenv;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dipbot::{App, BotConfig};

#[derive(Debug, Parser)]
#[command(name = "dipbot", about = "Prediction-market dip arbitrage core")]
struct Cli {
    /// Force paper execution (simulated fills).
    #[arg(long)]
    paper: bool,

    /// Force live execution (requires CLOB credentials).
    #[arg(long, conflicts_with = "paper")]
    live: bool,

    /// Market timeframe: 15m, 1h, 4h, daily.
    #[arg(long)]
    timeframe: Option<String>,

    /// SQLite database path.
    #[arg(long)]
    db: Option<String>,

    /// Run against a synthetic feed instead of the exchange.
    #[arg(long)]
    simulate_feed: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = BotConfig::from_env()?;
    if cli.paper {
        config.paper_mode = true;
    }
    if cli.live {
        config.paper_mode = false;
    }
    if let Some(tf) = cli.timeframe {
        config.timeframe = tf.parse()?;
    }
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    if cli.simulate_feed {
        config.simulate_feed = true;
    }
    config.validate()?;

    info!(db = config.db_path.as_str(), "configuration loaded");
    App::new(config)?.run().await
}
