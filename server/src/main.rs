use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use liveguard_server::config::BotConfig;
use liveguard_server::db::pool::{create_pool, run_migrations};
use liveguard_server::platform::discord;
use liveguard_server::store::{ConfigStore, SqliteDocumentStore};

#[derive(Parser)]
#[command(name = "liveguard", about = "Limits how many members may go live per voice channel")]
struct Args {
    /// Path to the TOML config file.
    #[arg(long, default_value = "liveguard.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = BotConfig::load(&args.config)?;

    let pool = create_pool(&config.database.url)
        .await
        .context("failed to connect to database")?;
    run_migrations(&pool)
        .await
        .context("failed to run database migrations")?;

    let store = ConfigStore::connect(
        Arc::new(SqliteDocumentStore::new(pool)),
        config.store_settings(),
    )
    .await
    .context("config store unavailable")?;

    info!("liveguard starting");
    discord::run(&config, Arc::new(store)).await
}
