//! nfttrack-indexer binary entry point.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use nfttrack_indexer::config::Config;
use nfttrack_indexer::storage::Storage;
use nfttrack_indexer::supervisor::Supervisor;

#[derive(Parser)]
#[command(name = "nfttrack-indexer", version, about = "NFT event tracker service")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the tracker service until a fatal error or SIGINT.
    Run,
    /// Print database statistics and exit.
    Status,
    /// Create or migrate the database schema and exit.
    InitDb,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)?;

    match cli.command {
        Command::Run => Supervisor::new(config).run().await,
        Command::Status => {
            let storage = Storage::new(&config.database.url).await?;
            let stats = storage.stats().await?;
            println!("collections: {}", stats.collection_count);
            println!("items:       {}", stats.item_count);
            println!("orders:      {}", stats.order_count);
            println!("activity:    {}", stats.activity_count);
            println!("blocks:      {}", stats.block_count);
            storage.close().await;
            Ok(())
        }
        Command::InitDb => {
            let storage = Storage::new(&config.database.url).await?;
            storage.run_migrations().await?;
            storage.close().await;
            Ok(())
        }
    }
}
