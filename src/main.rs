use clap::Parser;
use clap::Subcommand;
use std::env;

use seqidx::config::IndexerConfig;
use seqidx::indexer::Indexer;
use seqidx::store::PgStorage;
use seqidx::types::Height;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "seqidx")]
#[command(about = "Maintenance commands for a seqidx database", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show current chain state
    Status,
    /// Roll back blocks down to, and excluding, given height
    Rollback { height: Height },
    /// Prune block signatures out of the retention window
    Prune,
}

#[tokio::main]
async fn main() -> Result<(), String> {
    // Configure tracing subscriber
    let filter = env::var("SEQIDX_LOG").unwrap_or(String::from("seqidx=info"));
    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_max_level(tracing::Level::INFO)
        .with_env_filter(filter)
        .finish();

    let _guard = tracing::subscriber::set_global_default(subscriber);

    tracing::info!("starting seqidx v{VERSION}");
    if cfg!(feature = "test-utilities") {
        tracing::warn!("build includes test-utilities, use cargo's `--no-default-features` flag");
    } else {
        tracing::debug!("compiled without test-utilities");
    }

    let cli = Cli::parse();

    let config = IndexerConfig::from_env().map_err(|e| e.to_string())?;
    let storage = PgStorage::connect(&config.postgres, config.store)
        .await
        .map_err(|e| e.to_string())?;
    let indexer = Indexer::new(&config.name, storage);

    let state = indexer.state().await.map_err(|e| e.to_string())?;
    let Some(state) = state else {
        tracing::info!("chain state {} is not initialized yet", config.name);
        return Ok(());
    };

    match cli.command {
        Command::Status => {
            tracing::info!(
                "{} at height {} ({} txs, {} accounts, {} rollups, supply {})",
                state.name,
                state.last_height,
                state.total_tx,
                state.total_accounts,
                state.total_rollups,
                state.total_supply,
            );
        }
        Command::Rollback { height: target } => {
            let mut head = state.last_height;
            while head > target {
                head = indexer.roll_back(head).await.map_err(|e| e.to_string())?;
            }
            tracing::info!("head is now at {head}");
        }
        Command::Prune => {
            indexer
                .prune(state.last_height)
                .await
                .map_err(|e| e.to_string())?;
        }
    }
    Ok(())
}
