use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jc_adapters::{
    board_for_source, board_with_policy, discover_from_cache, run_analysis, JobBoard,
};
use jc_core::{AnalysisContext, CatcherConfig, SkipKnownOffers};
use jc_storage::PageCache;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jc-cli")]
#[command(about = "Extract job offers from cached job-board pages")]
struct Cli {
    /// Board to work on.
    #[arg(long, default_value = "PoleEmploi")]
    board: String,

    /// SQLite database holding the board tables (overrides JC_DATABASE).
    #[arg(long)]
    database: Option<PathBuf>,

    /// Page cache root (overrides JC_CACHE_DIR).
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the board table if it does not exist.
    Init,
    /// Print offer URLs found in cached feeds, one JSON object per line.
    Urls,
    /// Analyze cached offer pages into the board table.
    Analyze {
        /// Skip pages whose offer id is already stored.
        #[arg(long)]
        only_new: bool,
    },
    /// Print complete stored offers, one JSON object per line.
    Offers,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut config = CatcherConfig::from_env();
    if let Some(database) = cli.database {
        config.database = database;
    }
    if let Some(cache_dir) = cli.cache_dir {
        config.cache_dir = cache_dir;
    }

    let board = board_for_source(&cli.board, &config)?
        .with_context(|| format!("no board registered for {}", cli.board))?;
    let cache = PageCache::new(config.cache_dir.clone());

    match cli.command.unwrap_or(Commands::Analyze { only_new: false }) {
        Commands::Init => {
            let created = board.ensure_schema().await?;
            println!(
                "table for {}: {}",
                board.name(),
                if created { "created" } else { "already present" }
            );
        }
        Commands::Urls => {
            for discovered in discover_from_cache(board.as_ref(), &cache).await? {
                println!("{}", serde_json::to_string(&discovered)?);
            }
        }
        Commands::Analyze { only_new } => {
            board.ensure_schema().await?;
            let board = if only_new {
                let known = board
                    .stored_offers()
                    .await?
                    .into_iter()
                    .filter_map(|row| row.offerid);
                board_with_policy(&cli.board, &config, Box::new(SkipKnownOffers::new(known)))?
                    .with_context(|| format!("no board registered for {}", cli.board))?
            } else {
                board
            };
            let pages = cache
                .load_pages(board.name())
                .await
                .with_context(|| format!("loading cached pages for {}", board.name()))?;
            let ctx = AnalysisContext::now();
            let summary = run_analysis(board.as_ref(), &ctx, &pages).await?;
            println!("{}", serde_json::to_string(&summary)?);
        }
        Commands::Offers => {
            for row in board.stored_offers().await? {
                match board.build_offer(&row) {
                    Some(offer) => println!("{}", serde_json::to_string(&offer)?),
                    None => tracing::debug!(offerid = ?row.offerid, "skipping incomplete row"),
                }
            }
        }
    }

    Ok(())
}
