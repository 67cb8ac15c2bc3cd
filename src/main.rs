// src/main.rs
use anyhow::Context;
use clap::Parser;
use exchange_desk::config;
use exchange_desk::coordinator::RefreshCoordinator;
use exchange_desk::service::HttpTradeDataService;
use exchange_desk::store::ResultStore;
use exchange_desk::types::PairStatus;
use exchange_desk::utils::setup_logging;
use log::{error, info, warn};
use std::sync::Arc;

/// Live marketplace watcher and undercut pricing desk.
#[derive(Debug, Parser)]
#[command(name = "exchange-desk", version)]
struct Cli {
    /// Override the trade data service base URL.
    #[arg(long)]
    base_url: Option<String>,

    /// Override the configured league.
    #[arg(long)]
    league: Option<String>,

    /// Refresh every pair once, print the board, and exit.
    #[arg(long)]
    refresh_all: bool,

    /// Force a fresh upstream fetch on the initial load.
    #[arg(long)]
    force_fresh: bool,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    setup_logging(level).expect("Failed to initialize logging");

    let mut app_config = (*config::load_config()?).clone();
    if let Some(base_url) = cli.base_url {
        app_config.api_base_url = base_url;
    }
    if let Some(league) = cli.league {
        app_config.league = league;
    }
    let app_config = Arc::new(app_config);

    let service = Arc::new(HttpTradeDataService::new(&app_config)?);
    let store = Arc::new(ResultStore::new());
    let coordinator = Arc::new(RefreshCoordinator::new(
        service,
        store,
        Arc::clone(&app_config),
    ));

    // Establish the configured pair order (and any cached data) up front so
    // streamed messages always have a slot to land in.
    match coordinator.prime_from_cache().await {
        Ok(count) => info!("Tracking {} pairs in {}", count, app_config.league),
        Err(e) => {
            error!("Could not prime from upstream cache: {}", e);
            return Err(e).context("upstream service unreachable");
        }
    }

    if cli.refresh_all {
        let board = coordinator.refresh_all().await?;
        for summary in &board {
            let best = summary
                .best_rate
                .map(|r| format!("{:.6}", r))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "[{}] {} status={} best={} listings={}",
                summary.index, summary.pair, summary.status, best, summary.count_returned
            );
        }
        let failed = board
            .iter()
            .filter(|s| s.status != PairStatus::Ok)
            .count();
        if failed > 0 {
            warn!("{} of {} pairs did not refresh cleanly", failed, board.len());
        }
        return Ok(());
    }

    coordinator.start(cli.force_fresh).await?;
    coordinator.start_background().await;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    coordinator.stop().await;
    Ok(())
}
