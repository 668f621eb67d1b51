use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use vulnview_client::{FeedConfig, NvdClient};
use vulnview_store::{CveRepository, Database};
use vulnview_sync::{IngestService, Reconciler, ReconcilerConfig, SyncConfig};
use vulnview_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "vulnview")]
#[command(about = "CVE feed reconciliation service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the read API with background feed ingestion.
    Serve,
    /// Run one reconciliation pass over the feed and exit.
    Sync,
    /// Open the store and apply pending migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await?,
        Commands::Sync => sync_once(config).await?,
        Commands::Migrate => {
            let db = Database::connect(&config.database_path).await?;
            db.close().await;
            println!("migrations applied: {}", config.database_path.display());
        }
    }

    Ok(())
}

async fn serve(config: SyncConfig) -> Result<()> {
    let db = Database::connect(&config.database_path)
        .await
        .with_context(|| format!("opening store at {}", config.database_path.display()))?;
    db.ping().await.context("store health check")?;
    let repo = CveRepository::from(&db);

    let feed = Arc::new(NvdClient::new(FeedConfig {
        base_url: config.feed_url.clone(),
        user_agent: config.user_agent.clone(),
        timeout: Duration::from_secs(config.http_timeout_secs),
    })?);

    let reconciler = Reconciler::new(feed.clone(), repo.clone(), ReconcilerConfig::from(&config));
    let mut ingest = IngestService::new(
        reconciler,
        config.sync_interval,
        config.scheduler_enabled,
    );
    ingest.start().await?;

    let port: u16 = std::env::var("VULNVIEW_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    info!(port, "serving read api");

    let state = AppState::new(repo, feed);
    tokio::select! {
        result = vulnview_web::serve(state, port) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    ingest.shutdown().await?;
    db.close().await;
    Ok(())
}

async fn sync_once(config: SyncConfig) -> Result<()> {
    let db = Database::connect(&config.database_path)
        .await
        .with_context(|| format!("opening store at {}", config.database_path.display()))?;
    let repo = CveRepository::from(&db);
    let feed = Arc::new(NvdClient::new(FeedConfig {
        base_url: config.feed_url.clone(),
        user_agent: config.user_agent.clone(),
        timeout: Duration::from_secs(config.http_timeout_secs),
    })?);

    let reconciler = Reconciler::new(feed, repo, ReconcilerConfig::from(&config));
    let summary = reconciler.run_once().await?;
    println!(
        "sync complete: run_id={} pages={} inserted={} updated={} skipped={}",
        summary.run_id, summary.pages, summary.inserted, summary.updated, summary.skipped
    );

    db.close().await;
    Ok(())
}
