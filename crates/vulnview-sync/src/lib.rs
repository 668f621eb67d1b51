//! Feed reconciliation loop and its recurring schedule.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vulnview_client::{RawCveItem, VulnerabilityFeed, DEFAULT_FEED_URL};
use vulnview_core::{parse_feed_timestamp, NewCve};
use vulnview_store::{CveRepository, StoreError};

pub const CRATE_NAME: &str = "vulnview-sync";

/// Process configuration, sourced from the environment with defaults.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_path: PathBuf,
    pub feed_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub page_size: i64,
    /// Pause between pages, to respect upstream rate limits.
    pub page_delay: Duration,
    /// Pause after each applied update within a page.
    pub update_delay: Duration,
    /// Interval between scheduled reconciliation runs.
    pub sync_interval: Duration,
    pub scheduler_enabled: bool,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_path: std::env::var("VULNVIEW_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./vulnview.db")),
            feed_url: std::env::var("VULNVIEW_FEED_URL")
                .unwrap_or_else(|_| DEFAULT_FEED_URL.to_string()),
            user_agent: std::env::var("VULNVIEW_USER_AGENT")
                .unwrap_or_else(|_| "vulnview/0.1 (cve-feed-watcher)".to_string()),
            http_timeout_secs: env_parsed("VULNVIEW_HTTP_TIMEOUT_SECS", 60),
            page_size: env_parsed("VULNVIEW_PAGE_SIZE", 2000),
            page_delay: Duration::from_secs(env_parsed("VULNVIEW_PAGE_DELAY_SECS", 6)),
            update_delay: Duration::from_millis(env_parsed("VULNVIEW_UPDATE_DELAY_MS", 1000)),
            sync_interval: Duration::from_secs(env_parsed("VULNVIEW_SYNC_INTERVAL_SECS", 3600)),
            scheduler_enabled: std::env::var("VULNVIEW_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Outcome of one complete pass over the paginated feed.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages: u64,
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    pub malformed: u64,
}

#[derive(Debug, Default)]
struct RunStats {
    pages: u64,
    inserted: u64,
    updated: u64,
    skipped: u64,
    malformed: u64,
}

/// Per-run pacing and paging knobs, split out of [`SyncConfig`] so tests
/// can zero the delays.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub page_size: i64,
    pub page_delay: Duration,
    pub update_delay: Duration,
}

impl From<&SyncConfig> for ReconcilerConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            page_size: config.page_size.max(1),
            page_delay: config.page_delay,
            update_delay: config.update_delay,
        }
    }
}

/// Drives full-feed pagination and applies the insert-vs-update decision
/// per item. Pages are fetched and applied strictly in increasing offset
/// order; a feed failure aborts the run and the next scheduled run retries
/// from offset 0. Already-applied upserts stand: each is independently
/// idempotent.
pub struct Reconciler {
    feed: Arc<dyn VulnerabilityFeed>,
    repo: CveRepository,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(feed: Arc<dyn VulnerabilityFeed>, repo: CveRepository, config: ReconcilerConfig) -> Self {
        Self { feed, repo, config }
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut stats = RunStats::default();
        let mut offset: i64 = 0;

        info!(%run_id, page_size = self.config.page_size, "starting reconciliation run");

        loop {
            let page = self
                .feed
                .fetch_page(offset, self.config.page_size)
                .await
                .with_context(|| format!("fetching feed page at offset {offset}"))?;
            stats.pages += 1;

            for envelope in &page.vulnerabilities {
                self.reconcile_item(&envelope.cve, &mut stats).await?;
            }

            offset += self.config.page_size;
            // The reported total is re-read from every page; if it drifts
            // mid-run the next scheduled run self-corrects.
            if offset >= page.total_results {
                break;
            }
            tokio::time::sleep(self.config.page_delay).await;
        }

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            pages: stats.pages,
            inserted: stats.inserted,
            updated: stats.updated,
            skipped: stats.skipped,
            malformed: stats.malformed,
        };
        info!(
            %run_id,
            pages = summary.pages,
            inserted = summary.inserted,
            updated = summary.updated,
            skipped = summary.skipped,
            malformed = summary.malformed,
            "reconciliation run complete"
        );
        Ok(summary)
    }

    async fn reconcile_item(&self, item: &RawCveItem, stats: &mut RunStats) -> Result<(), StoreError> {
        let parsed = parse_feed_timestamp(&item.published)
            .and_then(|published| Ok((published, parse_feed_timestamp(&item.last_modified)?)));
        let (published, last_modified) = match parsed {
            Ok(pair) => pair,
            Err(err) => {
                // One bad item never aborts the page.
                warn!(cve_id = %item.id, %err, "skipping item with malformed timestamp");
                stats.malformed += 1;
                return Ok(());
            }
        };

        match self.repo.find_by_cve_id(&item.id).await? {
            None => {
                let new_cve = NewCve {
                    cve_id: item.id.clone(),
                    source_identifier: item.source_identifier.clone(),
                    published_date: published,
                    last_modified_date: last_modified,
                    status: item.vuln_status.clone(),
                };
                match self.repo.insert(&new_cve).await {
                    Ok(()) => {
                        stats.inserted += 1;
                    }
                    Err(StoreError::DuplicateKey(_)) => {
                        // Lost an insert race; the CAS update is still safe.
                        warn!(cve_id = %item.id, "insert raced an existing row, falling back to update");
                        self.apply_update(item, last_modified, stats).await?;
                    }
                    Err(err) => return Err(err),
                }
            }
            Some(existing) => {
                if last_modified > existing.last_modified_date {
                    self.apply_update(item, last_modified, stats).await?;
                } else {
                    debug!(cve_id = %item.id, "no update needed");
                    stats.skipped += 1;
                }
            }
        }
        Ok(())
    }

    async fn apply_update(
        &self,
        item: &RawCveItem,
        last_modified: DateTime<Utc>,
        stats: &mut RunStats,
    ) -> Result<(), StoreError> {
        let applied = self
            .repo
            .update_if_newer(&item.id, last_modified, &item.vuln_status)
            .await?;
        if applied {
            info!(cve_id = %item.id, "updated record");
            stats.updated += 1;
            tokio::time::sleep(self.config.update_delay).await;
        } else {
            debug!(cve_id = %item.id, "no update needed");
            stats.skipped += 1;
        }
        Ok(())
    }
}

/// Owns the ingestion schedule: one run at startup, then one recurring job
/// at a fixed interval, with a run-in-progress flag guaranteeing at most
/// one active run. A trigger that fires mid-run is skipped, not queued.
pub struct IngestService {
    reconciler: Arc<Reconciler>,
    running: Arc<AtomicBool>,
    interval: Duration,
    scheduler_enabled: bool,
    scheduler: Option<JobScheduler>,
}

impl IngestService {
    pub fn new(reconciler: Reconciler, interval: Duration, scheduler_enabled: bool) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            running: Arc::new(AtomicBool::new(false)),
            interval,
            scheduler_enabled,
            scheduler: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run the reconciler unless a run is already in progress. Returns
    /// `None` when the trigger was skipped.
    pub async fn try_run(&self) -> Option<Result<RunSummary>> {
        run_guarded(&self.reconciler, &self.running).await
    }

    /// Kick off the startup run and, if enabled, register the recurring
    /// job. Both tasks run off the request-serving path.
    pub async fn start(&mut self) -> Result<()> {
        let reconciler = Arc::clone(&self.reconciler);
        let running = Arc::clone(&self.running);
        tokio::spawn(async move {
            log_outcome(run_guarded(&reconciler, &running).await);
        });

        if !self.scheduler_enabled {
            info!("recurring ingestion disabled; only the startup run will execute");
            return Ok(());
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let reconciler = Arc::clone(&self.reconciler);
        let running = Arc::clone(&self.running);
        let job = Job::new_repeated_async(self.interval, move |_uuid, _lock| {
            let reconciler = Arc::clone(&reconciler);
            let running = Arc::clone(&running);
            Box::pin(async move {
                log_outcome(run_guarded(&reconciler, &running).await);
            })
        })
        .context("creating recurring ingestion job")?;
        sched.add(job).await.context("adding ingestion job")?;
        sched.start().await.context("starting scheduler")?;
        info!(interval_secs = self.interval.as_secs(), "recurring ingestion scheduled");
        self.scheduler = Some(sched);
        Ok(())
    }

    /// Stop the recurring schedule. An in-flight run completes; runs are
    /// never cancelled mid-flight.
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(mut sched) = self.scheduler.take() {
            sched.shutdown().await.context("shutting down scheduler")?;
        }
        Ok(())
    }
}

async fn run_guarded(
    reconciler: &Reconciler,
    running: &AtomicBool,
) -> Option<Result<RunSummary>> {
    if running
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        warn!("reconciliation already in progress, skipping trigger");
        return None;
    }
    let result = reconciler.run_once().await;
    running.store(false, Ordering::SeqCst);
    Some(result)
}

/// Ingestion failures surface only through logs, never to read-path clients.
fn log_outcome(outcome: Option<Result<RunSummary>>) {
    match outcome {
        Some(Ok(summary)) => debug!(run_id = %summary.run_id, "scheduled run finished"),
        Some(Err(err)) => error!(error = %err, "reconciliation run aborted"),
        None => {}
    }
}
