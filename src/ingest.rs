//! Ingestion runs: remote sync and local import.
//!
//! [`IngestService`] owns the store handle and the progress tracker. Runs
//! are started in the background and return a task handle immediately; at
//! most one run is active at a time.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{self, Config};
use crate::error::{Result, SyncError};
use crate::fetch::{months_between, ArchiveFetcher, ArchiveKey};
use crate::parser::{self, ParseStats};
use crate::progress::{RunGuard, SyncProgress, SyncTracker};
use crate::reconcile::{self, ReconcileReport};
use crate::store::Store;
use crate::threading::resolve_threads;

/// What a finished run did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub units_total: usize,
    pub units_ingested: usize,
    pub units_failed: usize,
    pub bytes_downloaded: u64,
    pub parse: ParseStats,
    pub reconcile: ReconcileReport,
    /// `(unit, error)` for every unit that could not be fetched or ingested.
    pub failures: Vec<(String, String)>,
}

/// Handle of a background run.
pub type RunHandle = JoinHandle<Result<RunSummary>>;

/// Shared pieces a background run needs.
#[derive(Clone)]
struct RunContext {
    config: Config,
    data_dir: PathBuf,
    store: Arc<Mutex<Store>>,
    tracker: Arc<SyncTracker>,
}

/// Entry point for ingestion and for read access to the store.
pub struct IngestService {
    ctx: RunContext,
}

impl IngestService {
    /// Open the configured database and build the service.
    pub fn open(config: Config) -> Result<Self> {
        let store = Store::open(&config::database_path(&config))?;
        Ok(Self::new(config, store))
    }

    pub fn new(config: Config, store: Store) -> Self {
        let data_dir = config::data_dir(&config);
        Self {
            ctx: RunContext {
                config,
                data_dir,
                store: Arc::new(Mutex::new(store)),
                tracker: Arc::new(SyncTracker::new()),
            },
        }
    }

    /// Snapshot of the current or last run.
    pub fn progress(&self) -> SyncProgress {
        self.ctx.tracker.snapshot()
    }

    pub fn data_dir(&self) -> &Path {
        &self.ctx.data_dir
    }

    /// Start syncing every month from the newest stored message (or the
    /// lookback window on an empty store) through the current month.
    pub fn start_remote_sync(&self) -> Result<RunHandle> {
        let guard = self.begin()?;
        let ctx = self.ctx.clone();
        Ok(spawn_run("remote sync", guard, run_remote(ctx)))
    }

    /// Start ingesting one local archive file.
    pub fn start_local_import(&self, path: impl Into<PathBuf>) -> Result<RunHandle> {
        let path = path.into();
        if !path.is_file() {
            return Err(SyncError::FileNotFound(path));
        }
        let guard = self.begin()?;
        let ctx = self.ctx.clone();
        Ok(spawn_run("local import", guard, run_local(ctx, path)))
    }

    /// Store an uploaded archive in the data directory under its base name.
    pub async fn save_upload(&self, file_name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let base = sanitize_upload_name(file_name)?;
        tokio::fs::create_dir_all(&self.ctx.data_dir)
            .await
            .map_err(|e| SyncError::io(&self.ctx.data_dir, e))?;
        let path = self.ctx.data_dir.join(base);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| SyncError::io(&path, e))?;
        info!(path = %path.display(), bytes = bytes.len(), "Saved uploaded archive");
        Ok(path)
    }

    /// Delete all threads, messages and activity. Refused while a run is active.
    pub async fn reset(&self) -> Result<()> {
        let _guard = self.begin()?;
        let store = Arc::clone(&self.ctx.store);
        tokio::task::spawn_blocking(move || lock_store(&store)?.reset()).await??;
        self.ctx.tracker.set_latest_message_at(None);
        Ok(())
    }

    /// Run a read-only query against the store on the blocking pool.
    pub async fn with_store<T, F>(&self, query: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Store) -> Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.ctx.store);
        tokio::task::spawn_blocking(move || query(&*lock_store(&store)?)).await?
    }

    fn begin(&self) -> Result<RunGuard> {
        self.ctx.tracker.try_begin().ok_or(SyncError::AlreadyRunning)
    }
}

/// Run `work` on its own task so a panic inside it is caught and logged
/// here; the guard is released once the run ends either way.
fn spawn_run<F>(kind: &'static str, guard: RunGuard, work: F) -> RunHandle
where
    F: std::future::Future<Output = Result<RunSummary>> + Send + 'static,
{
    tokio::spawn(async move {
        let _guard = guard;
        match tokio::spawn(work).await {
            Ok(Ok(summary)) => {
                info!(
                    kind,
                    units_ingested = summary.units_ingested,
                    units_failed = summary.units_failed,
                    inserted = summary.reconcile.inserted,
                    "Run finished"
                );
                Ok(summary)
            }
            Ok(Err(e)) => {
                error!(kind, error = %e, "Run failed");
                Err(e)
            }
            Err(join_err) => {
                error!(kind, error = %join_err, "Run aborted unexpectedly");
                Err(join_err.into())
            }
        }
    })
}

/// Months to sync: from the month of the newest stored message (or the
/// lookback start) through the month containing `now`.
///
/// A stored date in the future is treated as `now`.
pub fn sync_range(
    latest: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    lookback_days: i64,
) -> Vec<ArchiveKey> {
    let start = match latest {
        Some(latest) => ArchiveKey::containing(latest.min(now)),
        None => ArchiveKey::containing(now - Duration::days(lookback_days.max(0))),
    };
    months_between(start, ArchiveKey::containing(now))
}

async fn run_remote(ctx: RunContext) -> Result<RunSummary> {
    let latest = blocking_store(&ctx, |store| store.latest_message_at()).await?;
    ctx.tracker.set_latest_message_at(latest);

    let keys = sync_range(latest, Utc::now(), ctx.config.sync.initial_lookback_days);
    let mut summary = RunSummary {
        units_total: keys.len(),
        ..Default::default()
    };
    ctx.tracker.set_total(keys.len());
    info!(
        units = keys.len(),
        from = %keys.first().map(ToString::to_string).unwrap_or_default(),
        "Starting remote sync"
    );

    let fetcher = ArchiveFetcher::new(
        &ctx.config.archive,
        ctx.data_dir.clone(),
        ctx.config.sync.cache_policy,
    )?;
    let mut results = fetcher.fetch_all(keys, ctx.config.sync.workers).await;
    results.sort_by_key(|r| r.key);

    for result in results {
        let label = result.key.to_string();
        ctx.tracker.set_current(label.clone());
        summary.bytes_downloaded += result.bytes;

        match result.outcome {
            Ok(path) => match ingest_file(&ctx, path.clone()).await {
                Ok((stats, report)) => {
                    summary.units_ingested += 1;
                    summary.parse.merge(&stats);
                    summary.reconcile.merge(&report);
                    if ctx.config.sync.cleanup_after_ingest {
                        cleanup_artifact(&path).await;
                    }
                }
                Err(e) => {
                    warn!(unit = %label, error = %e, "Failed to ingest archive unit");
                    summary.units_failed += 1;
                    summary.failures.push((label, e.to_string()));
                }
            },
            Err(e) => {
                summary.units_failed += 1;
                summary.failures.push((label, e.to_string()));
            }
        }
        ctx.tracker.advance();
    }

    Ok(summary)
}

async fn run_local(ctx: RunContext, path: PathBuf) -> Result<RunSummary> {
    let label = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    ctx.tracker.set_total(1);
    ctx.tracker.set_current(label.clone());
    info!(path = %path.display(), "Starting local import");

    let mut summary = RunSummary {
        units_total: 1,
        ..Default::default()
    };
    match ingest_file(&ctx, path).await {
        Ok((stats, report)) => {
            summary.units_ingested = 1;
            summary.parse = stats;
            summary.reconcile = report;
        }
        Err(e) => {
            summary.units_failed = 1;
            summary.failures.push((label, e.to_string()));
        }
    }
    ctx.tracker.advance();
    Ok(summary)
}

/// Parse, thread and reconcile one archive file on the blocking pool.
async fn ingest_file(ctx: &RunContext, path: PathBuf) -> Result<(ParseStats, ReconcileReport)> {
    let store = Arc::clone(&ctx.store);
    let (stats, report, latest) = tokio::task::spawn_blocking(move || {
        let outcome = parser::parse_file(&path)?;
        info!(
            path = %path.display(),
            total = outcome.stats.total,
            parsed = outcome.stats.parsed,
            skipped = outcome.stats.skipped,
            malformed_ids = outcome.stats.malformed_message_id,
            "Parsed archive unit"
        );
        let groups = resolve_threads(outcome.messages);

        let mut store = lock_store(&store)?;
        let report = reconcile::reconcile(&mut store, groups)?;
        let latest = store.latest_message_at()?;
        Ok::<_, SyncError>((outcome.stats, report, latest))
    })
    .await??;

    ctx.tracker.set_latest_message_at(latest);
    Ok((stats, report))
}

async fn blocking_store<T, F>(ctx: &RunContext, query: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Store) -> Result<T> + Send + 'static,
{
    let store = Arc::clone(&ctx.store);
    tokio::task::spawn_blocking(move || query(&*lock_store(&store)?)).await?
}

async fn cleanup_artifact(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!(path = %path.display(), "Removed ingested archive"),
        Err(e) => warn!(path = %path.display(), error = %e, "Could not remove ingested archive"),
    }
}

/// A panic while the lock was held leaves no open write behind: the
/// transaction rolled back when it was dropped. Keep using the store.
fn lock_store(store: &Mutex<Store>) -> Result<MutexGuard<'_, Store>> {
    Ok(store.lock().unwrap_or_else(|poisoned| {
        warn!("Store lock was poisoned by a panicked task, recovering");
        poisoned.into_inner()
    }))
}

/// Reduce an uploaded file name to a safe base name.
fn sanitize_upload_name(file_name: &str) -> Result<String> {
    let base = Path::new(file_name.trim())
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if base.is_empty() || base.starts_with('.') {
        return Err(SyncError::InvalidPath(file_name.to_string()));
    }
    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_sync_range_from_latest_message() {
        let latest = Utc.with_ymd_and_hms(2024, 11, 20, 8, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 1, 3, 0, 0, 0).unwrap();
        let keys = sync_range(Some(latest), now, 365);
        assert_eq!(
            keys,
            vec![
                ArchiveKey::new(2024, 11),
                ArchiveKey::new(2024, 12),
                ArchiveKey::new(2025, 1),
            ]
        );
    }

    #[test]
    fn test_sync_range_lookback_on_empty_store() {
        let now = Utc.with_ymd_and_hms(2025, 3, 15, 0, 0, 0).unwrap();
        let keys = sync_range(None, now, 365);
        assert_eq!(keys.first(), Some(&ArchiveKey::new(2024, 3)));
        assert_eq!(keys.last(), Some(&ArchiveKey::new(2025, 3)));
        assert_eq!(keys.len(), 13);
    }

    #[test]
    fn test_sync_range_future_latest_clamped() {
        let latest = Utc.with_ymd_and_hms(2099, 1, 1, 0, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(sync_range(Some(latest), now, 365), vec![ArchiveKey::new(2025, 6)]);
    }

    #[test]
    fn test_sanitize_upload_name() {
        assert_eq!(sanitize_upload_name("../../etc/hackers.202401").unwrap(), "hackers.202401");
        assert_eq!(sanitize_upload_name("list.mbox").unwrap(), "list.mbox");
        assert!(sanitize_upload_name("..").is_err());
        assert!(sanitize_upload_name(".hidden").is_err());
        assert!(sanitize_upload_name("").is_err());
    }

    #[tokio::test]
    async fn test_second_run_is_rejected() {
        let service = IngestService::new(Config::default(), Store::open_in_memory().unwrap());
        let _guard = service.begin().unwrap();
        assert!(matches!(
            service.start_remote_sync(),
            Err(SyncError::AlreadyRunning)
        ));
        assert!(matches!(service.reset().await, Err(SyncError::AlreadyRunning)));
    }

    #[tokio::test]
    async fn test_store_usable_after_panicked_query() {
        let service = IngestService::new(Config::default(), Store::open_in_memory().unwrap());
        let failed = service
            .with_store(|_| -> Result<()> { panic!("query blew up") })
            .await;
        assert!(matches!(failed, Err(SyncError::Task(_))));

        let stats = service.with_store(|store| store.stats()).await.unwrap();
        assert_eq!(stats.threads, 0);
        service.reset().await.unwrap();
    }

    #[tokio::test]
    async fn test_import_missing_file() {
        let service = IngestService::new(Config::default(), Store::open_in_memory().unwrap());
        assert!(matches!(
            service.start_local_import("/definitely/not/here.mbox"),
            Err(SyncError::FileNotFound(_))
        ));
        assert!(!service.progress().is_running);
    }
}
