//! Monthly archive retrieval.
//!
//! Each archive unit is one month of the list, served as
//! `<base_url>/<list>.<YYYYMM>`. Units are downloaded concurrently on a
//! bounded pool; every key yields exactly one [`FetchResult`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::{ArchiveConfig, CachePolicy};
use crate::error::{Result, SyncError};

/// Worker count used when zero is requested.
pub const DEFAULT_WORKERS: usize = 4;

/// Identifies one monthly archive unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ArchiveKey {
    pub year: i32,
    /// 1-based month.
    pub month: u32,
}

impl ArchiveKey {
    pub fn new(year: i32, month: u32) -> Self {
        Self { year, month }
    }

    /// Month containing the given instant.
    pub fn containing(date: DateTime<Utc>) -> Self {
        Self::new(date.year(), date.month())
    }

    /// The following month.
    pub fn next(self) -> Self {
        if self.month >= 12 {
            Self::new(self.year + 1, 1)
        } else {
            Self::new(self.year, self.month + 1)
        }
    }

    /// Archive file name, e.g. `pgsql-hackers.202401`.
    pub fn file_name(&self, list_name: &str) -> String {
        format!("{list_name}.{:04}{:02}", self.year, self.month)
    }
}

impl fmt::Display for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Every month from `start` through `end`, inclusive. Empty when `start > end`.
pub fn months_between(start: ArchiveKey, end: ArchiveKey) -> Vec<ArchiveKey> {
    let mut months = Vec::new();
    let mut current = start;
    while current <= end {
        months.push(current);
        current = current.next();
    }
    months
}

/// Outcome of retrieving one unit.
#[derive(Debug)]
pub struct FetchResult {
    pub key: ArchiveKey,
    /// Local artifact path, or why the unit could not be retrieved.
    pub outcome: Result<PathBuf>,
    pub elapsed: Duration,
    /// Size of the local artifact (0 on failure).
    pub bytes: u64,
    /// The artifact was reused from a previous run.
    pub cached: bool,
}

impl FetchResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// HTTP client for one mailing-list archive.
#[derive(Debug, Clone)]
pub struct ArchiveFetcher {
    client: reqwest::Client,
    base_url: String,
    list_name: String,
    credentials: Option<(String, String)>,
    data_dir: PathBuf,
    cache_policy: CachePolicy,
}

impl ArchiveFetcher {
    pub fn new(
        archive: &ArchiveConfig,
        data_dir: impl Into<PathBuf>,
        cache_policy: CachePolicy,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(archive.user_agent.clone())
            .timeout(archive.timeout())
            .build()?;

        let credentials = (!archive.username.is_empty() && !archive.password.is_empty())
            .then(|| (archive.username.clone(), archive.password.clone()));

        Ok(Self {
            client,
            base_url: archive.base_url.trim_end_matches('/').to_string(),
            list_name: archive.list_name.clone(),
            credentials,
            data_dir: data_dir.into(),
            cache_policy,
        })
    }

    pub fn url_for(&self, key: ArchiveKey) -> String {
        format!("{}/{}", self.base_url, key.file_name(&self.list_name))
    }

    pub fn local_path(&self, key: ArchiveKey) -> PathBuf {
        self.data_dir.join(key.file_name(&self.list_name))
    }

    /// Retrieve every key with at most `workers` downloads in flight.
    ///
    /// Results arrive in completion order. A failed unit never aborts the batch.
    pub async fn fetch_all(&self, keys: Vec<ArchiveKey>, workers: usize) -> Vec<FetchResult> {
        let workers = if workers == 0 { DEFAULT_WORKERS } else { workers };
        info!(units = keys.len(), workers, "Fetching archive units");

        stream::iter(keys)
            .map(|key| self.fetch_unit(key))
            .buffer_unordered(workers)
            .collect()
            .await
    }

    /// Retrieve one unit, honoring the cache policy.
    pub async fn fetch_unit(&self, key: ArchiveKey) -> FetchResult {
        let started = Instant::now();
        let path = self.local_path(key);

        if self.cache_policy == CachePolicy::Reuse {
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                debug!(unit = %key, path = %path.display(), "Reusing cached archive");
                return FetchResult {
                    key,
                    outcome: Ok(path),
                    elapsed: started.elapsed(),
                    bytes: meta.len(),
                    cached: true,
                };
            }
        }

        let (outcome, bytes) = match self.download(key, &path).await {
            Ok(bytes) => {
                info!(
                    unit = %key,
                    bytes,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Downloaded archive"
                );
                (Ok(path), bytes)
            }
            Err(e) => {
                warn!(unit = %key, error = %e, "Archive download failed");
                (Err(e), 0)
            }
        };

        FetchResult {
            key,
            outcome,
            elapsed: started.elapsed(),
            bytes,
            cached: false,
        }
    }

    /// Stream the unit into `<path>.part`, then rename it into place.
    async fn download(&self, key: ArchiveKey, path: &Path) -> Result<u64> {
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .map_err(|e| SyncError::io(&self.data_dir, e))?;

        let url = self.url_for(key);
        let mut request = self.client.get(&url);
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, Some(password));
        }

        let mut response = request
            .send()
            .await
            .map_err(|e| SyncError::fetch(key.to_string(), e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::HttpStatus {
                unit: key.to_string(),
                status: status.as_u16(),
            });
        }

        let partial = partial_path(path);
        let written = async {
            let mut file = tokio::fs::File::create(&partial)
                .await
                .map_err(|e| SyncError::io(&partial, e))?;
            let mut written: u64 = 0;
            while let Some(chunk) = response
                .chunk()
                .await
                .map_err(|e| SyncError::fetch(key.to_string(), e))?
            {
                file.write_all(&chunk)
                    .await
                    .map_err(|e| SyncError::io(&partial, e))?;
                written += chunk.len() as u64;
            }
            file.flush().await.map_err(|e| SyncError::io(&partial, e))?;
            Ok::<u64, SyncError>(written)
        }
        .await;

        match written {
            Ok(written) => {
                tokio::fs::rename(&partial, path)
                    .await
                    .map_err(|e| SyncError::io(path, e))?;
                Ok(written)
            }
            Err(e) => {
                if let Err(remove_err) = tokio::fs::remove_file(&partial).await {
                    debug!(
                        path = %partial.display(),
                        error = %remove_err,
                        "Could not remove partial download"
                    );
                }
                Err(e)
            }
        }
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}
