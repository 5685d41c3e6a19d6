//! On-disk fallback tier: one JSON file per key under a cache directory.
//! Used when Redis is unreachable so a network outage does not turn every
//! request into a regeneration.

use crate::backend::{clamp_ttl, CacheBackend, CacheError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use inbox_core::types::CachedResult;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};


#[derive(Serialize, Deserialize)]
struct DiskEntry {
    expires_at: DateTime<Utc>,
    result: CachedResult,
}

pub struct DiskCache {
    dir: PathBuf,
    write_seq: AtomicU64,
}

impl DiskCache {
    /// Create the cache directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        debug!(dir = %dir.display(), "Disk cache ready");
        Ok(Self {
            dir,
            write_seq: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, CacheError> {
        let safe = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !safe {
            return Err(CacheError::Unavailable(format!(
                "key not usable as a file name: {key}"
            )));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

#[async_trait]
impl CacheBackend for DiskCache {
    fn name(&self) -> &str {
        "disk"
    }

    async fn get(&self, key: &str) -> Result<Option<CachedResult>, CacheError> {
        let path = self.path_for(key)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let entry: DiskEntry = serde_json::from_slice(&bytes)?;
        if Utc::now() >= entry.expires_at {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != ErrorKind::NotFound {
                    warn!(error = %e, path = %path.display(), "Failed to remove stale cache file");
                }
            }
            return Ok(None);
        }
        Ok(Some(entry.result))
    }

    async fn put(&self, key: &str, value: &CachedResult, ttl: Duration) -> Result<(), CacheError> {
        let path = self.path_for(key)?;
        let ttl = chrono::Duration::from_std(clamp_ttl(ttl)).unwrap_or_else(|_| chrono::Duration::days(1));
        let now = Utc::now();
        let entry = DiskEntry {
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            result: value.clone(),
        };
        let json = serde_json::to_vec(&entry)?;

        // Write-then-rename so readers never observe a torn file.
        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = self.dir.join(format!("{key}.{seq}.tmp"));
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn evict_expired(&self) -> usize {
        let mut evicted = 0;
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Disk cache sweep could not list directory");
                return 0;
            }
        };

        while let Ok(Some(dirent)) = entries.next_entry().await {
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let expired = match tokio::fs::read(&path).await {
                Ok(bytes) => serde_json::from_slice::<DiskEntry>(&bytes)
                    .map(|entry| Utc::now() >= entry.expires_at)
                    .unwrap_or(true),
                Err(_) => false,
            };
            if expired && tokio::fs::remove_file(&path).await.is_ok() {
                evicted += 1;
            }
        }
        evicted
    }
}
