use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

use super::{CacheError, CacheKey, CacheStore};

const TEMP_PREFIX: &str = "tmp_";

/// Stores each response body in its own file under `disk_dir`.
///
/// Entries live at `<disk_dir>/<id[0..2]>/<id[2..4]>/<id>`. Writes go to a temp file in
/// `disk_dir` first and are renamed into place, so readers only ever observe complete bodies.
#[derive(Debug, Clone)]
pub struct DiskCacheStore {
    disk_dir: PathBuf,
}

impl DiskCacheStore {
    /// Open (creating if needed) a cache directory and clear temp files left by a previous run.
    pub async fn open(disk_dir: PathBuf) -> Result<Self> {
        async_fs::create_dir_all(&disk_dir)
            .await
            .with_context(|| format!("failed to create cache directory {}", disk_dir.display()))?;
        let store = Self { disk_dir };
        let removed = store.remove_temp_files().await?;
        if removed > 0 {
            debug!(removed, dir = %store.disk_dir.display(), "removed stale cache temp files");
        }
        Ok(store)
    }

    pub fn disk_dir(&self) -> &Path {
        &self.disk_dir
    }

    /// Resolve the file backing `entry_id`, refusing names that could leave `disk_dir`.
    pub fn entry_path(&self, entry_id: &str) -> Result<PathBuf, CacheError> {
        if !is_storage_safe(entry_id) {
            return Err(CacheError::UnsafeKey(entry_id.to_string()));
        }
        if entry_id.len() < 4 {
            return Ok(self.disk_dir.join(entry_id));
        }
        let (first, remainder) = entry_id.split_at(2);
        let (second, _) = remainder.split_at(2);
        Ok(self.disk_dir.join(first).join(second).join(entry_id))
    }

    fn temp_path(&self) -> PathBuf {
        self.disk_dir
            .join(format!("{TEMP_PREFIX}{}", uuid::Uuid::new_v4()))
    }

    async fn remove_temp_files(&self) -> Result<usize> {
        let mut removed = 0;
        let mut entries = async_fs::read_dir(&self.disk_dir)
            .await
            .with_context(|| format!("failed to list {}", self.disk_dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let is_temp = entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with(TEMP_PREFIX))
                .unwrap_or(false);
            if is_temp && entry.file_type().await?.is_file() {
                match async_fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(err) => debug!(
                        path = %entry.path().display(),
                        error = %err,
                        "failed to remove stale temp file"
                    ),
                }
            }
        }
        Ok(removed)
    }

    async fn write_entry(&self, final_path: &Path, body: &[u8]) -> std::io::Result<()> {
        if let Some(shard_dir) = final_path.parent() {
            async_fs::create_dir_all(shard_dir).await?;
        }

        let temp_path = self.temp_path();
        let mut options = async_fs::OpenOptions::new();
        options.create_new(true).write(true);
        #[cfg(unix)]
        {
            options.mode(0o600);
        }
        let result = async {
            let mut file = options.open(&temp_path).await?;
            file.write_all(body).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            async_fs::rename(&temp_path, final_path).await
        }
        .await;

        if result.is_err() {
            async_fs::remove_file(&temp_path).await.ok();
        }
        result
    }
}

#[async_trait]
impl CacheStore for DiskCacheStore {
    async fn lookup(&self, key: &CacheKey) -> Result<Option<Bytes>, CacheError> {
        let path = self.entry_path(key.entry_id())?;
        match async_fs::read(&path).await {
            Ok(data) => {
                trace!(resource = key.resource(), bytes = data.len(), "cache file read");
                Ok(Some(Bytes::from(data)))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CacheError::Read {
                entry_id: key.entry_id().to_string(),
                source,
            }),
        }
    }

    async fn store(&self, key: &CacheKey, body: Bytes) -> Result<(), CacheError> {
        let path = self.entry_path(key.entry_id())?;
        self.write_entry(&path, &body)
            .await
            .map_err(|source| CacheError::Write {
                entry_id: key.entry_id().to_string(),
                source,
            })?;
        trace!(resource = key.resource(), path = %path.display(), "cache file written");
        Ok(())
    }
}

fn is_storage_safe(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(TEMP_PREFIX)
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
