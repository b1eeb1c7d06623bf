use std::fmt;
use std::io;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::settings::{CacheMode, Settings};

mod disk;
mod key;
mod memory;

pub use disk::DiskCacheStore;
pub use key::CacheKey;
pub use memory::MemoryCacheStore;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to read cache entry {entry_id}")]
    Read {
        entry_id: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to write cache entry {entry_id}")]
    Write {
        entry_id: String,
        #[source]
        source: io::Error,
    },
    #[error("cache key '{0}' is not safe for storage")]
    UnsafeKey(String),
}

/// Response storage shared by all sessions.
///
/// Implementations synchronize internally: concurrent calls for different keys are independent,
/// and concurrent stores for the same key resolve to one complete value (last writer wins).
#[async_trait]
pub trait CacheStore: Send + Sync + fmt::Debug {
    /// Return the bytes stored under `key`, or `None` when nothing is stored.
    async fn lookup(&self, key: &CacheKey) -> Result<Option<Bytes>, CacheError>;

    /// Store `body` under `key`, replacing any previous value.
    async fn store(&self, key: &CacheKey, body: Bytes) -> Result<(), CacheError>;
}

pub type SharedCache = Arc<dyn CacheStore>;

/// Build the configured cache store, or `None` when caching is disabled.
pub async fn build_cache_store(settings: &Settings) -> Result<Option<SharedCache>> {
    if !settings.cache_enabled {
        return Ok(None);
    }
    let store: SharedCache = match settings.cache_mode {
        CacheMode::Disk => Arc::new(DiskCacheStore::open(settings.cache_dir.clone()).await?),
        CacheMode::Memory => Arc::new(MemoryCacheStore::new()),
    };
    Ok(Some(store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn disabled_cache_builds_nothing() -> Result<()> {
        let settings = Settings {
            cache_enabled: false,
            ..Settings::default()
        };
        assert!(build_cache_store(&settings).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn disk_mode_creates_directory() -> Result<()> {
        let dir = TempDir::new()?;
        let cache_dir = dir.path().join("nested").join("cache");
        let settings = Settings {
            cache_dir: cache_dir.clone(),
            ..Settings::default()
        };
        let store = build_cache_store(&settings).await?.expect("cache enabled");
        assert!(cache_dir.is_dir());

        let key = CacheKey::new("example.com/");
        store.store(&key, Bytes::from_static(b"payload")).await?;
        assert_eq!(store.lookup(&key).await?, Some(Bytes::from_static(b"payload")));
        Ok(())
    }

    #[tokio::test]
    async fn memory_mode_round_trips() -> Result<()> {
        let settings = Settings {
            cache_mode: CacheMode::Memory,
            ..Settings::default()
        };
        let store = build_cache_store(&settings).await?.expect("cache enabled");
        let key = CacheKey::new("example.com/a");
        assert!(store.lookup(&key).await?.is_none());
        store.store(&key, Bytes::from_static(b"a")).await?;
        assert_eq!(store.lookup(&key).await?, Some(Bytes::from_static(b"a")));
        Ok(())
    }
}
