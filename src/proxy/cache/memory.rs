use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use super::{CacheError, CacheKey, CacheStore};

/// In-process store; contents are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, Bytes>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn lookup(&self, key: &CacheKey) -> Result<Option<Bytes>, CacheError> {
        Ok(self.entries.read().get(key.entry_id()).cloned())
    }

    async fn store(&self, key: &CacheKey, body: Bytes) -> Result<(), CacheError> {
        self.entries
            .write()
            .insert(key.entry_id().to_string(), body);
        Ok(())
    }
}
