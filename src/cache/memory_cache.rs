use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};

use crate::{Cache, ThrottlingError};

/// In-process [`Cache`] backed by a [`DashMap`].
///
/// Only tasks sharing the same instance (usually through an `Arc`) see each
/// other's keys. Every operation completes without suspending.
#[derive(Debug, Default)]
pub struct MemoryCache {
    memory: DashMap<String, Vec<u8>>,
}

impl MemoryCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently checked in.
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    /// `true` if no key is checked in.
    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn check_in(&self, key: &str, value: &[u8]) -> Result<(), ThrottlingError> {
        self.memory.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn check(&self, key: &str) -> Result<Option<Vec<u8>>, ThrottlingError> {
        Ok(self.memory.get(key).map(|value| value.clone()))
    }

    async fn check_out(&self, key: &str) -> Result<(), ThrottlingError> {
        self.memory.remove(key);
        Ok(())
    }

    async fn check_in_if_absent(&self, key: &str, value: &[u8]) -> Result<bool, ThrottlingError> {
        match self.memory.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(entry) => {
                entry.insert(value.to_vec());
                Ok(true)
            }
        }
    }
} // end impl Cache for MemoryCache
