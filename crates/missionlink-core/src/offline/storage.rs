//! Cache storage trait and in-memory implementation.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::request::Response;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage quota exceeded while writing to {partition}")]
    QuotaExceeded { partition: String },

    #[error("Storage lock poisoned")]
    Poisoned,
}

/// A stored response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub response: Response,
    pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(key: String, response: Response, stored_at: DateTime<Utc>) -> Self {
        Self {
            key,
            response,
            stored_at,
        }
    }
}

/// Named cache partitions.
///
/// Entries within a partition are kept in write order, oldest first;
/// rewriting a key moves it to the newest position.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Names of all existing partitions.
    async fn partitions(&self) -> Result<Vec<String>, StorageError>;

    async fn get(&self, partition: &str, key: &str) -> Result<Option<CacheEntry>, StorageError>;

    /// Store an entry, creating the partition if needed.
    async fn put(&self, partition: &str, entry: CacheEntry) -> Result<(), StorageError>;

    /// Store all entries or none of them.
    async fn put_all(&self, partition: &str, entries: Vec<CacheEntry>) -> Result<(), StorageError>;

    async fn delete(&self, partition: &str, key: &str) -> Result<bool, StorageError>;

    /// All entries of a partition, oldest first. Missing partitions are empty.
    async fn entries(&self, partition: &str) -> Result<Vec<CacheEntry>, StorageError>;

    async fn delete_partition(&self, partition: &str) -> Result<bool, StorageError>;
}

fn upsert(entries: &mut Vec<CacheEntry>, entry: CacheEntry) {
    entries.retain(|e| e.key != entry.key);
    entries.push(entry);
}

/// Storage kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    partitions: RwLock<BTreeMap<String, Vec<CacheEntry>>>,
    /// Maximum number of entries across all partitions
    quota: Option<usize>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(max_entries: usize) -> Self {
        Self {
            partitions: RwLock::default(),
            quota: Some(max_entries),
        }
    }

    fn check_quota(
        &self,
        partitions: &BTreeMap<String, Vec<CacheEntry>>,
        partition: &str,
        incoming: &[CacheEntry],
    ) -> Result<(), StorageError> {
        let Some(quota) = self.quota else {
            return Ok(());
        };
        let existing = partitions.get(partition);
        let new_keys = incoming
            .iter()
            .filter(|e| existing.map_or(true, |p| !p.iter().any(|x| x.key == e.key)))
            .count();
        let total: usize = partitions.values().map(Vec::len).sum();
        if total + new_keys > quota {
            return Err(StorageError::QuotaExceeded {
                partition: partition.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn partitions(&self) -> Result<Vec<String>, StorageError> {
        let partitions = self.partitions.read().map_err(|_| StorageError::Poisoned)?;
        Ok(partitions.keys().cloned().collect())
    }

    async fn get(&self, partition: &str, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        let partitions = self.partitions.read().map_err(|_| StorageError::Poisoned)?;
        Ok(partitions
            .get(partition)
            .and_then(|entries| entries.iter().find(|e| e.key == key))
            .cloned())
    }

    async fn put(&self, partition: &str, entry: CacheEntry) -> Result<(), StorageError> {
        self.put_all(partition, vec![entry]).await
    }

    async fn put_all(&self, partition: &str, entries: Vec<CacheEntry>) -> Result<(), StorageError> {
        let mut partitions = self.partitions.write().map_err(|_| StorageError::Poisoned)?;
        self.check_quota(&partitions, partition, &entries)?;
        let stored = partitions.entry(partition.to_string()).or_default();
        for entry in entries {
            upsert(stored, entry);
        }
        Ok(())
    }

    async fn delete(&self, partition: &str, key: &str) -> Result<bool, StorageError> {
        let mut partitions = self.partitions.write().map_err(|_| StorageError::Poisoned)?;
        let Some(entries) = partitions.get_mut(partition) else {
            return Ok(false);
        };
        let before = entries.len();
        entries.retain(|e| e.key != key);
        Ok(entries.len() != before)
    }

    async fn entries(&self, partition: &str) -> Result<Vec<CacheEntry>, StorageError> {
        let partitions = self.partitions.read().map_err(|_| StorageError::Poisoned)?;
        Ok(partitions.get(partition).cloned().unwrap_or_default())
    }

    async fn delete_partition(&self, partition: &str) -> Result<bool, StorageError> {
        let mut partitions = self.partitions.write().map_err(|_| StorageError::Poisoned)?;
        Ok(partitions.remove(partition).is_some())
    }
}
