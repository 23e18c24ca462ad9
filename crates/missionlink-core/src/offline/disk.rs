//! Cache partitions persisted as JSON files.
//!
//! Each partition lives in `<cache_dir>/<partition>.json`. Writes go to a
//! temporary file first and are renamed into place, so a partition file is
//! either the old or the new version.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::storage::{CacheEntry, CacheStorage, StorageError};

const PARTITION_EXTENSION: &str = "json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct PartitionFile {
    entries: Vec<CacheEntry>,
}

pub struct DiskCacheStorage {
    cache_dir: PathBuf,
    /// Serializes read-modify-write cycles on partition files
    write_lock: Mutex<()>,
}

impl DiskCacheStorage {
    pub fn new(cache_dir: PathBuf) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            cache_dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn partition_path(&self, name: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.{}", name, PARTITION_EXTENSION))
    }

    fn load(&self, name: &str) -> Result<Option<PartitionFile>, StorageError> {
        let path = self.partition_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)?;
        let file: PartitionFile = serde_json::from_str(&contents)?;
        Ok(Some(file))
    }

    fn save(&self, name: &str, file: &PartitionFile) -> Result<(), StorageError> {
        let path = self.partition_path(name);
        let tmp = path.with_extension("json.tmp");
        let contents = serde_json::to_string(file)?;
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &path)?;
        debug!(partition = name, entries = file.entries.len(), "Partition saved");
        Ok(())
    }
}

#[async_trait]
impl CacheStorage for DiskCacheStorage {
    async fn partitions(&self) -> Result<Vec<String>, StorageError> {
        let mut names = Vec::new();
        for dir_entry in std::fs::read_dir(&self.cache_dir)? {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(PARTITION_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn get(&self, partition: &str, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        Ok(self
            .load(partition)?
            .and_then(|file| file.entries.into_iter().find(|e| e.key == key)))
    }

    async fn put(&self, partition: &str, entry: CacheEntry) -> Result<(), StorageError> {
        self.put_all(partition, vec![entry]).await
    }

    async fn put_all(&self, partition: &str, entries: Vec<CacheEntry>) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().map_err(|_| StorageError::Poisoned)?;
        let mut file = self.load(partition)?.unwrap_or_default();
        for entry in entries {
            file.entries.retain(|e| e.key != entry.key);
            file.entries.push(entry);
        }
        self.save(partition, &file)
    }

    async fn delete(&self, partition: &str, key: &str) -> Result<bool, StorageError> {
        let _guard = self.write_lock.lock().map_err(|_| StorageError::Poisoned)?;
        let Some(mut file) = self.load(partition)? else {
            return Ok(false);
        };
        let before = file.entries.len();
        file.entries.retain(|e| e.key != key);
        if file.entries.len() == before {
            return Ok(false);
        }
        self.save(partition, &file)?;
        Ok(true)
    }

    async fn entries(&self, partition: &str) -> Result<Vec<CacheEntry>, StorageError> {
        Ok(self.load(partition)?.map(|f| f.entries).unwrap_or_default())
    }

    async fn delete_partition(&self, partition: &str) -> Result<bool, StorageError> {
        let _guard = self.write_lock.lock().map_err(|_| StorageError::Poisoned)?;
        let path = self.partition_path(partition);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(path)?;
        Ok(true)
    }
}
