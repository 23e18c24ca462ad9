use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use super::storage::{CacheEntry, CacheStorage, StorageError};

/// Count and age limits for one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirationPolicy {
    pub max_entries: Option<usize>,
    pub max_age: Option<Duration>,
}

impl ExpirationPolicy {
    pub fn new(max_entries: usize, max_age_days: i64) -> Self {
        Self {
            max_entries: Some(max_entries),
            max_age: Some(Duration::days(max_age_days)),
        }
    }

    pub fn is_expired(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        self.max_age
            .map_or(false, |max_age| now - entry.stored_at > max_age)
    }

    /// Evict expired entries, then the oldest ones beyond `max_entries`.
    /// Returns the number of evicted entries.
    pub async fn enforce(
        &self,
        storage: &dyn CacheStorage,
        partition: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        let entries = storage.entries(partition).await?;
        let mut evicted = 0;
        let mut live = Vec::with_capacity(entries.len());

        for entry in entries {
            if self.is_expired(&entry, now) {
                storage.delete(partition, &entry.key).await?;
                evicted += 1;
            } else {
                live.push(entry.key);
            }
        }

        if let Some(max_entries) = self.max_entries {
            let excess = live.len().saturating_sub(max_entries);
            for key in live.iter().take(excess) {
                storage.delete(partition, key).await?;
                evicted += 1;
            }
        }

        if evicted > 0 {
            debug!(partition = partition, evicted = evicted, "Expired cache entries");
        }
        Ok(evicted)
    }
}
