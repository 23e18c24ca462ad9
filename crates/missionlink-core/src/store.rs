//! Durable single-value slots.
//!
//! A `LocalValue<T>` keeps one JSON value in `<dir>/<name>.json` and mirrors
//! it in memory. Reads never fail: a missing or unreadable file yields the
//! default. Writes update memory first; a failed disk write is logged.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

pub struct LocalValue<T> {
    path: PathBuf,
    default: T,
    current: Mutex<T>,
}

impl<T> LocalValue<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    pub fn open(dir: &Path, name: &str, default: T) -> Self {
        let path = dir.join(format!("{}.json", name));
        let current = match Self::read(&path) {
            Ok(Some(value)) => value,
            Ok(None) => default.clone(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read local value, using default");
                default.clone()
            }
        };
        Self {
            path,
            default,
            current: Mutex::new(current),
        }
    }

    fn read(path: &Path) -> Result<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let value = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(value))
    }

    fn write(&self, value: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(value)?;
        std::fs::write(&self.path, contents)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> T {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Store `value`. Returns whether it reached disk.
    pub fn set(&self, value: T) -> bool {
        let persisted = match self.write(&value) {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to persist local value");
                false
            }
        };
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = value;
        persisted
    }

    pub fn update(&self, f: impl FnOnce(&mut T)) -> bool {
        let mut value = self.get();
        f(&mut value);
        self.set(value)
    }

    /// Forget the stored value and return to the default.
    pub fn clear(&self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "Failed to remove local value");
            }
        }
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = self.default.clone();
    }
}
