//! Client-local transfer history.
//!
//! A bounded, most-recent-first list of downloaded files kept on the
//! downloading device only. It is never synchronized with the session.

use crate::domain::{FileRecord, TimestampUtc};
use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Entries kept when no capacity is configured.
pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

/// Upper bound on the configured capacity.
pub const MAX_HISTORY_CAPACITY: usize = 50;

/// On-disk format version.
const HISTORY_VERSION: u32 = 1;

/// A downloaded file and when it was downloaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub file: FileRecord,
    pub downloaded_at: TimestampUtc,
}

#[derive(Debug, Serialize, Deserialize)]
struct HistoryFile {
    version: u32,
    entries: Vec<HistoryEntry>,
}

/// Fixed-capacity, id-deduplicated download history.
#[derive(Debug, Clone)]
pub struct TransferHistory {
    capacity: usize,
    entries: Vec<HistoryEntry>,
}

impl TransferHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.clamp(1, MAX_HISTORY_CAPACITY),
            entries: Vec::new(),
        }
    }

    /// Moves `file` to the front, dropping any older entry with the same id
    /// and the oldest entries beyond capacity.
    pub fn record(&mut self, file: FileRecord, downloaded_at: TimestampUtc) {
        self.entries.retain(|e| e.file.id != file.id);
        self.entries.insert(
            0,
            HistoryEntry {
                file,
                downloaded_at,
            },
        );
        self.entries.truncate(self.capacity);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Most recent first.
    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn contains(&self, file_id: Uuid) -> bool {
        self.entries.iter().any(|e| e.file.id == file_id)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Loads history from `path`. A missing file is an empty history.
    pub fn load(path: &Path, capacity: usize) -> Result<Self> {
        let mut history = Self::new(capacity);
        if !path.exists() {
            return Ok(history);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read history file: {}", path.display()))?;
        let file: HistoryFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse history file: {}", path.display()))?;
        if file.version != HISTORY_VERSION {
            anyhow::bail!(
                "History version {} is not supported (expected {})",
                file.version,
                HISTORY_VERSION
            );
        }

        history.entries = file.entries;
        history.entries.truncate(history.capacity);
        Ok(history)
    }

    /// Loads the history at `path`, applies `change` and saves it back, all
    /// under one exclusive lock. Concurrent clients on the same device see
    /// each other's writes.
    pub fn update<T>(
        path: &Path,
        capacity: usize,
        change: impl FnOnce(&mut Self) -> T,
    ) -> Result<T> {
        let lock_file = lock(path)?;
        let result = Self::load(path, capacity).and_then(|mut history| {
            let output = change(&mut history);
            history.write_atomic(path)?;
            Ok(output)
        });
        FileExt::unlock(&lock_file)?;
        result
    }

    fn write_atomic(&self, path: &Path) -> Result<()> {
        let temp_path = sidecar(path, "tmp");
        let content = serde_json::to_string_pretty(&HistoryFile {
            version: HISTORY_VERSION,
            entries: self.entries.clone(),
        })
        .context("Failed to serialize history")?;

        fs::write(&temp_path, content)
            .with_context(|| format!("Failed to write temp history file: {}", temp_path.display()))?;
        fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to rename temp file to: {}", path.display()))?;
        Ok(())
    }
}

impl Default for TransferHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

fn lock(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let lock_path = sidecar(path, "lock");
    let lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .with_context(|| format!("Failed to open lock file: {}", lock_path.display()))?;
    lock_file
        .lock_exclusive()
        .context("Failed to lock history file")?;
    Ok(lock_file)
}

fn sidecar(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}
