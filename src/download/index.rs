// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistent download index.
//!
//! One [`DownloadRecord`] per locator, saved to disk so interrupted downloads
//! resume after a restart. An index opened without a path lives in memory
//! only and `save` is a no-op.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use super::types::{DownloadRecord, DownloadState};
use crate::types::ContentLocator;

/// Default timeout for acquiring file locks (5 seconds)
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval when waiting for lock acquisition
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Count of records per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub queued: usize,
    pub downloading: usize,
    pub completed: usize,
    pub failed: usize,
    pub stopped: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DownloadIndex {
    /// All records, keyed by locator
    pub records: HashMap<ContentLocator, DownloadRecord>,
    /// When the index was last saved
    pub last_saved: Option<DateTime<Utc>>,
    /// Version for future migrations
    pub version: u32,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl DownloadIndex {
    /// Create an empty index that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            records: HashMap::new(),
            last_saved: None,
            version: 1,
            path: None,
        }
    }

    /// Load the index at `path`, or start an empty one bound to it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_timeout(path, LOCK_TIMEOUT)
    }

    pub fn open_with_timeout(path: impl Into<PathBuf>, timeout: Duration) -> Result<Self> {
        let path = path.into();
        let mut index = if path.exists() {
            Self::read_locked(&path, timeout)?
        } else {
            Self::in_memory()
        };
        index.path = Some(path);
        Ok(index)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Lock file guarding the index file.
    ///
    /// A separate file so the lock can be held across the atomic rename.
    fn lock_path(path: &Path) -> PathBuf {
        path.with_extension("lock")
    }

    /// Acquire an exclusive lock with timeout.
    ///
    /// Returns the locked file handle on success, or an error if the timeout expires.
    fn acquire_exclusive_lock_with_timeout(path: &Path, timeout: Duration) -> Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory for lock file: {:?}", parent))?;
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file: {:?}", path))?;

        let start = Instant::now();

        loop {
            match lock_file.try_lock_exclusive() {
                Ok(()) => return Ok(lock_file),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        bail!(
                            "Timed out waiting for exclusive lock on {:?} after {:?}. \
                             Another instance may be writing the download index.",
                            path,
                            timeout
                        );
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to acquire exclusive lock on {:?}", path)
                    });
                }
            }
        }
    }

    /// Acquire a shared lock with timeout.
    fn acquire_shared_lock_with_timeout(file: &File, timeout: Duration) -> Result<()> {
        let start = Instant::now();

        loop {
            match FileExt::try_lock_shared(file) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        bail!(
                            "Timed out waiting for shared lock after {:?}. \
                             Another instance may be writing the download index.",
                            timeout
                        );
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(e).with_context(|| "Failed to acquire shared lock on download index");
                }
            }
        }
    }

    fn read_locked(path: &Path, timeout: Duration) -> Result<Self> {
        let lock_path = Self::lock_path(path);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file: {:?}", lock_path))?;

        Self::acquire_shared_lock_with_timeout(&lock_file, timeout)?;

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read download index: {:?}", path))?;
        let index: DownloadIndex = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse download index: {:?}", path))?;

        // Lock is released when lock_file is dropped
        Ok(index)
    }

    /// Save with temp file + atomic rename under an exclusive lock.
    pub fn save(&mut self) -> Result<()> {
        self.save_with_timeout(LOCK_TIMEOUT)
    }

    pub fn save_with_timeout(&mut self, timeout: Duration) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let _lock_guard = Self::acquire_exclusive_lock_with_timeout(&Self::lock_path(&path), timeout)?;

        let temp_path = path.with_extension("tmp");
        self.last_saved = Some(Utc::now());

        let content = serde_json::to_string_pretty(self)
            .with_context(|| "Failed to serialize download index to JSON")?;

        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;

            temp_file
                .write_all(content.as_bytes())
                .with_context(|| "Failed to write to temp file")?;

            temp_file
                .sync_all()
                .with_context(|| "Failed to sync temp file to disk")?;
        }

        fs::rename(&temp_path, &path).with_context(|| {
            format!("Failed to rename temp file to download index: {:?} -> {:?}", temp_path, path)
        })?;

        Ok(())
    }

    /// Add or replace a record.
    pub fn upsert(&mut self, record: DownloadRecord) {
        self.records.insert(record.locator.clone(), record);
    }

    pub fn get(&self, locator: &ContentLocator) -> Option<&DownloadRecord> {
        self.records.get(locator)
    }

    pub fn get_mut(&mut self, locator: &ContentLocator) -> Option<&mut DownloadRecord> {
        self.records.get_mut(locator)
    }

    pub fn remove(&mut self, locator: &ContentLocator) -> Option<DownloadRecord> {
        self.records.remove(locator)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records, oldest first.
    pub fn records_by_age(&self) -> Vec<&DownloadRecord> {
        let mut records: Vec<_> = self.records.values().collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.locator.cmp(&b.locator))
        });
        records
    }

    /// Records that were queued or running when the index was last saved,
    /// oldest first.
    pub fn interrupted(&self) -> Vec<ContentLocator> {
        self.records_by_age()
            .into_iter()
            .filter(|r| r.state.is_active())
            .map(|r| r.locator.clone())
            .collect()
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for record in self.records.values() {
            match record.state {
                DownloadState::Queued => counts.queued += 1,
                DownloadState::Downloading => counts.downloading += 1,
                DownloadState::Completed => counts.completed += 1,
                DownloadState::Failed => counts.failed += 1,
                DownloadState::Stopped => counts.stopped += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn record(locator: &str, state: DownloadState) -> DownloadRecord {
        let mut record = DownloadRecord::new(ContentLocator::from(locator));
        record.update_state(state);
        record
    }

    #[test]
    fn test_in_memory_save_is_noop() {
        let mut index = DownloadIndex::in_memory();
        index.upsert(record("a", DownloadState::Queued));
        assert!(index.save().is_ok());
        assert!(index.path().is_none());
        assert!(index.last_saved.is_none());
    }

    #[test]
    fn test_save_and_reopen() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("nested").join("downloads.json");

        let mut index = DownloadIndex::open(&path).unwrap();
        assert!(index.is_empty());
        let mut partial = record("https://cdn/a.mp4", DownloadState::Failed);
        partial.bytes_downloaded = 1024;
        partial.content_length = Some(4096);
        partial.error = Some("connection reset".to_string());
        index.upsert(partial.clone());
        index.save().unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let reopened = DownloadIndex::open(&path).unwrap();
        assert_eq!(reopened.get(&partial.locator), Some(&partial));
        assert!(reopened.last_saved.is_some());
    }

    #[test]
    fn test_interrupted_and_counts() {
        let mut index = DownloadIndex::in_memory();
        index.upsert(record("q", DownloadState::Queued));
        index.upsert(record("d", DownloadState::Downloading));
        index.upsert(record("c", DownloadState::Completed));
        index.upsert(record("f", DownloadState::Failed));
        index.upsert(record("s", DownloadState::Stopped));

        let mut interrupted = index.interrupted();
        interrupted.sort();
        assert_eq!(
            interrupted,
            vec![ContentLocator::from("d"), ContentLocator::from("q")]
        );
        assert_eq!(
            index.status_counts(),
            StatusCounts {
                queued: 1,
                downloading: 1,
                completed: 1,
                failed: 1,
                stopped: 1
            }
        );
    }

    #[test]
    fn test_corrupt_index_is_an_error() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("downloads.json");
        fs::write(&path, "{ not json").unwrap();
        let err = DownloadIndex::open(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse download index"));
    }

    // ========================================================================
    // File locking tests
    // ========================================================================

    #[test]
    fn test_lock_acquisition_exclusive() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let lock_path = temp_dir.path().join("test.lock");

        let lock1 =
            DownloadIndex::acquire_exclusive_lock_with_timeout(&lock_path, Duration::from_secs(1));
        assert!(lock1.is_ok(), "First exclusive lock should succeed");

        let lock2 = DownloadIndex::acquire_exclusive_lock_with_timeout(
            &lock_path,
            Duration::from_millis(100),
        );
        assert!(lock2.is_err(), "Second exclusive lock should fail while first is held");

        drop(lock1);

        let lock3 =
            DownloadIndex::acquire_exclusive_lock_with_timeout(&lock_path, Duration::from_secs(1));
        assert!(lock3.is_ok(), "Lock should succeed after previous lock released");
    }

    #[test]
    fn test_exclusive_lock_blocks_reader() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("downloads.json");
        let mut index = DownloadIndex::open(&path).unwrap();
        index.upsert(record("a", DownloadState::Completed));
        index.save().unwrap();

        let _writer = DownloadIndex::acquire_exclusive_lock_with_timeout(
            &DownloadIndex::lock_path(&path),
            Duration::from_secs(1),
        )
        .expect("Exclusive lock should succeed");

        let result = DownloadIndex::open_with_timeout(&path, Duration::from_millis(100));
        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("Timed out"), "Error should mention timeout: {}", err_msg);
    }

    #[test]
    fn test_concurrent_saves_are_serialized() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = Arc::new(temp_dir.path().join("downloads.json"));
        let saves = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let path = Arc::clone(&path);
                let saves = Arc::clone(&saves);
                thread::spawn(move || {
                    for j in 0..3 {
                        let mut index = DownloadIndex::in_memory();
                        index.path = Some(path.to_path_buf());
                        index.upsert(record(&format!("{}-{}", i, j), DownloadState::Queued));
                        if index.save_with_timeout(Duration::from_secs(10)).is_ok() {
                            saves.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("Thread panicked");
        }

        assert_eq!(saves.load(Ordering::SeqCst), 12);
        // Whatever write landed last, the file is whole.
        let index = DownloadIndex::open(path.as_path()).unwrap();
        assert_eq!(index.len(), 1);
    }
}
