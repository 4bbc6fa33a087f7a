// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared content cache.
//!
//! A byte store keyed by [`ContentLocator`] and bounded by a total byte
//! budget. Each entry holds the contiguous prefix of its content that has been
//! written so far, plus a completion flag. When a write pushes the total over
//! budget, least-recently-used entries are evicted until it fits again; the
//! entry being written is never the victim, so a single item larger than the
//! whole budget is kept (and evicted by the next write to another entry).
//!
//! Reads copy the requested range while holding the cache lock, so a reader
//! never observes a torn write and eviction can never pull an entry out from
//! under an in-progress read.
//!
//! The download coordinator is the only writer. Engines read through
//! [`CacheReader`].

mod reader;

pub use reader::CacheReader;

use std::sync::Mutex;

use bytes::Bytes;
use lru::LruCache;
use tracing::debug;

use crate::error::CacheError;
use crate::locks::resilient_lock;
use crate::types::ContentLocator;

#[derive(Debug)]
struct CacheEntry {
    data: Vec<u8>,
    content_length: Option<u64>,
    complete: bool,
}

impl CacheEntry {
    fn new() -> Self {
        Self {
            data: Vec::new(),
            content_length: None,
            complete: false,
        }
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}

#[derive(Debug)]
struct CacheInner {
    entries: LruCache<ContentLocator, CacheEntry>,
    total_bytes: u64,
    released: bool,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub budget_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Size-bounded, LRU-evicting byte store shared by engines and downloads.
#[derive(Debug)]
pub struct ContentCache {
    budget_bytes: u64,
    inner: Mutex<CacheInner>,
}

impl ContentCache {
    pub fn new(budget_bytes: u64) -> Self {
        debug!("ContentCache created: budget={} bytes", budget_bytes);
        Self {
            budget_bytes,
            inner: Mutex::new(CacheInner {
                // Unbounded entry count; eviction is driven by the byte budget.
                entries: LruCache::unbounded(),
                total_bytes: 0,
                released: false,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        }
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    /// Append `chunk` to the entry for `locator` at `offset`.
    ///
    /// `offset` must equal the number of bytes already cached for the
    /// locator; a missing entry is created when `offset` is zero. Returns the
    /// new cached length.
    pub fn append(
        &self,
        locator: &ContentLocator,
        offset: u64,
        chunk: &[u8],
    ) -> Result<u64, CacheError> {
        let mut inner = resilient_lock(&self.inner);
        if inner.released {
            return Err(CacheError::Released);
        }

        let cached = inner.entries.peek(locator).map_or(0, CacheEntry::len);
        if offset != cached {
            return Err(CacheError::NonContiguousWrite {
                locator: locator.clone(),
                offset,
                cached,
            });
        }

        let entry = inner
            .entries
            .get_or_insert_mut(locator.clone(), CacheEntry::new);
        entry.data.extend_from_slice(chunk);
        let new_len = entry.len();
        inner.total_bytes += chunk.len() as u64;

        self.evict_over_budget(&mut inner, Some(locator));
        Ok(new_len)
    }

    /// Record the full length of the content once the source reports it.
    pub fn set_content_length(&self, locator: &ContentLocator, length: u64) {
        let mut inner = resilient_lock(&self.inner);
        if let Some(entry) = inner.entries.peek_mut(locator) {
            entry.content_length = Some(length);
        }
    }

    /// Mark the cached bytes for `locator` as the complete content.
    ///
    /// `expected` is the number of bytes the writer delivered. The entry must
    /// still hold exactly that many; an entry that was evicted or removed
    /// since the last write fails with [`CacheError::NotFound`], and only
    /// genuinely empty content (`expected == 0`) may create a fresh entry.
    pub fn mark_complete(&self, locator: &ContentLocator, expected: u64) -> Result<u64, CacheError> {
        let mut inner = resilient_lock(&self.inner);
        if inner.released {
            return Err(CacheError::Released);
        }
        if expected == 0 && !inner.entries.contains(locator) {
            inner.entries.put(locator.clone(), CacheEntry::new());
        }
        let entry = inner
            .entries
            .peek_mut(locator)
            .ok_or_else(|| CacheError::NotFound(locator.clone()))?;

        let cached = entry.len();
        let declared = entry.content_length.unwrap_or(expected);
        if cached != expected || declared != expected {
            return Err(CacheError::LengthMismatch {
                locator: locator.clone(),
                expected,
                cached,
            });
        }
        entry.complete = true;
        entry.content_length = Some(cached);
        Ok(cached)
    }

    /// Bytes cached for `locator`, without touching recency.
    pub fn cached_len(&self, locator: &ContentLocator) -> u64 {
        resilient_lock(&self.inner)
            .entries
            .peek(locator)
            .map_or(0, CacheEntry::len)
    }

    pub fn is_complete(&self, locator: &ContentLocator) -> bool {
        resilient_lock(&self.inner)
            .entries
            .peek(locator)
            .is_some_and(|e| e.complete)
    }

    /// Full content length recorded for `locator`, if known.
    pub fn content_length(&self, locator: &ContentLocator) -> Option<u64> {
        resilient_lock(&self.inner)
            .entries
            .peek(locator)
            .and_then(|e| e.content_length)
    }

    /// Read up to `len` bytes at `offset`, promoting the entry to most
    /// recently used.
    ///
    /// Returns `None` on a miss: no entry, or nothing cached at `offset`. The
    /// returned range may be shorter than `len` when only a prefix is cached.
    pub fn read(&self, locator: &ContentLocator, offset: u64, len: usize) -> Option<Bytes> {
        let mut inner = resilient_lock(&self.inner);
        if inner.released {
            return None;
        }

        let slice = inner.entries.get(locator).and_then(|entry| {
            let start = usize::try_from(offset).ok()?;
            if start >= entry.data.len() {
                return None;
            }
            let end = start.saturating_add(len).min(entry.data.len());
            Some(Bytes::copy_from_slice(&entry.data[start..end]))
        });

        match slice {
            Some(_) => inner.hits += 1,
            None => inner.misses += 1,
        }
        slice
    }

    /// Drop the entry for `locator`. Returns whether one existed.
    pub fn remove(&self, locator: &ContentLocator) -> bool {
        let mut inner = resilient_lock(&self.inner);
        match inner.entries.pop(locator) {
            Some(entry) => {
                inner.total_bytes -= entry.len();
                debug!("Removed cache entry {} ({} bytes)", locator, entry.len());
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = resilient_lock(&self.inner);
        CacheStats {
            entries: inner.entries.len(),
            total_bytes: inner.total_bytes,
            budget_bytes: self.budget_bytes,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }

    /// Release the cache: drop every entry and refuse further writes.
    ///
    /// Fails with [`CacheError::Released`] when called twice; callers at
    /// teardown log that and move on.
    pub fn release(&self) -> Result<(), CacheError> {
        let mut inner = resilient_lock(&self.inner);
        if inner.released {
            return Err(CacheError::Released);
        }
        inner.entries.clear();
        inner.total_bytes = 0;
        inner.released = true;
        debug!("ContentCache released");
        Ok(())
    }

    pub fn is_released(&self) -> bool {
        resilient_lock(&self.inner).released
    }

    fn evict_over_budget(&self, inner: &mut CacheInner, protect: Option<&ContentLocator>) {
        while inner.total_bytes > self.budget_bytes {
            // Least recently used first, skipping the entry being written.
            let victim = inner
                .entries
                .iter()
                .rev()
                .map(|(key, _)| key)
                .find(|key| Some(*key) != protect)
                .cloned();

            let Some(victim) = victim else {
                break;
            };

            if let Some(evicted) = inner.entries.pop(&victim) {
                inner.total_bytes -= evicted.len();
                inner.evictions += 1;
                debug!(
                    "LRU evicted {}: freed {} bytes (usage: {} / {} bytes)",
                    victim,
                    evicted.len(),
                    inner.total_bytes,
                    self.budget_bytes
                );
            }
        }
    }
}
