// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download coordinator for cache pre-fetching.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::index::{DownloadIndex, StatusCounts};
use super::listener::DownloadListener;
use super::types::{DownloadInfo, DownloadProgress, DownloadRecord, DownloadState};
use crate::cache::ContentCache;
use crate::config::DownloadConfig;
use crate::error::{DownloadError, TransportError};
use crate::locks::resilient_lock;
use crate::transport::Transport;
use crate::types::ContentLocator;

/// Handle to a download, allowing status checks.
#[derive(Debug, Clone)]
pub struct DownloadHandle {
    /// Locator being downloaded
    pub locator: ContentLocator,
    progress_rx: watch::Receiver<DownloadProgress>,
}

impl DownloadHandle {
    /// Get the current progress.
    pub fn progress(&self) -> DownloadProgress {
        self.progress_rx.borrow().clone()
    }

    /// Check if the download reached completed or failed.
    pub fn is_terminal(&self) -> bool {
        self.progress_rx.borrow().state.is_terminal()
    }

    /// Wait until the download completes or fails.
    ///
    /// Also returns when the request is stopped-and-removed or the
    /// coordinator shuts down; the returned progress then carries the error.
    pub async fn wait(&mut self) -> DownloadProgress {
        loop {
            if self.progress_rx.borrow().state.is_terminal() {
                return self.progress_rx.borrow().clone();
            }
            if self.progress_rx.changed().await.is_err() {
                // Channel closed
                return self.progress_rx.borrow().clone();
            }
        }
    }

    fn settled(progress: DownloadProgress) -> Self {
        let locator = progress.locator.clone();
        let (_, progress_rx) = watch::channel(progress);
        Self {
            locator,
            progress_rx,
        }
    }
}

/// In-flight or paused request state. Present while a transfer is queued,
/// running or stopped; removed at completion, failure and removal.
struct Request {
    generation: u64,
    listeners: Vec<Arc<dyn DownloadListener>>,
    progress: watch::Sender<DownloadProgress>,
    /// Set while a transfer task owns the request.
    cancel: Option<CancellationToken>,
}

impl Request {
    fn is_running(&self, generation: u64) -> bool {
        self.cancel.is_some() && self.generation == generation
    }
}

struct Registry {
    index: DownloadIndex,
    requests: HashMap<ContentLocator, Request>,
    next_generation: u64,
    shut_down: bool,
}

impl Registry {
    fn save_index(&mut self) {
        if let Err(e) = self.index.save() {
            warn!("Failed to save download index: {:#}", e);
        }
    }

    fn record_mut(&mut self, locator: &ContentLocator) -> &mut DownloadRecord {
        self.index
            .records
            .entry(locator.clone())
            .or_insert_with(|| DownloadRecord::new(locator.clone()))
    }
}

/// Progress to deliver to a snapshot of listeners once the lock is dropped.
struct Notice {
    listeners: Vec<Arc<dyn DownloadListener>>,
    progress: DownloadProgress,
}

impl Notice {
    fn deliver_progress(&self) {
        for listener in &self.listeners {
            listener.on_progress(&self.progress);
        }
    }
}

struct Shared {
    cache: Arc<ContentCache>,
    transport: Arc<dyn Transport>,
    permits: Arc<Semaphore>,
    max_parallel: usize,
    runtime: Handle,
    shutdown: CancellationToken,
    registry: Mutex<Registry>,
}

/// Coordinates pre-fetch downloads into the shared content cache.
///
/// At most one transfer runs per locator; repeated requests attach their
/// listeners to the running one. At most `max_parallel_downloads` transfers
/// run at once and the rest wait for a permit in the queued state. Listener
/// callbacks run on the transfer task, never under the coordinator's lock.
pub struct DownloadCoordinator {
    shared: Arc<Shared>,
}

impl DownloadCoordinator {
    /// Create a coordinator on the current tokio runtime.
    ///
    /// Opens the index at `config.index_path` when set, and resumes every
    /// record that was queued or downloading when it was last saved.
    pub fn new(
        cache: Arc<ContentCache>,
        transport: Arc<dyn Transport>,
        config: &DownloadConfig,
    ) -> Result<Self> {
        let index = match &config.index_path {
            Some(path) => DownloadIndex::open(path)
                .with_context(|| format!("Failed to open download index {:?}", path))?,
            None => DownloadIndex::in_memory(),
        };
        Self::with_index(cache, transport, config.max_parallel_downloads, index)
    }

    pub fn with_index(
        cache: Arc<ContentCache>,
        transport: Arc<dyn Transport>,
        max_parallel: usize,
        index: DownloadIndex,
    ) -> Result<Self> {
        let runtime =
            Handle::try_current().context("DownloadCoordinator must be created inside a tokio runtime")?;
        let max_parallel = max_parallel.max(1);
        let interrupted = index.interrupted();

        let coordinator = Self {
            shared: Arc::new(Shared {
                cache,
                transport,
                permits: Arc::new(Semaphore::new(max_parallel)),
                max_parallel,
                runtime,
                shutdown: CancellationToken::new(),
                registry: Mutex::new(Registry {
                    index,
                    requests: HashMap::new(),
                    next_generation: 0,
                    shut_down: false,
                }),
            }),
        };

        if !interrupted.is_empty() {
            info!("Resuming {} interrupted downloads", interrupted.len());
            let mut registry = resilient_lock(&coordinator.shared.registry);
            for locator in interrupted {
                Shared::submit(&coordinator.shared, &mut registry, locator, None);
            }
            registry.save_index();
        }

        Ok(coordinator)
    }

    pub fn max_parallel_downloads(&self) -> usize {
        self.shared.max_parallel
    }

    /// Request `locator` into the cache.
    ///
    /// Already complete: `on_complete` fires immediately and nothing is
    /// fetched. Already queued or downloading: the listener joins the
    /// running transfer. Otherwise a transfer is queued, resuming from the
    /// bytes already cached.
    pub fn download(
        &self,
        locator: impl Into<ContentLocator>,
        listener: impl DownloadListener + 'static,
    ) -> DownloadHandle {
        let listener: Arc<dyn DownloadListener> = Arc::new(listener);
        self.download_with_listener(locator.into(), Some(listener))
    }

    /// Request `locator` without attaching callbacks.
    pub fn prefetch(&self, locator: impl Into<ContentLocator>) -> DownloadHandle {
        self.download_with_listener(locator.into(), None)
    }

    pub fn download_with_listener(
        &self,
        locator: ContentLocator,
        listener: Option<Arc<dyn DownloadListener>>,
    ) -> DownloadHandle {
        let shared = &self.shared;
        let mut registry = resilient_lock(&shared.registry);

        if registry.shut_down {
            drop(registry);
            let mut progress = DownloadProgress::from_record(
                &DownloadRecord::new(locator),
                Some(DownloadError::ShutDown),
            );
            progress.state = DownloadState::Failed;
            if let Some(listener) = listener {
                listener.on_error(&DownloadError::ShutDown);
            }
            return DownloadHandle::settled(progress);
        }

        if shared.cache.is_complete(&locator) {
            let bytes = shared.cache.cached_len(&locator);
            let record = registry.record_mut(&locator);
            if record.state != DownloadState::Completed || record.bytes_downloaded != bytes {
                record.bytes_downloaded = bytes;
                record.content_length = Some(bytes);
                record.error = None;
                record.update_state(DownloadState::Completed);
                registry.save_index();
            }
            drop(registry);

            debug!("Already downloaded: {}", locator);
            let progress = DownloadProgress::completed(locator, bytes);
            if let Some(listener) = listener {
                listener.on_complete(&progress);
            }
            return DownloadHandle::settled(progress);
        }

        if let Some(request) = registry.requests.get_mut(&locator) {
            if request.cancel.is_some() {
                let handle = DownloadHandle {
                    locator: locator.clone(),
                    progress_rx: request.progress.subscribe(),
                };
                if let Some(listener) = listener {
                    request.listeners.push(listener);
                }
                debug!(
                    "Download in progress: {} ({:.0}%), attached listener",
                    locator,
                    handle.progress().fraction * 100.0
                );
                return handle;
            }
        }

        let handle = Shared::submit(shared, &mut registry, locator, listener);
        registry.save_index();
        handle
    }

    /// Pause the transfer of `locator`, keeping its cached bytes and its
    /// listeners. A later `download` resumes it. Returns whether a transfer
    /// was queued or running.
    pub fn stop(&self, locator: &ContentLocator) -> bool {
        let notice = {
            let mut registry = resilient_lock(&self.shared.registry);
            let Some(request) = registry.requests.get_mut(locator) else {
                return false;
            };
            let Some(cancel) = request.cancel.take() else {
                return false;
            };
            cancel.cancel();
            let listeners = request.listeners.clone();

            let record = registry.record_mut(locator);
            record.update_state(DownloadState::Stopped);
            let progress = DownloadProgress::from_record(record, None);
            if let Some(request) = registry.requests.get(locator) {
                request.progress.send_replace(progress.clone());
            }
            registry.save_index();
            Notice {
                listeners,
                progress,
            }
        };

        info!("Stopped download: {}", locator);
        notice.deliver_progress();
        true
    }

    /// Cancel any transfer of `locator` and delete its record and cached
    /// bytes. Attached listeners receive [`DownloadError::Cancelled`].
    /// Returns whether anything existed.
    pub fn remove(&self, locator: &ContentLocator) -> bool {
        let (existed, notice) = {
            let mut registry = resilient_lock(&self.shared.registry);
            let notice = Self::detach(&mut registry, locator);
            let record = registry.index.remove(locator).is_some();
            let cached = self.shared.cache.remove(locator);
            if record || notice.is_some() {
                registry.save_index();
            }
            (record || cached || notice.is_some(), notice)
        };

        if let Some(notice) = notice {
            let error = DownloadError::Cancelled(locator.clone());
            for listener in &notice.listeners {
                listener.on_error(&error);
            }
        }
        if existed {
            info!("Removed download: {}", locator);
        }
        existed
    }

    /// Remove every record, transfer and cached download.
    pub fn remove_all(&self) {
        let notices = {
            let mut registry = resilient_lock(&self.shared.registry);
            let mut locators: Vec<ContentLocator> = registry.index.records.keys().cloned().collect();
            locators.extend(
                registry
                    .requests
                    .keys()
                    .filter(|l| !registry.index.records.contains_key(*l))
                    .cloned(),
            );

            let mut notices = Vec::new();
            for locator in &locators {
                if let Some(notice) = Self::detach(&mut registry, locator) {
                    notices.push((locator.clone(), notice));
                }
                self.shared.cache.remove(locator);
            }
            registry.index.clear();
            registry.save_index();
            info!("Removed {} downloads", locators.len());
            notices
        };

        for (locator, notice) in notices {
            let error = DownloadError::Cancelled(locator);
            for listener in &notice.listeners {
                listener.on_error(&error);
            }
        }
    }

    /// Cancel and drop the request for `locator`, publishing a cancellation
    /// to its handles.
    fn detach(registry: &mut Registry, locator: &ContentLocator) -> Option<Notice> {
        let request = registry.requests.remove(locator)?;
        if let Some(cancel) = &request.cancel {
            cancel.cancel();
        }
        let mut progress = request.progress.borrow().clone();
        progress.error = Some(DownloadError::Cancelled(locator.clone()));
        request.progress.send_replace(progress.clone());
        Some(Notice {
            listeners: request.listeners,
            progress,
        })
    }

    /// Whether the full content of `locator` is in the cache.
    pub fn is_fully_downloaded(&self, locator: &ContentLocator) -> bool {
        self.shared.cache.is_complete(locator)
    }

    /// State and progress of `locator`.
    ///
    /// `None` when unknown, and when the record claims completion but the
    /// cache has since evicted the bytes.
    pub fn get_info(&self, locator: &ContentLocator) -> Option<DownloadInfo> {
        let registry = resilient_lock(&self.shared.registry);
        let record = registry.index.get(locator)?;
        if record.state == DownloadState::Completed && !self.shared.cache.is_complete(locator) {
            return None;
        }
        Some(record.info())
    }

    /// Locators currently queued or downloading.
    pub fn active_downloads(&self) -> Vec<ContentLocator> {
        let registry = resilient_lock(&self.shared.registry);
        let mut active: Vec<_> = registry
            .requests
            .iter()
            .filter(|(_, r)| r.cancel.is_some())
            .map(|(l, _)| l.clone())
            .collect();
        active.sort();
        active
    }

    /// Snapshot of every record, oldest first.
    pub fn records(&self) -> Vec<DownloadRecord> {
        let registry = resilient_lock(&self.shared.registry);
        registry.index.records_by_age().into_iter().cloned().collect()
    }

    pub fn stats(&self) -> StatusCounts {
        resilient_lock(&self.shared.registry).index.status_counts()
    }

    /// Cancel every transfer and refuse new requests.
    ///
    /// Records keep their queued or downloading state in the index, so the
    /// next coordinator opened on it resumes them. Attached listeners receive
    /// [`DownloadError::ShutDown`]. Idempotent.
    pub fn shutdown(&self) {
        let notices = {
            let mut registry = resilient_lock(&self.shared.registry);
            if registry.shut_down {
                return;
            }
            registry.shut_down = true;
            self.shared.shutdown.cancel();

            let notices: Vec<Notice> = registry
                .requests
                .drain()
                .map(|(_, request)| {
                    let mut progress = request.progress.borrow().clone();
                    progress.error = Some(DownloadError::ShutDown);
                    request.progress.send_replace(progress.clone());
                    Notice {
                        listeners: request.listeners,
                        progress,
                    }
                })
                .collect();
            registry.save_index();
            notices
        };

        info!("Download coordinator shut down");
        for notice in notices {
            for listener in &notice.listeners {
                listener.on_error(&DownloadError::ShutDown);
            }
        }
    }
}

impl Drop for DownloadCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    /// Queue a fresh transfer for `locator`. Caller holds the registry lock
    /// and saves the index.
    fn submit(
        shared: &Arc<Shared>,
        registry: &mut Registry,
        locator: ContentLocator,
        listener: Option<Arc<dyn DownloadListener>>,
    ) -> DownloadHandle {
        let resume_from = shared.cache.cached_len(&locator);
        let record = registry.record_mut(&locator);
        if record.state.is_resumable() {
            info!("Resuming download: {} ({:.0}%)", locator, record.percent());
        }
        record.bytes_downloaded = resume_from;
        record.error = None;
        record.update_state(DownloadState::Queued);
        let progress = DownloadProgress::from_record(record, None);

        let generation = registry.next_generation;
        registry.next_generation += 1;
        let cancel = shared.shutdown.child_token();

        let request = registry
            .requests
            .entry(locator.clone())
            .or_insert_with(|| Request {
                generation,
                listeners: Vec::new(),
                progress: watch::channel(progress.clone()).0,
                cancel: None,
            });
        request.generation = generation;
        request.cancel = Some(cancel.clone());
        request.progress.send_replace(progress);
        if let Some(listener) = listener {
            request.listeners.push(listener);
        }
        let handle = DownloadHandle {
            locator: locator.clone(),
            progress_rx: request.progress.subscribe(),
        };

        let task_shared = Arc::clone(shared);
        shared.runtime.spawn(async move {
            task_shared.run(locator, generation, cancel).await;
        });

        handle
    }

    async fn run(self: Arc<Self>, locator: ContentLocator, generation: u64, cancel: CancellationToken) {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DownloadError::Cancelled(locator.clone())),
            outcome = self.transfer(&locator, generation) => outcome,
        };

        match outcome {
            Ok(bytes) => self.finish(&locator, generation, Ok(bytes)),
            Err(DownloadError::Cancelled(_)) => {
                debug!("Transfer of {} ended after cancellation", locator);
            }
            Err(e) => self.finish(&locator, generation, Err(e)),
        }
    }

    /// Apply `update` to the record of a running transfer and snapshot the
    /// listeners. `None` when the transfer is no longer current.
    fn advance(
        &self,
        locator: &ContentLocator,
        generation: u64,
        save: bool,
        update: impl FnOnce(&mut DownloadRecord),
    ) -> Option<Notice> {
        let mut registry = resilient_lock(&self.registry);
        let listeners = registry
            .requests
            .get(locator)
            .filter(|r| r.is_running(generation))?
            .listeners
            .clone();

        let record = registry.record_mut(locator);
        update(record);
        let progress = DownloadProgress::from_record(record, None);
        if let Some(request) = registry.requests.get(locator) {
            request.progress.send_replace(progress.clone());
        }
        if save {
            registry.save_index();
        }
        Some(Notice {
            listeners,
            progress,
        })
    }

    async fn transfer(&self, locator: &ContentLocator, generation: u64) -> Result<u64, DownloadError> {
        let cancelled = || DownloadError::Cancelled(locator.clone());

        self.advance(locator, generation, false, |_| {})
            .ok_or_else(cancelled)?
            .deliver_progress();

        let _permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| DownloadError::ShutDown)?;

        let offset = self.cache.cached_len(locator);
        self.advance(locator, generation, true, |record| {
            record.bytes_downloaded = offset;
            record.update_state(DownloadState::Downloading);
        })
        .ok_or_else(cancelled)?
        .deliver_progress();
        info!("Downloading {} from byte {}", locator, offset);

        let body = self.transport.open(locator, offset).await?;
        let mut written = offset;
        if body.start != offset {
            if body.start != 0 {
                return Err(TransportError::Stream {
                    locator: locator.clone(),
                    received: 0,
                    message: format!("requested byte {} but source started at {}", offset, body.start),
                }
                .into());
            }
            debug!("{} restarted from zero, discarding {} cached bytes", locator, offset);
            self.discard_partial(locator, generation)?;
            written = 0;
        }

        let total_len = body.total_len;
        self.advance(locator, generation, false, |record| {
            record.bytes_downloaded = written;
            record.content_length = total_len.or(record.content_length);
        })
        .ok_or_else(cancelled)?;

        let mut chunks = body.chunks;
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }
            let notice = self.write_chunk(locator, generation, written, &chunk, total_len)?;
            written = notice.progress.bytes_downloaded;
            notice.deliver_progress();
        }

        if let Some(total) = total_len {
            if written < total {
                return Err(TransportError::Stream {
                    locator: locator.clone(),
                    received: written,
                    message: format!("stream ended before {} bytes", total),
                }
                .into());
            }
        }

        self.complete_entry(locator, generation, written)
    }

    /// Mark the cached entry complete while holding the registry lock.
    ///
    /// Fails when the entry no longer holds the `written` bytes, so content
    /// evicted after its last chunk is reported as a failed transfer and
    /// fetched again on the next request.
    fn complete_entry(
        &self,
        locator: &ContentLocator,
        generation: u64,
        written: u64,
    ) -> Result<u64, DownloadError> {
        let registry = resilient_lock(&self.registry);
        if !registry
            .requests
            .get(locator)
            .is_some_and(|r| r.is_running(generation))
        {
            return Err(DownloadError::Cancelled(locator.clone()));
        }
        Ok(self.cache.mark_complete(locator, written)?)
    }

    /// Drop the cached prefix of a transfer the source restarted from zero.
    fn discard_partial(&self, locator: &ContentLocator, generation: u64) -> Result<(), DownloadError> {
        let registry = resilient_lock(&self.registry);
        if !registry
            .requests
            .get(locator)
            .is_some_and(|r| r.is_running(generation))
        {
            return Err(DownloadError::Cancelled(locator.clone()));
        }
        self.cache.remove(locator);
        Ok(())
    }

    /// Append `chunk` at `offset` while holding the registry lock, so a
    /// concurrent stop or remove can never be followed by a stale write.
    fn write_chunk(
        &self,
        locator: &ContentLocator,
        generation: u64,
        offset: u64,
        chunk: &[u8],
        total_len: Option<u64>,
    ) -> Result<Notice, DownloadError> {
        let mut registry = resilient_lock(&self.registry);
        let listeners = registry
            .requests
            .get(locator)
            .filter(|r| r.is_running(generation))
            .ok_or_else(|| DownloadError::Cancelled(locator.clone()))?
            .listeners
            .clone();

        let written = self.cache.append(locator, offset, chunk)?;
        if let Some(total) = total_len {
            self.cache.set_content_length(locator, total);
        }

        let record = registry.record_mut(locator);
        record.bytes_downloaded = written;
        let progress = DownloadProgress::from_record(record, None);
        if let Some(request) = registry.requests.get(locator) {
            request.progress.send_replace(progress.clone());
        }
        Ok(Notice {
            listeners,
            progress,
        })
    }

    /// Record the terminal outcome of a current transfer and deliver it.
    fn finish(&self, locator: &ContentLocator, generation: u64, outcome: Result<u64, DownloadError>) {
        let notice = {
            let mut registry = resilient_lock(&self.registry);
            let current = registry
                .requests
                .get(locator)
                .is_some_and(|r| r.is_running(generation));
            if !current {
                return;
            }
            let Some(request) = registry.requests.remove(locator) else {
                return;
            };

            let record = registry.record_mut(locator);
            let error = match &outcome {
                Ok(bytes) => {
                    record.bytes_downloaded = *bytes;
                    record.content_length = Some(*bytes);
                    record.error = None;
                    record.update_state(DownloadState::Completed);
                    None
                }
                Err(e) => {
                    record.error = Some(e.to_string());
                    record.update_state(DownloadState::Failed);
                    Some(e.clone())
                }
            };
            let progress = DownloadProgress::from_record(record, error);
            request.progress.send_replace(progress.clone());
            registry.save_index();
            Notice {
                listeners: request.listeners,
                progress,
            }
        };

        notice.deliver_progress();
        match outcome {
            Ok(bytes) => {
                info!("Completed: {} ({} bytes)", locator, bytes);
                for listener in &notice.listeners {
                    listener.on_complete(&notice.progress);
                }
            }
            Err(e) => {
                warn!("Failed: {}: {}", locator, e);
                for listener in &notice.listeners {
                    listener.on_error(&e);
                }
            }
        }
    }
}
