// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Cache-backed playback engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{EngineFactory, EngineId, EngineStatus, PlaybackEngine};
use crate::cache::{CacheReader, ContentCache};
use crate::config::EngineConfig;
use crate::transport::Transport;
use crate::types::ContentLocator;

/// Engine that buffers the head of its content through the shared cache.
///
/// `prepare` never waits: it spawns a prefetch of `prefetch_bytes` on the
/// current tokio runtime and flips the status to [`EngineStatus::Ready`] when
/// the bytes arrive. Every rebind bumps a generation counter, and a prefetch
/// only publishes its result while its generation is still current.
pub struct CachedEngine {
    id: EngineId,
    config: EngineConfig,
    reader: CacheReader,
    content: Option<ContentLocator>,
    play_when_ready: bool,
    status: Arc<watch::Sender<EngineStatus>>,
    generation: Arc<AtomicU64>,
    prefetch: Option<JoinHandle<()>>,
}

impl CachedEngine {
    pub fn new(id: EngineId, config: &EngineConfig, reader: CacheReader) -> Self {
        let (status, _) = watch::channel(EngineStatus::Idle);
        Self {
            id,
            config: config.clone(),
            reader,
            content: None,
            play_when_ready: config.play_when_ready,
            status: Arc::new(status),
            generation: Arc::new(AtomicU64::new(0)),
            prefetch: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn repeat_one(&self) -> bool {
        self.config.repeat_one
    }

    pub fn volume(&self) -> f32 {
        self.config.volume
    }

    /// Invalidate any running prefetch and publish `status`.
    ///
    /// The generation bump happens under the watch channel's lock, the same
    /// lock a finishing prefetch publishes under.
    fn invalidate(&mut self, status: EngineStatus) -> u64 {
        if let Some(task) = self.prefetch.take() {
            task.abort();
        }
        let generation = &self.generation;
        let mut current = 0;
        self.status.send_modify(|s| {
            current = generation.fetch_add(1, Ordering::SeqCst) + 1;
            *s = status;
        });
        current
    }
}

impl PlaybackEngine for CachedEngine {
    fn id(&self) -> EngineId {
        self.id
    }

    fn set_content(&mut self, locator: ContentLocator) {
        self.invalidate(EngineStatus::Idle);
        self.content = Some(locator);
    }

    fn prepare(&mut self) {
        let Some(locator) = self.content.clone() else {
            return;
        };
        let generation = self.invalidate(EngineStatus::Preparing);
        let prefetch = self.config.prefetch_bytes;

        if self.reader.is_prefix_cached(&locator, prefetch) {
            self.status.send_replace(EngineStatus::Ready);
            return;
        }

        let Ok(runtime) = Handle::try_current() else {
            debug!("{}: no runtime, {} stays preparing until cached", self.id, locator);
            return;
        };

        let reader = self.reader.clone();
        let status = Arc::clone(&self.status);
        let current = Arc::clone(&self.generation);
        let id = self.id;
        let len = usize::try_from(prefetch).unwrap_or(usize::MAX);

        self.prefetch = Some(runtime.spawn(async move {
            let outcome = match reader.read_prefix(&locator, len).await {
                Ok(_) => EngineStatus::Ready,
                Err(e) => {
                    warn!("{}: prefetch of {} failed: {}", id, locator, e);
                    EngineStatus::Error
                }
            };
            status.send_if_modified(|s| {
                if current.load(Ordering::SeqCst) != generation {
                    return false;
                }
                *s = outcome;
                true
            });
        }));
    }

    fn set_play_when_ready(&mut self, play: bool) {
        self.play_when_ready = play;
    }

    fn play_when_ready(&self) -> bool {
        self.play_when_ready
    }

    fn stop(&mut self) {
        self.invalidate(EngineStatus::Idle);
        self.play_when_ready = false;
    }

    fn clear_content(&mut self) {
        self.invalidate(EngineStatus::Idle);
        self.content = None;
    }

    fn release(&mut self) {
        self.invalidate(EngineStatus::Released);
        self.content = None;
        // Drop the cache handle so teardown can observe the last reference.
        self.reader = CacheReader::default();
    }

    fn content(&self) -> Option<&ContentLocator> {
        self.content.as_ref()
    }

    fn status(&self) -> EngineStatus {
        *self.status.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<EngineStatus> {
        self.status.subscribe()
    }
}

impl Drop for CachedEngine {
    fn drop(&mut self) {
        if let Some(task) = self.prefetch.take() {
            task.abort();
        }
    }
}

/// Builds [`CachedEngine`]s reading through the pool's cache and, on a miss,
/// an upstream transport.
#[derive(Clone, Default)]
pub struct CachedEngineFactory {
    upstream: Option<Arc<dyn Transport>>,
}

impl CachedEngineFactory {
    pub fn new(upstream: Option<Arc<dyn Transport>>) -> Self {
        Self { upstream }
    }
}

impl EngineFactory for CachedEngineFactory {
    fn create(
        &self,
        id: EngineId,
        config: &EngineConfig,
        cache: Option<Arc<ContentCache>>,
    ) -> Box<dyn PlaybackEngine> {
        let reader = CacheReader::new(cache, self.upstream.clone());
        Box::new(CachedEngine::new(id, config, reader))
    }
}
