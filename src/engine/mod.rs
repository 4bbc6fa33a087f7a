// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Playback engines.
//!
//! A playback engine loads one content item at a time and is reused across
//! slots. The pool only needs the lifecycle surface in [`PlaybackEngine`];
//! decoding and rendering belong to the host. [`CachedEngine`] is the engine
//! shipped with the crate: it prefetches the head of its content through the
//! shared cache and reports readiness.
//!
//! Engines are shared between the pool and the host through [`EngineHandle`],
//! a cloneable handle whose identity is the underlying engine instance.

mod cached;

pub use cached::{CachedEngine, CachedEngineFactory};

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;

use crate::cache::ContentCache;
use crate::config::EngineConfig;
use crate::locks::resilient_lock;
use crate::types::ContentLocator;

/// Pool-assigned identity of an engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineId(pub u64);

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine-{}", self.0)
    }
}

/// Readiness of an engine's bound content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// No content bound, or stopped.
    Idle,
    /// Content bound and `prepare` issued; loading in the background.
    Preparing,
    /// Enough content buffered to start playback instantly.
    Ready,
    /// Loading failed; the engine stays usable for the next binding.
    Error,
    /// Destroyed at pool teardown.
    Released,
}

/// Lifecycle surface of a heavyweight playback resource.
pub trait PlaybackEngine: Send {
    fn id(&self) -> EngineId;

    /// Load `locator` as the engine's only content item.
    fn set_content(&mut self, locator: ContentLocator);

    /// Start loading the bound content. Must return without waiting for I/O.
    fn prepare(&mut self);

    fn set_play_when_ready(&mut self, play: bool);

    fn play_when_ready(&self) -> bool;

    /// Halt playback and loading; the bound content stays set.
    fn stop(&mut self);

    fn clear_content(&mut self);

    /// Destroy the engine. No other method is called afterwards.
    fn release(&mut self);

    fn content(&self) -> Option<&ContentLocator>;

    fn status(&self) -> EngineStatus;

    /// Watch readiness transitions.
    fn subscribe(&self) -> watch::Receiver<EngineStatus>;
}

/// Creates engines for a pool.
///
/// The pool passes its shared cache at creation time, so an engine reads
/// through the same cache the download coordinator writes into.
pub trait EngineFactory: Send + Sync {
    fn create(
        &self,
        id: EngineId,
        config: &EngineConfig,
        cache: Option<Arc<ContentCache>>,
    ) -> Box<dyn PlaybackEngine>;
}

impl<F> EngineFactory for F
where
    F: Fn(EngineId, &EngineConfig, Option<Arc<ContentCache>>) -> Box<dyn PlaybackEngine>
        + Send
        + Sync,
{
    fn create(
        &self,
        id: EngineId,
        config: &EngineConfig,
        cache: Option<Arc<ContentCache>>,
    ) -> Box<dyn PlaybackEngine> {
        self(id, config, cache)
    }
}

/// Shared handle to a pooled engine.
///
/// Cloning the handle does not clone the engine; two handles refer to the same
/// instance exactly when [`EngineHandle::same_engine`] says so.
#[derive(Clone)]
pub struct EngineHandle {
    id: EngineId,
    inner: Arc<Mutex<Box<dyn PlaybackEngine>>>,
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle").field("id", &self.id).finish_non_exhaustive()
    }
}

impl EngineHandle {
    pub(crate) fn new(engine: Box<dyn PlaybackEngine>) -> Self {
        Self {
            id: engine.id(),
            inner: Arc::new(Mutex::new(engine)),
        }
    }

    pub fn id(&self) -> EngineId {
        self.id
    }

    /// Lock the engine for direct use by the host.
    ///
    /// Do not call back into the pool while holding the guard.
    pub fn lock(&self) -> MutexGuard<'_, Box<dyn PlaybackEngine>> {
        resilient_lock(&self.inner)
    }

    pub fn same_engine(&self, other: &EngineHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn content(&self) -> Option<ContentLocator> {
        self.lock().content().cloned()
    }

    pub fn status(&self) -> EngineStatus {
        self.lock().status()
    }

    pub fn play_when_ready(&self) -> bool {
        self.lock().play_when_ready()
    }

    pub fn set_play_when_ready(&self, play: bool) {
        self.lock().set_play_when_ready(play);
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineStatus> {
        self.lock().subscribe()
    }

    /// Bind to `locator` and prepare, with play-when-ready off whatever the
    /// engine was configured with. The host turns playback on.
    pub(crate) fn bind(&self, locator: &ContentLocator) {
        let mut engine = self.lock();
        engine.set_play_when_ready(false);
        engine.set_content(locator.clone());
        engine.prepare();
    }

    /// Stop and unbind, ready for reuse.
    pub(crate) fn reset(&self) {
        let mut engine = self.lock();
        engine.stop();
        engine.clear_content();
    }

    pub(crate) fn release(&self) {
        let mut engine = self.lock();
        engine.stop();
        engine.clear_content();
        engine.release();
    }
}
