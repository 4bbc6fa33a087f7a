// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Engine pool.
//!
//! Owns a fixed set of playback engines and binds them to feed slots. Every
//! engine is either idle (unbound, available) or in use (bound to exactly one
//! slot). All operations run under one mutex per pool and never wait for I/O:
//! binding an engine issues a fire-and-forget `prepare`.
//!
//! # Eviction
//!
//! When a slot needs an engine and none is idle, the in-use slot farthest
//! from the requested one gives up its engine. Feed position predicts the
//! next access better than recency does. On equal distance the larger slot
//! index is evicted.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use reelpool::config::{EngineConfig, PoolConfig};
//! use reelpool::engine::CachedEngineFactory;
//! use reelpool::pool::EnginePool;
//! use reelpool::types::ContentLocator;
//!
//! let pool = EnginePool::new(
//!     &PoolConfig::default(),
//!     EngineConfig::default(),
//!     Arc::new(CachedEngineFactory::default()),
//! );
//! let engine = pool.acquire_for_slot(0, &ContentLocator::from("https://cdn/0.mp4"));
//! engine.set_play_when_ready(true);
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::cache::ContentCache;
use crate::config::{EngineConfig, PoolConfig};
use crate::engine::{EngineFactory, EngineHandle, EngineId};
use crate::locks::resilient_lock;
use crate::types::{ContentLocator, SlotIndex};

/// Point-in-time pool membership counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    /// Engines created over the pool's lifetime, including those created
    /// under pressure.
    pub allocated: u64,
}

impl PoolStats {
    pub fn live(&self) -> usize {
        self.idle + self.in_use
    }
}

struct PoolState {
    idle: VecDeque<EngineHandle>,
    in_use: BTreeMap<SlotIndex, EngineHandle>,
    cache: Option<Arc<ContentCache>>,
    next_id: u64,
    allocated: u64,
}

/// Fixed-size pool of reusable playback engines keyed by slot.
pub struct EnginePool {
    pool_size: usize,
    engine_config: EngineConfig,
    factory: Arc<dyn EngineFactory>,
    state: Mutex<PoolState>,
}

impl std::fmt::Debug for EnginePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnginePool")
            .field("pool_size", &self.pool_size)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl EnginePool {
    /// Create a pool with its own content cache of `cache_size_bytes`.
    pub fn new(
        config: &PoolConfig,
        engine_config: EngineConfig,
        factory: Arc<dyn EngineFactory>,
    ) -> Self {
        let cache = Arc::new(ContentCache::new(config.cache_size_bytes));
        Self::with_cache(config, engine_config, Some(cache), factory)
    }

    /// Create a pool around an existing cache (or none).
    pub fn with_cache(
        config: &PoolConfig,
        engine_config: EngineConfig,
        cache: Option<Arc<ContentCache>>,
        factory: Arc<dyn EngineFactory>,
    ) -> Self {
        let mut state = PoolState {
            idle: VecDeque::with_capacity(config.pool_size),
            in_use: BTreeMap::new(),
            cache,
            next_id: 0,
            allocated: 0,
        };
        for _ in 0..config.pool_size {
            let engine = Self::allocate(&mut state, factory.as_ref(), &engine_config);
            state.idle.push_back(engine);
        }
        debug!("EnginePool created with {} engines", config.pool_size);

        Self {
            pool_size: config.pool_size,
            engine_config,
            factory,
            state: Mutex::new(state),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// The shared content cache, for handing to a download coordinator.
    /// `None` once the pool has been torn down.
    pub fn cache(&self) -> Option<Arc<ContentCache>> {
        resilient_lock(&self.state).cache.clone()
    }

    fn allocate(
        state: &mut PoolState,
        factory: &dyn EngineFactory,
        config: &EngineConfig,
    ) -> EngineHandle {
        let id = EngineId(state.next_id);
        state.next_id += 1;
        state.allocated += 1;
        EngineHandle::new(factory.create(id, config, state.cache.clone()))
    }

    /// Return the engine bound to `slot`, binding one if needed.
    ///
    /// Idempotent for an already-bound slot. Otherwise takes an idle engine,
    /// else evicts the farthest in-use slot, else allocates a new engine. The
    /// engine is bound and prepared with play-when-ready off; the host turns
    /// it on for the visible slot. Never fails.
    pub fn acquire_for_slot(&self, slot: SlotIndex, locator: &ContentLocator) -> EngineHandle {
        let mut state = resilient_lock(&self.state);

        if let Some(engine) = state.in_use.get(&slot) {
            return engine.clone();
        }

        let engine = match state.idle.pop_front() {
            Some(engine) => engine,
            None => match farthest_slot(state.in_use.keys().copied(), slot) {
                Some(victim) => match state.in_use.remove(&victim) {
                    Some(engine) => {
                        engine.reset();
                        debug!("Evicted slot {} ({}) for slot {}", victim, engine.id(), slot);
                        engine
                    }
                    None => Self::allocate(&mut state, self.factory.as_ref(), &self.engine_config),
                },
                None => {
                    let engine =
                        Self::allocate(&mut state, self.factory.as_ref(), &self.engine_config);
                    debug!("Pool exhausted, allocated {} for slot {}", engine.id(), slot);
                    engine
                }
            },
        };

        engine.bind(locator);
        state.in_use.insert(slot, engine.clone());
        debug!(
            "Pool state: {} in use, {} idle",
            state.in_use.len(),
            state.idle.len()
        );
        engine
    }

    /// Bind an idle engine to `slot` without evicting anything.
    ///
    /// No-op when the slot is already bound or no engine is idle. Returns
    /// whether an engine was bound. A preloaded engine never auto-plays.
    pub fn preload_slot(&self, slot: SlotIndex, locator: &ContentLocator) -> bool {
        let mut state = resilient_lock(&self.state);
        if state.in_use.contains_key(&slot) {
            return false;
        }
        let Some(engine) = state.idle.pop_front() else {
            return false;
        };
        engine.bind(locator);
        debug!("Preloaded slot {} on {}", slot, engine.id());
        state.in_use.insert(slot, engine);
        true
    }

    /// Stop the engine bound to `slot`, unbind it and return it to idle.
    ///
    /// Returns whether the slot was bound. Never cancels downloads.
    pub fn release_slot(&self, slot: SlotIndex) -> bool {
        let mut state = resilient_lock(&self.state);
        let Some(engine) = state.in_use.remove(&slot) else {
            return false;
        };
        engine.reset();
        debug!("Released slot {} ({})", slot, engine.id());
        state.idle.push_back(engine);
        true
    }

    /// Pure lookup of the engine bound to `slot`.
    pub fn engine_for_slot(&self, slot: SlotIndex) -> Option<EngineHandle> {
        resilient_lock(&self.state).in_use.get(&slot).cloned()
    }

    /// Destroy every engine and drop the pool's cache handle.
    ///
    /// When the pool held the last handle the cache itself is released; a
    /// cache still shared with a download coordinator is left alone. Cache
    /// release failures are logged, never returned. Safe to call repeatedly.
    pub fn release_all(&self) {
        let (engines, cache) = {
            let mut state = resilient_lock(&self.state);
            let mut engines: Vec<EngineHandle> = state.idle.drain(..).collect();
            engines.extend(std::mem::take(&mut state.in_use).into_values());
            (engines, state.cache.take())
        };

        if engines.is_empty() && cache.is_none() {
            return;
        }

        for engine in &engines {
            engine.release();
        }
        debug!("Released {} engines", engines.len());
        drop(engines);

        if let Some(cache) = cache {
            match Arc::into_inner(cache) {
                Some(cache) => {
                    if let Err(e) = cache.release() {
                        warn!("Failed to release content cache: {}", e);
                    }
                }
                None => debug!("Content cache still shared, dropped pool handle"),
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = resilient_lock(&self.state);
        PoolStats {
            idle: state.idle.len(),
            in_use: state.in_use.len(),
            allocated: state.allocated,
        }
    }

    /// Sorted snapshot of the bound slots.
    pub fn in_use_slots(&self) -> Vec<SlotIndex> {
        resilient_lock(&self.state).in_use.keys().copied().collect()
    }
}

impl Drop for EnginePool {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// The slot farthest from `target`; on equal distance, the larger index.
fn farthest_slot(slots: impl Iterator<Item = SlotIndex>, target: SlotIndex) -> Option<SlotIndex> {
    slots.max_by(|a, b| {
        a.abs_diff(target)
            .cmp(&b.abs_diff(target))
            .then(a.cmp(b))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CachedEngineFactory;

    fn loc(slot: SlotIndex) -> ContentLocator {
        ContentLocator::new(format!("mem://{}", slot))
    }

    fn pool(size: usize) -> EnginePool {
        let config = PoolConfig {
            pool_size: size,
            cache_size_bytes: 1024,
        };
        EnginePool::new(
            &config,
            EngineConfig::default(),
            Arc::new(CachedEngineFactory::default()),
        )
    }

    #[test]
    fn test_farthest_slot_prefers_distance_then_larger_index() {
        assert_eq!(farthest_slot([2, 5, 9].into_iter(), 3), Some(9));
        assert_eq!(farthest_slot([1, 5].into_iter(), 3), Some(5));
        assert_eq!(farthest_slot([0, 1].into_iter(), 9), Some(0));
        assert_eq!(farthest_slot(std::iter::empty(), 3), None);
    }

    #[test]
    fn test_acquire_is_idempotent() {
        let pool = pool(3);
        let a = pool.acquire_for_slot(4, &loc(4));
        let b = pool.acquire_for_slot(4, &loc(4));
        assert!(a.same_engine(&b));
        assert_eq!(pool.stats(), PoolStats { idle: 2, in_use: 1, allocated: 3 });
    }

    #[test]
    fn test_acquire_binds_without_autoplay() {
        let pool = pool(1);
        let engine = pool.acquire_for_slot(0, &loc(0));
        assert_eq!(engine.content(), Some(loc(0)));
        assert!(!engine.play_when_ready());
    }

    #[test]
    fn test_acquire_overrides_autoplay_config() {
        let config = PoolConfig {
            pool_size: 2,
            cache_size_bytes: 1024,
        };
        let engine_config = EngineConfig {
            play_when_ready: true,
            ..EngineConfig::default()
        };
        let pool = EnginePool::new(&config, engine_config, Arc::new(CachedEngineFactory::default()));

        let engine = pool.acquire_for_slot(0, &loc(0));
        assert!(!engine.play_when_ready());
        assert!(pool.preload_slot(1, &loc(1)));
        assert!(!pool.engine_for_slot(1).unwrap().play_when_ready());

        // A recycled engine that was playing starts paused on its new slot.
        engine.set_play_when_ready(true);
        pool.release_slot(0);
        let recycled = pool.acquire_for_slot(5, &loc(5));
        assert!(recycled.same_engine(&engine));
        assert!(!recycled.play_when_ready());
    }

    #[test]
    fn test_exhausted_acquire_evicts_farthest() {
        let pool = pool(3);
        for slot in [2, 5, 9] {
            pool.acquire_for_slot(slot, &loc(slot));
        }
        let evicted = pool.engine_for_slot(9).unwrap();

        let engine = pool.acquire_for_slot(3, &loc(3));
        assert!(engine.same_engine(&evicted));
        assert_eq!(pool.in_use_slots(), vec![2, 3, 5]);
        assert!(pool.engine_for_slot(9).is_none());
        assert_eq!(pool.stats().allocated, 3);
    }

    #[test]
    fn test_zero_sized_pool_allocates_on_demand() {
        let pool = pool(0);
        pool.acquire_for_slot(0, &loc(0));
        assert_eq!(pool.stats(), PoolStats { idle: 0, in_use: 1, allocated: 1 });
    }

    #[test]
    fn test_preload_never_evicts() {
        let pool = pool(1);
        pool.acquire_for_slot(0, &loc(0));
        assert!(!pool.preload_slot(1, &loc(1)));
        assert_eq!(pool.in_use_slots(), vec![0]);
        assert!(!pool.preload_slot(0, &loc(0)));
    }

    #[test]
    fn test_preloaded_engine_does_not_autoplay() {
        let pool = pool(2);
        let engine = pool.acquire_for_slot(0, &loc(0));
        engine.set_play_when_ready(true);
        pool.release_slot(0);

        assert!(pool.preload_slot(1, &loc(1)));
        assert!(pool.preload_slot(2, &loc(2)));
        for slot in [1, 2] {
            assert!(!pool.engine_for_slot(slot).unwrap().play_when_ready());
        }
    }

    #[test]
    fn test_release_slot_is_redundant_safe() {
        let pool = pool(2);
        pool.acquire_for_slot(3, &loc(3));
        assert!(pool.release_slot(3));
        assert!(!pool.release_slot(3));
        assert!(!pool.release_slot(42));
        assert_eq!(pool.stats(), PoolStats { idle: 2, in_use: 0, allocated: 2 });
    }

    #[test]
    fn test_released_engine_is_unbound() {
        let pool = pool(1);
        let engine = pool.acquire_for_slot(3, &loc(3));
        pool.release_slot(3);
        assert!(engine.content().is_none());
    }

    #[test]
    fn test_release_all_is_idempotent() {
        let pool = pool(3);
        pool.acquire_for_slot(0, &loc(0));
        pool.preload_slot(1, &loc(1));
        let cache = pool.cache().unwrap();

        pool.release_all();
        pool.release_all();

        assert!(pool.engine_for_slot(0).is_none());
        assert_eq!(pool.stats().live(), 0);
        assert!(pool.cache().is_none());
        // Someone else still holds the cache, so it was not released.
        assert!(!cache.is_released());
    }
}
