// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Race Detection Tests for reelpool
//!
//! These tests hammer the shared structures of reelpool from many tasks at
//! once. They are designed to detect data races when run with
//! ThreadSanitizer (TSAN).
//!
//! # Running with ThreadSanitizer
//!
//! ```bash
//! # On Linux with nightly Rust:
//! RUSTFLAGS="-Z sanitizer=thread" cargo +nightly test --target x86_64-unknown-linux-gnu --test race_detection_test
//!
//! # Or use cargo-careful for additional checks:
//! cargo install cargo-careful
//! cargo careful test --test race_detection_test
//! ```
//!
//! # Test Categories
//!
//! - Engine pool concurrent acquire/release
//! - Preload scheduler settle storms
//! - Content cache concurrent append/read under eviction
//! - Download coordinator request deduplication and removal races

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reelpool::cache::ContentCache;
use reelpool::config::{EngineConfig, PoolConfig};
use reelpool::download::{Callbacks, DownloadCoordinator, DownloadIndex, DownloadState};
use reelpool::engine::CachedEngineFactory;
use reelpool::pool::EnginePool;
use reelpool::scheduler::{PreloadPolicy, PreloadScheduler};
use reelpool::transport::{MemoryTransport, Transport};
use reelpool::types::{ContentLocator, Feed};
use tokio::time::timeout;

// Test configuration
const CONCURRENCY_LEVEL: usize = 100;
const ITERATIONS_PER_TASK: usize = 50;
const TEST_TIMEOUT_SECS: u64 = 30;
const POOL_SIZE: usize = 3;

fn locator(slot: usize) -> ContentLocator {
    ContentLocator::new(format!("mem://clip-{}", slot))
}

fn pool() -> Arc<EnginePool> {
    let config = PoolConfig {
        pool_size: POOL_SIZE,
        cache_size_bytes: 1 << 20,
    };
    Arc::new(EnginePool::new(
        &config,
        EngineConfig::default(),
        Arc::new(CachedEngineFactory::default()),
    ))
}

async fn join_all(handles: Vec<tokio::task::JoinHandle<()>>) {
    let result = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        for handle in handles {
            handle.await.expect("Task panicked");
        }
    })
    .await;

    assert!(result.is_ok(), "Test timed out");
}

// =============================================================================
// ENGINE POOL TESTS
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_concurrent_acquire_release() {
    let pool = pool();
    let acquires = Arc::new(AtomicU64::new(0));
    let mut handles = vec![];

    for i in 0..CONCURRENCY_LEVEL {
        let pool = pool.clone();
        let acquires = acquires.clone();
        handles.push(tokio::spawn(async move {
            for j in 0..ITERATIONS_PER_TASK {
                let slot = (i * 7 + j * 13) % 30;
                match j % 4 {
                    0 => {
                        pool.preload_slot(slot, &locator(slot));
                    }
                    1 => {
                        pool.release_slot(slot);
                    }
                    _ => {
                        pool.acquire_for_slot(slot, &locator(slot));
                        acquires.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }));
    }

    join_all(handles).await;

    let stats = pool.stats();
    println!(
        "Pool stats after {} acquires: {} in use, {} idle, {} allocated",
        acquires.load(Ordering::Relaxed),
        stats.in_use,
        stats.idle,
        stats.allocated
    );
    assert_eq!(stats.allocated, POOL_SIZE as u64);
    assert_eq!(stats.live(), POOL_SIZE);
    assert!(stats.in_use <= POOL_SIZE);

    // Every bound engine is distinct
    let engines: Vec<_> = pool
        .in_use_slots()
        .into_iter()
        .filter_map(|slot| pool.engine_for_slot(slot))
        .collect();
    for (a, engine) in engines.iter().enumerate() {
        for other in &engines[a + 1..] {
            assert!(!engine.same_engine(other));
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_release_all_during_acquires() {
    let pool = pool();
    let mut handles = vec![];

    for i in 0..CONCURRENCY_LEVEL {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            for j in 0..ITERATIONS_PER_TASK {
                let slot = (i + j) % 10;
                if i == 0 && j == ITERATIONS_PER_TASK / 2 {
                    pool.release_all();
                } else {
                    pool.acquire_for_slot(slot, &locator(slot));
                }
            }
        }));
    }

    join_all(handles).await;

    // Acquires after the teardown allocate fresh engines
    let stats = pool.stats();
    assert!(stats.in_use >= 1);
    pool.release_all();
    assert_eq!(pool.stats().live(), 0);
}

// =============================================================================
// PRELOAD SCHEDULER TESTS
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scheduler_settle_storm() {
    let pool = pool();
    let feed = Feed::new((0..20).map(|i| format!("mem://clip-{}", i)));
    let scheduler = Arc::new(PreloadScheduler::spawn(PreloadPolicy::new(pool.clone(), feed)));
    let mut handles = vec![];

    for i in 0..CONCURRENCY_LEVEL {
        let scheduler = scheduler.clone();
        handles.push(tokio::spawn(async move {
            for j in 0..ITERATIONS_PER_TASK {
                // Slot 10 is reserved for the final settle below.
                scheduler.settle((i * 3 + j) % 10);
                if j % 10 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }

    join_all(handles).await;

    let mut processed = scheduler.subscribe_processed();
    scheduler.settle(10);
    timeout(
        Duration::from_secs(TEST_TIMEOUT_SECS),
        processed.wait_for(|p| p.as_ref().is_some_and(|p| p.slot == 10)),
    )
    .await
    .expect("Test timed out")
    .expect("Scheduler stopped");

    assert_eq!(pool.in_use_slots(), vec![9, 10, 11]);
    assert_eq!(pool.stats().allocated, POOL_SIZE as u64);

    let scheduler = Arc::try_unwrap(scheduler).unwrap_or_else(|_| panic!("scheduler still shared"));
    scheduler.shutdown().await;
    assert_eq!(pool.stats().live(), 0);
}

// =============================================================================
// CONTENT CACHE TESTS
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cache_concurrent_append_read_under_eviction() {
    const ITEM: usize = 1024;
    const BUDGET: u64 = 16 * ITEM as u64;

    let cache = Arc::new(ContentCache::new(BUDGET));
    let mut handles = vec![];

    for i in 0..CONCURRENCY_LEVEL {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move {
            for j in 0..ITERATIONS_PER_TASK {
                let key = locator((i * ITERATIONS_PER_TASK + j) % 64);
                if j % 3 == 0 {
                    // Whole-item writes; an existing entry makes this a
                    // non-contiguous write, which is fine here.
                    if cache.cached_len(&key) == 0 {
                        let _ = cache.append(&key, 0, &[i as u8; ITEM]);
                    }
                } else if let Some(bytes) = cache.read(&key, 0, ITEM) {
                    assert!(bytes.len() <= ITEM);
                }
            }
        }));
    }

    join_all(handles).await;

    let stats = cache.stats();
    println!(
        "Cache stats: {} entries, {} bytes, {} hits, {} misses, {} evictions",
        stats.entries, stats.total_bytes, stats.hits, stats.misses, stats.evictions
    );
    assert!(stats.total_bytes <= BUDGET);
    assert!(stats.entries <= 16);
}

// =============================================================================
// DOWNLOAD COORDINATOR TESTS
// =============================================================================

fn coordinator(transport: &Arc<MemoryTransport>, max_parallel: usize) -> (Arc<ContentCache>, Arc<DownloadCoordinator>) {
    let cache = Arc::new(ContentCache::new(64 << 20));
    let transport: Arc<dyn Transport> = transport.clone();
    let coordinator = DownloadCoordinator::with_index(
        cache.clone(),
        transport,
        max_parallel,
        DownloadIndex::in_memory(),
    )
    .expect("coordinator");
    (cache, Arc::new(coordinator))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_coordinator_concurrent_requests_dedup() {
    let transport = Arc::new(MemoryTransport::new(256));
    let target = locator(0);
    transport.insert(target.clone(), vec![1u8; 8192]);
    transport.close_gate();

    let (cache, coordinator) = coordinator(&transport, 3);
    let completions = Arc::new(AtomicU64::new(0));
    let mut handles = vec![];

    for _ in 0..CONCURRENCY_LEVEL {
        let coordinator = coordinator.clone();
        let target = target.clone();
        let completions = completions.clone();
        handles.push(tokio::spawn(async move {
            let mut handle = coordinator.download(
                target,
                Callbacks::new().with_complete(move || {
                    completions.fetch_add(1, Ordering::SeqCst);
                }),
            );
            // Wait for the gate to open in the main task.
            let progress = handle.wait().await;
            assert_eq!(progress.state, DownloadState::Completed);
        }));
    }

    // Let every request attach before any bytes flow.
    tokio::time::sleep(Duration::from_millis(50)).await;
    transport.open_gate();
    join_all(handles).await;

    assert_eq!(transport.open_count(&target), 1);
    assert_eq!(completions.load(Ordering::SeqCst), CONCURRENCY_LEVEL as u64);
    assert!(cache.is_complete(&target));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_coordinator_download_remove_race() {
    let transport = Arc::new(MemoryTransport::new(64).with_chunk_delay(Duration::from_micros(200)));
    for slot in 0..8 {
        transport.insert(locator(slot), vec![slot as u8; 2048]);
    }

    let (cache, coordinator) = coordinator(&transport, 2);
    let mut handles = vec![];

    for i in 0..CONCURRENCY_LEVEL / 4 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            for j in 0..ITERATIONS_PER_TASK / 5 {
                let target = locator((i + j) % 8);
                match (i + j) % 3 {
                    0 => {
                        coordinator.prefetch(target);
                    }
                    1 => {
                        coordinator.stop(&target);
                    }
                    _ => {
                        coordinator.remove(&target);
                    }
                }
                tokio::task::yield_now().await;
            }
        }));
    }

    join_all(handles).await;

    // Whatever survived is internally consistent: bytes in the cache are
    // always a contiguous prefix of the source.
    for slot in 0..8 {
        let target = locator(slot);
        let cached = cache.cached_len(&target);
        if let Some(bytes) = cache.read(&target, 0, cached as usize) {
            assert!(bytes.iter().all(|b| *b == slot as u8));
        }
    }

    coordinator.remove_all();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(coordinator.records().is_empty());
    assert!(coordinator.active_downloads().is_empty());
    assert_eq!(cache.stats().entries, 0);
}
