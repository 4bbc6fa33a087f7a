// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Preload scheduling driven by the settled slot.
//!
//! [`PreloadPolicy`] turns one settled slot `B` into pool operations, always
//! in this order:
//!
//! 1. release every in-use slot outside `{B-1, B, B+1}`
//! 2. preload `B-1` when it exists
//! 3. acquire `B`
//! 4. preload `B+1 ..= B+(pool_size-2)` that exist
//!
//! [`PreloadScheduler`] runs the policy on a single consumer task fed through
//! a `watch` channel. Slots settled while a step is running coalesce: only the
//! latest one is processed next, and a slot equal to the last processed one is
//! ignored. Dropping the channel tears the pool down.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::pool::EnginePool;
use crate::types::{Feed, SlotIndex};

/// Pool operations performed for one settled slot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SettleReport {
    pub slot: SlotIndex,
    pub released: Vec<SlotIndex>,
    /// Slots an idle engine was actually bound to.
    pub preloaded: Vec<SlotIndex>,
}

/// Window policy over one pool and one feed.
#[derive(Debug, Clone)]
pub struct PreloadPolicy {
    pool: Arc<EnginePool>,
    feed: Feed,
    pool_size: usize,
}

impl PreloadPolicy {
    pub fn new(pool: Arc<EnginePool>, feed: Feed) -> Self {
        let pool_size = pool.pool_size();
        Self {
            pool,
            feed,
            pool_size,
        }
    }

    pub fn pool(&self) -> &Arc<EnginePool> {
        &self.pool
    }

    pub fn feed(&self) -> &Feed {
        &self.feed
    }

    fn preload(&self, slot: SlotIndex, report: &mut SettleReport) {
        if let Some(locator) = self.feed.get(slot) {
            if self.pool.preload_slot(slot, locator) {
                report.preloaded.push(slot);
            }
        }
    }

    /// Preload slot 0 and, when present, slot 1.
    pub fn warm_start(&self) -> SettleReport {
        let mut report = SettleReport::default();
        self.preload(0, &mut report);
        self.preload(1, &mut report);
        report
    }

    /// Apply the window around `slot`. Returns `None` for a slot outside the
    /// feed, which is skipped without touching the pool.
    pub fn on_settled(&self, slot: SlotIndex) -> Option<SettleReport> {
        let locator = self.feed.get(slot)?;
        let mut report = SettleReport {
            slot,
            ..SettleReport::default()
        };

        let keep = slot.saturating_sub(1)..=slot.saturating_add(1);
        for bound in self.pool.in_use_slots() {
            if !keep.contains(&bound) && self.pool.release_slot(bound) {
                report.released.push(bound);
            }
        }

        if let Some(previous) = slot.checked_sub(1) {
            self.preload(previous, &mut report);
        }

        self.pool.acquire_for_slot(slot, locator);

        for ahead in 1..=self.pool_size.saturating_sub(2) {
            self.preload(slot + ahead, &mut report);
        }

        debug!(
            "Settled on slot {}: released {:?}, preloaded {:?}",
            slot, report.released, report.preloaded
        );
        Some(report)
    }

    /// Release every engine. Safe to call more than once.
    pub fn teardown(&self) {
        self.pool.release_all();
    }
}

/// Snapshot published after each processed settle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Processed {
    pub slot: SlotIndex,
    pub report: SettleReport,
}

/// Single-consumer task applying a [`PreloadPolicy`] to settled slots.
pub struct PreloadScheduler {
    settled: watch::Sender<Option<SlotIndex>>,
    processed: watch::Receiver<Option<Processed>>,
    task: JoinHandle<()>,
}

impl PreloadScheduler {
    /// Warm the pool and start the scheduling task on the current runtime.
    pub fn spawn(policy: PreloadPolicy) -> Self {
        let (settled, settled_rx) = watch::channel(None);
        let (processed_tx, processed) = watch::channel(None);

        policy.warm_start();
        let task = tokio::spawn(Self::run(policy, settled_rx, processed_tx));

        Self {
            settled,
            processed,
            task,
        }
    }

    async fn run(
        policy: PreloadPolicy,
        mut settled: watch::Receiver<Option<SlotIndex>>,
        processed: watch::Sender<Option<Processed>>,
    ) {
        let mut last = None;
        while settled.changed().await.is_ok() {
            let latest = *settled.borrow_and_update();
            let Some(slot) = latest else {
                continue;
            };
            if last == Some(slot) {
                continue;
            }
            last = Some(slot);

            match policy.on_settled(slot) {
                Some(report) => {
                    processed.send_replace(Some(Processed { slot, report }));
                }
                None => debug!("Ignoring settled slot {} outside feed", slot),
            }
        }

        debug!("Settled-slot stream closed, tearing down pool");
        policy.teardown();
    }

    /// Report the slot the viewer stopped on. Never blocks.
    pub fn settle(&self, slot: SlotIndex) {
        self.settled.send_replace(Some(slot));
    }

    /// Observe completed settle steps.
    pub fn subscribe_processed(&self) -> watch::Receiver<Option<Processed>> {
        self.processed.clone()
    }

    /// Stop the task and release every engine.
    pub async fn shutdown(self) {
        let Self { settled, task, .. } = self;
        drop(settled);
        if let Err(e) = task.await {
            warn!("Preload scheduler task ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, PoolConfig};
    use crate::engine::CachedEngineFactory;

    fn policy(pool_size: usize, feed_len: usize) -> PreloadPolicy {
        let config = PoolConfig {
            pool_size,
            cache_size_bytes: 1024,
        };
        let pool = Arc::new(EnginePool::new(
            &config,
            EngineConfig::default(),
            Arc::new(CachedEngineFactory::default()),
        ));
        let feed = Feed::new((0..feed_len).map(|i| format!("mem://{}", i)));
        PreloadPolicy::new(pool, feed)
    }

    #[test]
    fn test_warm_start_preloads_first_two() {
        let policy = policy(3, 10);
        let report = policy.warm_start();
        assert_eq!(report.preloaded, vec![0, 1]);
        assert_eq!(policy.pool().in_use_slots(), vec![0, 1]);
    }

    #[test]
    fn test_warm_start_single_item_feed() {
        let policy = policy(3, 1);
        policy.warm_start();
        assert_eq!(policy.pool().in_use_slots(), vec![0]);
    }

    #[test]
    fn test_forward_step_keeps_window() {
        let policy = policy(3, 10);
        policy.warm_start();
        policy.on_settled(0).unwrap();
        let report = policy.on_settled(1).unwrap();

        assert!(report.released.is_empty());
        assert_eq!(policy.pool().in_use_slots(), vec![0, 1, 2]);
    }

    #[test]
    fn test_jump_releases_outside_window_first() {
        let policy = policy(4, 10);
        policy.warm_start();
        policy.on_settled(0).unwrap();

        let report = policy.on_settled(5).unwrap();
        assert_eq!(report.released, vec![0, 1, 2]);
        assert_eq!(report.preloaded, vec![4, 6, 7]);
        assert_eq!(policy.pool().in_use_slots(), vec![4, 5, 6, 7]);
    }

    #[test]
    fn test_out_of_feed_slot_is_skipped() {
        let policy = policy(3, 3);
        policy.warm_start();
        assert!(policy.on_settled(3).is_none());
        assert_eq!(policy.pool().in_use_slots(), vec![0, 1]);
    }

    #[test]
    fn test_tail_of_feed_does_not_preload_past_end() {
        let policy = policy(4, 3);
        let report = policy.on_settled(2).unwrap();
        assert_eq!(report.preloaded, vec![1]);
        assert_eq!(policy.pool().in_use_slots(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_scheduler_processes_latest_and_tears_down() {
        let policy = policy(3, 10);
        let pool = Arc::clone(policy.pool());
        let scheduler = PreloadScheduler::spawn(policy);
        let mut processed = scheduler.subscribe_processed();

        scheduler.settle(3);
        processed
            .wait_for(|p| p.as_ref().is_some_and(|p| p.slot == 3))
            .await
            .unwrap();
        assert_eq!(pool.in_use_slots(), vec![2, 3, 4]);

        scheduler.shutdown().await;
        assert!(pool.in_use_slots().is_empty());
        assert_eq!(pool.stats().live(), 0);
    }
}
