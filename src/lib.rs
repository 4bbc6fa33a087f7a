// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! reelpool - playback plumbing for swipeable video feeds
//!
//! A feed shows one item at a time and the user swipes between neighbours.
//! reelpool keeps that smooth by reusing a small, fixed set of playback
//! engines and by pulling upcoming content into a shared cache before the
//! user reaches it:
//!
//! **Feed position** -> **Preload scheduler** -> **Engine pool** -> **Content cache** <- **Download coordinator**
//!
//! # Core Modules
//!
//! - [`pool`] - Fixed-size engine pool keyed by feed slot, farthest-slot eviction
//! - [`scheduler`] - Three-slot preload window driven by the settled position
//! - [`engine`] - Playback engine seam and the cache-backed engine
//! - [`cache`] - Shared LRU content cache with a byte budget
//! - [`download`] - Deduplicating, resumable, bounded-parallel downloads
//! - [`transport`] - Byte sources (HTTP and in-memory)
//! - [`config`] - Persistent configuration
//! - [`error`] - Error types and consistent error formatting

pub mod cache;
pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod locks;
pub mod pool;
pub mod scheduler;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use types::{ContentLocator, Feed, SlotIndex};

pub use cache::{CacheReader, CacheStats, ContentCache};
pub use config::{Config, DownloadConfig, EngineConfig, PoolConfig};
pub use download::{
    Callbacks, DownloadCoordinator, DownloadHandle, DownloadInfo, DownloadListener,
    DownloadProgress, DownloadState,
};
pub use engine::{
    CachedEngine, CachedEngineFactory, EngineFactory, EngineHandle, EngineId, EngineStatus,
    PlaybackEngine,
};
pub use error::{CacheError, DownloadError, TransportError};
pub use pool::{EnginePool, PoolStats};
pub use scheduler::{PreloadPolicy, PreloadScheduler, SettleReport};
pub use transport::{HttpTransport, MemoryTransport, Transport};
