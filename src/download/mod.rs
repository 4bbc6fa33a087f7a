// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Background download system for reelpool
//!
//! This module pre-fetches content into the shared cache ahead of playback:
//! - One transfer per locator, with listener fan-out for repeated requests
//! - Resumable downloads that continue from the cached bytes
//! - A bounded number of parallel transfers
//! - A persisted index so interrupted downloads survive restarts
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────┐     ┌─────────────────┐
//! │ DownloadCoordinator │────▶│ Transfer tasks  │
//! │                     │     │ (tokio, permit) │
//! └──────────┬──────────┘     └────────┬────────┘
//!            │                         │
//!            ▼                         ▼
//! ┌─────────────────────┐     ┌─────────────────┐
//! │ DownloadIndex       │     │ Transport  ───▶ │
//! │ (persistent)        │     │ ContentCache    │
//! └─────────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use reelpool::cache::ContentCache;
//! use reelpool::config::DownloadConfig;
//! use reelpool::download::{Callbacks, DownloadCoordinator};
//! use reelpool::transport::HttpTransport;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let cache = Arc::new(ContentCache::new(100 * 1024 * 1024));
//! let transport = Arc::new(HttpTransport::new(std::time::Duration::from_secs(300))?);
//! let coordinator = DownloadCoordinator::new(cache, transport, &DownloadConfig::default())?;
//!
//! let mut handle = coordinator.download(
//!     "https://cdn.example.com/clip.mp4",
//!     Callbacks::new().with_progress(|f| println!("{:.0}%", f * 100.0)),
//! );
//!
//! let final_progress = handle.wait().await;
//! println!("State: {}", final_progress.state);
//! # Ok(())
//! # }
//! ```

pub mod coordinator;
pub mod index;
pub mod listener;
pub mod types;

// Re-export commonly used items
pub use coordinator::{DownloadCoordinator, DownloadHandle};
pub use index::{DownloadIndex, StatusCounts};
pub use listener::{Callbacks, DownloadListener};
pub use types::{format_bytes, DownloadInfo, DownloadProgress, DownloadRecord, DownloadState};
