// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for reelpool.
//!
//! Library errors are typed with `thiserror` so download listeners can match
//! on the failure kind. The binary and the persistence layer wrap them in
//! `anyhow` with context, and [`format_error`] renders the actionable form
//! shown to the user.

use thiserror::Error;

use crate::types::ContentLocator;

/// Failures of the shared content cache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The cache handle was released at pool teardown.
    #[error("content cache has been released")]
    Released,

    /// A write did not continue the bytes already cached for the locator.
    #[error("write for {locator} at offset {offset} does not continue cached length {cached}")]
    NonContiguousWrite {
        locator: ContentLocator,
        offset: u64,
        cached: u64,
    },

    /// The entry does not hold the bytes its writer delivered.
    #[error("cache entry for {locator} holds {cached} bytes, expected {expected}")]
    LengthMismatch {
        locator: ContentLocator,
        expected: u64,
        cached: u64,
    },

    /// The locator has no entry (never written, evicted or removed).
    #[error("no cache entry for {0}")]
    NotFound(ContentLocator),
}

/// Failures talking to the upstream content source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request for {locator} failed: {message}")]
    Request {
        locator: ContentLocator,
        message: String,
    },

    #[error("{locator} answered HTTP {status}")]
    Status { locator: ContentLocator, status: u16 },

    #[error("stream for {locator} broke after {received} bytes: {message}")]
    Stream {
        locator: ContentLocator,
        received: u64,
        message: String,
    },
}

/// Error delivered to `on_error` listeners when a transfer fails.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("download of {0} was cancelled")]
    Cancelled(ContentLocator),

    #[error("download coordinator has shut down")]
    ShutDown,
}

/// Formats an error message with title, causes and suggested fixes.
///
/// # Example
///
/// ```
/// use reelpool::error::format_error;
///
/// let error = format_error(
///     "Download failed",
///     &["Server refused the range request"],
///     &["Retry: reelpool download <url>"],
/// );
/// assert!(error.contains("Possible causes:"));
/// ```
pub fn format_error(title: &str, causes: &[&str], fixes: &[&str]) -> String {
    let mut output = format!("[✗] {}\n", title);

    if !causes.is_empty() {
        output.push_str("\nPossible causes:\n");
        for cause in causes {
            output.push_str(&format!("  - {}\n", cause));
        }
    }

    if !fixes.is_empty() {
        output.push_str("\nTry these fixes:\n");
        for (i, fix) in fixes.iter().enumerate() {
            output.push_str(&format!("  {}. {}\n", i + 1, fix));
        }
    }

    output
}

/// Actionable rendering of a download failure for the CLI host.
pub fn describe_download_error(locator: &ContentLocator, error: &DownloadError) -> String {
    let title = format!("Download of {} failed: {}", locator, error);
    match error {
        DownloadError::Transport(TransportError::Status { status, .. }) if *status == 416 => {
            format_error(
                &title,
                &["Cached partial bytes no longer match the remote file"],
                &[&format!("Discard and retry: reelpool remove {}", locator)],
            )
        }
        DownloadError::Transport(_) => format_error(
            &title,
            &["Network unreachable", "Server rejected the request"],
            &[&format!("Retry (resumes from cached bytes): reelpool download {}", locator)],
        ),
        DownloadError::Cache(_) => format_error(
            &title,
            &["Cache budget too small for this item"],
            &["Raise pool.cache_size_bytes: reelpool config show"],
        ),
        DownloadError::Cancelled(_) | DownloadError::ShutDown => format_error(&title, &[], &[]),
    }
}
