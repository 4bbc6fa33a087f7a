// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download types for cache pre-fetching.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DownloadError;
use crate::types::ContentLocator;

/// Lifecycle state of one download request.
///
/// `Queued -> Downloading -> {Completed | Failed}`. `Failed` and `Stopped`
/// return to `Queued` on a fresh request, resuming from the cached bytes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    /// Waiting for a transfer slot
    Queued,
    /// Transfer running
    Downloading,
    /// Full content is in the cache
    Completed,
    /// Transfer failed; retried only on a fresh request
    Failed,
    /// Paused by the caller; bytes kept
    Stopped,
}

impl DownloadState {
    /// Returns true for states that end listener delivery.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadState::Completed | DownloadState::Failed)
    }

    /// Returns true while a transfer is queued or running.
    pub fn is_active(&self) -> bool {
        matches!(self, DownloadState::Queued | DownloadState::Downloading)
    }

    /// Returns true if a fresh request resumes from cached bytes.
    pub fn is_resumable(&self) -> bool {
        matches!(self, DownloadState::Failed | DownloadState::Stopped)
    }

    pub fn name(&self) -> &'static str {
        match self {
            DownloadState::Queued => "queued",
            DownloadState::Downloading => "downloading",
            DownloadState::Completed => "completed",
            DownloadState::Failed => "failed",
            DownloadState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for DownloadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Fraction of `total` covered by `bytes`, clamped to [0, 1].
pub(crate) fn fraction(bytes: u64, total: Option<u64>) -> f32 {
    match total {
        Some(0) => 1.0,
        Some(total) => (bytes as f64 / total as f64).clamp(0.0, 1.0) as f32,
        None => 0.0,
    }
}

/// Persisted record of one download request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadRecord {
    pub locator: ContentLocator,
    pub state: DownloadState,
    /// Bytes written to the cache so far
    pub bytes_downloaded: u64,
    /// Full length, once the source reported it
    pub content_length: Option<u64>,
    /// Last failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DownloadRecord {
    pub fn new(locator: ContentLocator) -> Self {
        let now = Utc::now();
        Self {
            locator,
            state: DownloadState::Queued,
            bytes_downloaded: 0,
            content_length: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Update the state and timestamp.
    pub fn update_state(&mut self, state: DownloadState) {
        self.state = state;
        self.updated_at = Utc::now();
    }

    pub fn fraction(&self) -> f32 {
        if self.state == DownloadState::Completed {
            return 1.0;
        }
        fraction(self.bytes_downloaded, self.content_length)
    }

    pub fn percent(&self) -> f32 {
        self.fraction() * 100.0
    }

    pub fn info(&self) -> DownloadInfo {
        DownloadInfo {
            state: self.state,
            percent: self.percent(),
            bytes_downloaded: self.bytes_downloaded,
            content_length: self.content_length,
        }
    }
}

/// Query result of `get_info`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownloadInfo {
    pub state: DownloadState,
    /// Progress in [0, 100]
    pub percent: f32,
    pub bytes_downloaded: u64,
    pub content_length: Option<u64>,
}

/// Progress snapshot delivered to listeners and handles.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadProgress {
    pub locator: ContentLocator,
    pub state: DownloadState,
    /// Progress in [0, 1]
    pub fraction: f32,
    pub bytes_downloaded: u64,
    pub content_length: Option<u64>,
    /// Set when `state` is `Failed`
    pub error: Option<DownloadError>,
}

impl DownloadProgress {
    pub fn from_record(record: &DownloadRecord, error: Option<DownloadError>) -> Self {
        Self {
            locator: record.locator.clone(),
            state: record.state,
            fraction: record.fraction(),
            bytes_downloaded: record.bytes_downloaded,
            content_length: record.content_length,
            error,
        }
    }

    /// Progress of content that is already complete.
    pub fn completed(locator: ContentLocator, bytes: u64) -> Self {
        Self {
            locator,
            state: DownloadState::Completed,
            fraction: 1.0,
            bytes_downloaded: bytes,
            content_length: Some(bytes),
            error: None,
        }
    }

    /// Human-readable byte count, e.g. `12.4 MB / 40.0 MB`.
    pub fn bytes_string(&self) -> String {
        match self.content_length {
            Some(total) => format!("{} / {}", format_bytes(self.bytes_downloaded), format_bytes(total)),
            None => format_bytes(self.bytes_downloaded),
        }
    }
}

/// Format a byte count with a binary unit.
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.1} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_classification() {
        assert!(DownloadState::Completed.is_terminal());
        assert!(DownloadState::Failed.is_terminal());
        assert!(!DownloadState::Stopped.is_terminal());
        assert!(DownloadState::Queued.is_active());
        assert!(DownloadState::Stopped.is_resumable());
        assert!(!DownloadState::Completed.is_resumable());
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&DownloadState::Downloading).unwrap();
        assert_eq!(json, "\"downloading\"");
    }

    #[test]
    fn test_fraction_is_clamped() {
        assert_eq!(fraction(5, Some(10)), 0.5);
        assert_eq!(fraction(15, Some(10)), 1.0);
        assert_eq!(fraction(0, Some(0)), 1.0);
        assert_eq!(fraction(7, None), 0.0);
    }

    #[test]
    fn test_record_info() {
        let mut record = DownloadRecord::new(ContentLocator::from("a"));
        record.bytes_downloaded = 25;
        record.content_length = Some(100);
        record.update_state(DownloadState::Downloading);

        let info = record.info();
        assert_eq!(info.state, DownloadState::Downloading);
        assert_eq!(info.percent, 25.0);

        record.update_state(DownloadState::Completed);
        assert_eq!(record.percent(), 100.0);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1_048_576), "5.0 MB");
    }
}
