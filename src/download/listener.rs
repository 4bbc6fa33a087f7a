// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Listener registration for download fan-out.

use super::types::DownloadProgress;
use crate::error::DownloadError;

/// Receives the transitions of one download request.
///
/// Every attached listener sees each progress transition. Exactly one of
/// `on_complete` / `on_error` fires, once, after which the listener is
/// detached. Listeners run on the transfer task and must not block.
pub trait DownloadListener: Send + Sync {
    fn on_progress(&self, _progress: &DownloadProgress) {}

    fn on_complete(&self, _progress: &DownloadProgress) {}

    fn on_error(&self, _error: &DownloadError) {}
}

type ProgressFn = Box<dyn Fn(f32) + Send + Sync>;
type CompleteFn = Box<dyn Fn() + Send + Sync>;
type ErrorFn = Box<dyn Fn(&DownloadError) + Send + Sync>;

/// Closure-based listener with every callback optional.
///
/// ```
/// use reelpool::download::Callbacks;
///
/// let callbacks = Callbacks::new()
///     .with_progress(|fraction| println!("{:.0}%", fraction * 100.0))
///     .with_complete(|| println!("done"));
/// assert!(!callbacks.is_empty());
/// ```
#[derive(Default)]
pub struct Callbacks {
    progress: Option<ProgressFn>,
    complete: Option<CompleteFn>,
    error: Option<ErrorFn>,
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("progress", &self.progress.is_some())
            .field("complete", &self.complete.is_some())
            .field("error", &self.error.is_some())
            .finish()
    }
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with the fraction in [0, 1] on every transition.
    pub fn with_progress(mut self, f: impl Fn(f32) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    pub fn with_complete(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.complete = Some(Box::new(f));
        self
    }

    pub fn with_error(mut self, f: impl Fn(&DownloadError) + Send + Sync + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.progress.is_none() && self.complete.is_none() && self.error.is_none()
    }
}

impl DownloadListener for Callbacks {
    fn on_progress(&self, progress: &DownloadProgress) {
        if let Some(f) = &self.progress {
            f(progress.fraction);
        }
    }

    fn on_complete(&self, _progress: &DownloadProgress) {
        if let Some(f) = &self.complete {
            f();
        }
    }

    fn on_error(&self, error: &DownloadError) {
        if let Some(f) = &self.error {
            f(error);
        }
    }
}
