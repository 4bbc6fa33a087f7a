// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Read-through source for playback engines.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;

use super::ContentCache;
use crate::error::TransportError;
use crate::transport::Transport;
use crate::types::ContentLocator;

/// Engine-side view of the content cache.
///
/// Reads are served from the cache when the requested offset is cached and
/// otherwise streamed from the upstream transport. The reader never writes:
/// the download coordinator owns the cache's write path.
#[derive(Clone, Default)]
pub struct CacheReader {
    cache: Option<Arc<ContentCache>>,
    upstream: Option<Arc<dyn Transport>>,
}

impl std::fmt::Debug for CacheReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheReader")
            .field("cache", &self.cache.is_some())
            .field("upstream", &self.upstream.is_some())
            .finish()
    }
}

impl CacheReader {
    pub fn new(cache: Option<Arc<ContentCache>>, upstream: Option<Arc<dyn Transport>>) -> Self {
        Self { cache, upstream }
    }

    /// Read up to `len` bytes of `locator` starting at `offset`.
    ///
    /// A cache hit may be shorter than `len` when only part of the range is
    /// cached; the caller decides whether that is enough.
    pub async fn read(
        &self,
        locator: &ContentLocator,
        offset: u64,
        len: usize,
    ) -> Result<Bytes, TransportError> {
        if let Some(bytes) = self.cache.as_ref().and_then(|c| c.read(locator, offset, len)) {
            return Ok(bytes);
        }

        let Some(upstream) = &self.upstream else {
            return Err(TransportError::Request {
                locator: locator.clone(),
                message: "not cached and no upstream transport configured".to_string(),
            });
        };

        let mut body = upstream.open(locator, offset).await?;
        // Skip ahead when the source restarted from zero.
        let mut skip = offset.saturating_sub(body.start) as usize;
        let mut out = BytesMut::with_capacity(len);
        while out.len() < len {
            let Some(chunk) = body.chunks.next().await else {
                break;
            };
            let mut chunk = chunk?;
            if skip > 0 {
                let n = skip.min(chunk.len());
                let _ = chunk.split_to(n);
                skip -= n;
            }
            let take = (len - out.len()).min(chunk.len());
            out.extend_from_slice(&chunk[..take]);
        }
        Ok(out.freeze())
    }

    /// Read the first `len` bytes of `locator`, continuing past a partially
    /// cached prefix through the upstream transport.
    ///
    /// Shorter than `len` only when the content itself is shorter.
    pub async fn read_prefix(&self, locator: &ContentLocator, len: usize) -> Result<Bytes, TransportError> {
        let mut out = BytesMut::with_capacity(len);
        while out.len() < len {
            let offset = out.len() as u64;
            let at_end = self.cache.as_ref().is_some_and(|cache| {
                cache.is_complete(locator) && cache.cached_len(locator) <= offset
            });
            if at_end {
                break;
            }
            let bytes = self.read(locator, offset, len - out.len()).await?;
            if bytes.is_empty() {
                break;
            }
            out.extend_from_slice(&bytes);
        }
        Ok(out.freeze())
    }

    /// Whether the first `len` bytes of `locator` are already cached.
    pub fn is_prefix_cached(&self, locator: &ContentLocator, len: u64) -> bool {
        self.cache.as_ref().is_some_and(|cache| {
            cache.is_complete(locator) || cache.cached_len(locator) >= len
        })
    }
}
