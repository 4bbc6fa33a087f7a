// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Upstream content transport.
//!
//! A [`Transport`] opens a locator at a byte offset and yields its bytes as a
//! stream of chunks. The download coordinator writes those chunks into the
//! content cache; engines read through it on a cache miss.
//!
//! Two implementations ship with the crate:
//!
//! - [`HttpTransport`]: ranged `GET` over `reqwest`, used by the CLI host
//! - [`MemoryTransport`]: in-process content with fault injection, used by the
//!   `simulate` command and the test suites

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use tokio::sync::watch;

use crate::error::TransportError;
use crate::locks::{resilient_lock, resilient_read, resilient_write};
use crate::types::ContentLocator;

/// An opened transfer.
pub struct TransferBody {
    /// Offset of the first byte `chunks` yields. Zero when the source ignored
    /// the requested offset and restarted from the beginning.
    pub start: u64,
    /// Full length of the content, when the source reports it.
    pub total_len: Option<u64>,
    pub chunks: BoxStream<'static, Result<Bytes, TransportError>>,
}

impl std::fmt::Debug for TransferBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferBody")
            .field("start", &self.start)
            .field("total_len", &self.total_len)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open `locator` so that the first yielded byte is at `offset`, if the
    /// source supports it.
    async fn open(&self, locator: &ContentLocator, offset: u64)
        -> Result<TransferBody, TransportError>;
}

// =============================================================================
// HTTP
// =============================================================================

/// Ranged HTTP transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

/// Total length from a `Content-Range: bytes a-b/total` header.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}

/// How a response lines up with the requested offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeOutcome {
    /// A body whose first byte is at `start`.
    Body { start: u64, total_len: Option<u64> },
    /// The requested offset is already the end of the content.
    Exhausted,
    Rejected,
}

fn range_outcome(
    status: StatusCode,
    offset: u64,
    range_total: Option<u64>,
    content_length: Option<u64>,
) -> RangeOutcome {
    match status {
        StatusCode::PARTIAL_CONTENT => RangeOutcome::Body {
            start: offset,
            total_len: range_total.or_else(|| content_length.map(|len| len + offset)),
        },
        s if s.is_success() => RangeOutcome::Body {
            start: 0,
            total_len: content_length,
        },
        // `bytes */total` names the real length; any other total means the
        // cached prefix does not belong to this content.
        StatusCode::RANGE_NOT_SATISFIABLE
            if offset > 0 && range_total.is_none_or(|total| total == offset) =>
        {
            RangeOutcome::Exhausted
        }
        _ => RangeOutcome::Rejected,
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(
        &self,
        locator: &ContentLocator,
        offset: u64,
    ) -> Result<TransferBody, TransportError> {
        let mut request = self.client.get(locator.as_str());
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let response = request.send().await.map_err(|e| TransportError::Request {
            locator: locator.clone(),
            message: e.to_string(),
        })?;

        let status = response.status();
        let range_total = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total);

        let (start, total_len) =
            match range_outcome(status, offset, range_total, response.content_length()) {
                RangeOutcome::Body { start, total_len } => {
                    if start != offset {
                        tracing::debug!("{} ignored range request, restarting from zero", locator);
                    }
                    (start, total_len)
                }
                RangeOutcome::Exhausted => {
                    tracing::debug!("{} has no bytes past {}", locator, offset);
                    return Ok(TransferBody {
                        start: offset,
                        total_len: Some(offset),
                        chunks: stream::empty().boxed(),
                    });
                }
                RangeOutcome::Rejected => {
                    return Err(TransportError::Status {
                        locator: locator.clone(),
                        status: status.as_u16(),
                    })
                }
            };

        let stream_locator = locator.clone();
        let mut received = start;
        let chunks = response
            .bytes_stream()
            .map(move |chunk| match chunk {
                Ok(bytes) => {
                    received += bytes.len() as u64;
                    Ok(bytes)
                }
                Err(e) => Err(TransportError::Stream {
                    locator: stream_locator.clone(),
                    received,
                    message: e.to_string(),
                }),
            })
            .boxed();

        Ok(TransferBody {
            start,
            total_len,
            chunks,
        })
    }
}

// =============================================================================
// IN-MEMORY
// =============================================================================

/// In-process transport serving registered byte blobs.
///
/// Supports the knobs the pool and coordinator tests need: chunking, a
/// per-chunk delay, a gate that holds every stream before its first chunk,
/// per-locator holds at a byte offset, one-shot failures at a byte offset,
/// and bookkeeping of opens and of the peak number of concurrently
/// open streams.
pub struct MemoryTransport {
    items: RwLock<HashMap<ContentLocator, Bytes>>,
    chunk_size: usize,
    chunk_delay: Option<Duration>,
    faults: Mutex<HashMap<ContentLocator, u64>>,
    opens: Mutex<HashMap<ContentLocator, Vec<u64>>>,
    gate: watch::Sender<bool>,
    holds: watch::Sender<HashMap<ContentLocator, u64>>,
    open_streams: Arc<AtomicUsize>,
    peak_streams: Arc<AtomicUsize>,
}

impl MemoryTransport {
    pub fn new(chunk_size: usize) -> Self {
        let (gate, _) = watch::channel(true);
        let (holds, _) = watch::channel(HashMap::new());
        Self {
            items: RwLock::new(HashMap::new()),
            chunk_size: chunk_size.max(1),
            chunk_delay: None,
            faults: Mutex::new(HashMap::new()),
            opens: Mutex::new(HashMap::new()),
            gate,
            holds,
            open_streams: Arc::new(AtomicUsize::new(0)),
            peak_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub fn insert(&self, locator: impl Into<ContentLocator>, data: impl Into<Bytes>) {
        resilient_write(&self.items).insert(locator.into(), data.into());
    }

    /// Fail the next transfer of `locator` once it has delivered `at` bytes.
    pub fn fail_once_at(&self, locator: impl Into<ContentLocator>, at: u64) {
        resilient_lock(&self.faults).insert(locator.into(), at);
    }

    /// Hold every stream before its first chunk until [`MemoryTransport::open_gate`].
    pub fn close_gate(&self) {
        self.gate.send_replace(false);
    }

    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    /// Pause streams of `locator` once they have delivered `at` bytes, until
    /// [`MemoryTransport::release_hold`]. Holding at the content length keeps
    /// a stream open after its last chunk.
    pub fn hold_at(&self, locator: impl Into<ContentLocator>, at: u64) {
        let locator = locator.into();
        self.holds.send_modify(|holds| {
            holds.insert(locator, at);
        });
    }

    pub fn release_hold(&self, locator: &ContentLocator) {
        self.holds.send_modify(|holds| {
            holds.remove(locator);
        });
    }

    pub fn open_count(&self, locator: &ContentLocator) -> usize {
        resilient_lock(&self.opens).get(locator).map_or(0, Vec::len)
    }

    /// Offsets requested by every open of `locator`, in order.
    pub fn open_offsets(&self, locator: &ContentLocator) -> Vec<u64> {
        resilient_lock(&self.opens).get(locator).cloned().unwrap_or_default()
    }

    pub fn peak_concurrent_streams(&self) -> usize {
        self.peak_streams.load(Ordering::SeqCst)
    }
}

/// Decrements the open-stream counter when a stream is dropped.
struct StreamSlot(Arc<AtomicUsize>);

impl Drop for StreamSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MemoryStream {
    locator: ContentLocator,
    data: Bytes,
    pos: usize,
    chunk_size: usize,
    delay: Option<Duration>,
    fail_at: Option<usize>,
    gate: watch::Receiver<bool>,
    holds: watch::Receiver<HashMap<ContentLocator, u64>>,
    _slot: StreamSlot,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(
        &self,
        locator: &ContentLocator,
        offset: u64,
    ) -> Result<TransferBody, TransportError> {
        resilient_lock(&self.opens)
            .entry(locator.clone())
            .or_default()
            .push(offset);

        let data = resilient_read(&self.items).get(locator).cloned().ok_or_else(|| {
            TransportError::Status {
                locator: locator.clone(),
                status: 404,
            }
        })?;

        let total = data.len() as u64;
        if offset > total {
            return Err(TransportError::Status {
                locator: locator.clone(),
                status: 416,
            });
        }

        let fail_at = resilient_lock(&self.faults)
            .remove(locator)
            .map(|at| at as usize);

        let current = self.open_streams.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_streams.fetch_max(current, Ordering::SeqCst);

        let state = MemoryStream {
            locator: locator.clone(),
            data,
            pos: offset as usize,
            chunk_size: self.chunk_size,
            delay: self.chunk_delay,
            fail_at,
            gate: self.gate.subscribe(),
            holds: self.holds.subscribe(),
            _slot: StreamSlot(Arc::clone(&self.open_streams)),
        };

        let chunks = stream::unfold(state, |mut st| async move {
            loop {
                let pos = st.pos as u64;
                let held = st
                    .holds
                    .borrow_and_update()
                    .get(&st.locator)
                    .is_some_and(|at| pos >= *at);
                if !held || st.holds.changed().await.is_err() {
                    break;
                }
            }
            if st.pos >= st.data.len() {
                return None;
            }
            loop {
                let open = *st.gate.borrow_and_update();
                if open || st.gate.changed().await.is_err() {
                    break;
                }
            }
            if let Some(delay) = st.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(at) = st.fail_at {
                if st.pos >= at {
                    let received = st.pos as u64;
                    st.pos = st.data.len();
                    let err = TransportError::Stream {
                        locator: st.locator.clone(),
                        received,
                        message: "connection reset".to_string(),
                    };
                    return Some((Err(err), st));
                }
            }
            let mut end = (st.pos + st.chunk_size).min(st.data.len());
            if let Some(at) = st.fail_at {
                end = end.min(at.max(st.pos + 1));
            }
            let hold = st.holds.borrow().get(&st.locator).copied();
            if let Some(at) = hold.and_then(|at| usize::try_from(at).ok()) {
                if at > st.pos {
                    end = end.min(at);
                }
            }
            let chunk = st.data.slice(st.pos..end);
            st.pos = end;
            Some((Ok(chunk), st))
        })
        .boxed();

        Ok(TransferBody {
            start: offset,
            total_len: Some(total),
            chunks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    async fn collect(body: TransferBody) -> (Vec<u8>, Option<TransportError>) {
        let mut out = Vec::new();
        let mut chunks = body.chunks;
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(bytes) => out.extend_from_slice(&bytes),
                Err(e) => return (out, Some(e)),
            }
        }
        (out, None)
    }

    #[test]
    fn test_parse_content_range_total() {
        assert_eq!(parse_content_range_total("bytes 100-199/1000"), Some(1000));
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn test_range_outcome() {
        assert_eq!(
            range_outcome(StatusCode::PARTIAL_CONTENT, 40, Some(100), Some(60)),
            RangeOutcome::Body { start: 40, total_len: Some(100) }
        );
        assert_eq!(
            range_outcome(StatusCode::PARTIAL_CONTENT, 40, None, Some(60)),
            RangeOutcome::Body { start: 40, total_len: Some(100) }
        );
        assert_eq!(
            range_outcome(StatusCode::OK, 40, None, Some(100)),
            RangeOutcome::Body { start: 0, total_len: Some(100) }
        );
        assert_eq!(
            range_outcome(StatusCode::NOT_FOUND, 0, None, None),
            RangeOutcome::Rejected
        );
    }

    #[test]
    fn test_unsatisfiable_range_at_end_is_an_empty_body() {
        let status = StatusCode::RANGE_NOT_SATISFIABLE;
        assert_eq!(range_outcome(status, 100, Some(100), None), RangeOutcome::Exhausted);
        assert_eq!(range_outcome(status, 100, None, None), RangeOutcome::Exhausted);
        // Cached prefix longer than the remote content.
        assert_eq!(range_outcome(status, 120, Some(100), None), RangeOutcome::Rejected);
        assert_eq!(range_outcome(status, 0, None, None), RangeOutcome::Rejected);
    }

    #[tokio::test]
    async fn test_memory_transport_holds_at_offset() {
        let transport = MemoryTransport::new(4);
        let locator = ContentLocator::from("mem://held");
        transport.insert(locator.clone(), vec![1u8; 8]);
        transport.hold_at(locator.clone(), 3);

        let mut chunks = transport.open(&locator, 0).await.unwrap().chunks;
        assert_eq!(chunks.next().await.unwrap().unwrap().len(), 3);
        let paused = timeout(Duration::from_millis(20), chunks.next()).await;
        assert!(paused.is_err(), "stream continued while held");

        transport.release_hold(&locator);
        assert_eq!(chunks.next().await.unwrap().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_memory_transport_holds_stream_end() {
        let transport = MemoryTransport::new(4);
        let locator = ContentLocator::from("mem://held-end");
        transport.insert(locator.clone(), vec![1u8; 4]);
        transport.hold_at(locator.clone(), 4);

        let mut chunks = transport.open(&locator, 0).await.unwrap().chunks;
        assert_eq!(chunks.next().await.unwrap().unwrap().len(), 4);
        let end = timeout(Duration::from_millis(20), chunks.next()).await;
        assert!(end.is_err(), "stream ended while held");

        transport.release_hold(&locator);
        assert!(chunks.next().await.is_none());
    }

    #[tokio::test]
    async fn test_memory_transport_serves_from_offset() {
        let transport = MemoryTransport::new(3);
        let locator = ContentLocator::from("mem://a");
        transport.insert(locator.clone(), b"0123456789".to_vec());

        let body = transport.open(&locator, 4).await.unwrap();
        assert_eq!(body.start, 4);
        assert_eq!(body.total_len, Some(10));
        let (data, err) = collect(body).await;
        assert_eq!(data, b"456789");
        assert!(err.is_none());
        assert_eq!(transport.open_offsets(&locator), vec![4]);
    }

    #[tokio::test]
    async fn test_memory_transport_one_shot_fault() {
        let transport = MemoryTransport::new(4);
        let locator = ContentLocator::from("mem://b");
        transport.insert(locator.clone(), vec![7u8; 10]);
        transport.fail_once_at(locator.clone(), 6);

        let (data, err) = collect(transport.open(&locator, 0).await.unwrap()).await;
        assert_eq!(data.len(), 6);
        assert!(matches!(err, Some(TransportError::Stream { received: 6, .. })));

        let (data, err) = collect(transport.open(&locator, 6).await.unwrap()).await;
        assert_eq!(data.len(), 4);
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn test_memory_transport_unknown_locator_is_404() {
        let transport = MemoryTransport::new(4);
        let err = transport
            .open(&ContentLocator::from("mem://missing"), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Status { status: 404, .. }));
    }
}
