//! In-memory byte fetcher serving registered resources.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::StatusCode;
use url::Url;

use super::{ByteFetcher, FetchRequest, FetchResponse};
use crate::error::{IngestError, Result};

/// Body chunk size handed out by [`MemoryFetcher`].
const CHUNK_SIZE: usize = 4096;

#[derive(Debug, Default)]
struct State {
    resources: HashMap<String, Bytes>,
    /// Remaining injected body breaks per URL, as byte offsets.
    resets: HashMap<String, Vec<u64>>,
    /// Remaining refused connections per URL.
    refusals: HashMap<String, u32>,
    requests: Vec<FetchRequest>,
    latency: Duration,
}

/// Serves byte ranges out of memory. Useful for replaying captured streams
/// and for exercising the pipeline without a network.
///
/// Unknown URLs answer 404. Ranged requests answer 206.
#[derive(Debug, Clone, Default)]
pub struct MemoryFetcher {
    state: Arc<Mutex<State>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: &Url, data: impl Into<Bytes>) {
        self.state.lock().resources.insert(url.to_string(), data.into());
    }

    pub fn remove(&self, url: &Url) {
        self.state.lock().resources.remove(url.as_str());
    }

    /// Refuse the next `times` connections to `url`.
    pub fn refuse(&self, url: &Url, times: u32) {
        self.state.lock().refusals.insert(url.to_string(), times);
    }

    /// Break the next read of `url` after `offset` bytes of the body
    /// (counted from the start of the requested range).
    pub fn break_after(&self, url: &Url, offset: u64) {
        self.state
            .lock()
            .resets
            .entry(url.to_string())
            .or_default()
            .push(offset);
    }

    /// Delay every response by `latency`, giving transfers a measurable
    /// duration.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Every request seen so far.
    pub fn requests(&self) -> Vec<FetchRequest> {
        self.state.lock().requests.clone()
    }

    pub fn request_count(&self, url: &Url) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|request| request.url == *url)
            .count()
    }
}

#[async_trait]
impl ByteFetcher for MemoryFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        let key = request.url.to_string();
        let (status, body, break_at, latency) = {
            let mut state = self.state.lock();
            state.requests.push(request.clone());
            if let Some(left) = state.refusals.get_mut(&key).filter(|left| **left > 0) {
                *left -= 1;
                return Err(IngestError::cannot_connect(key, "connection refused"));
            }
            let Some(data) = state.resources.get(&key).cloned() else {
                return Err(IngestError::http_status(StatusCode::NOT_FOUND, key));
            };

            let (status, body) = match request.range {
                Some(range) => {
                    let first = usize::try_from(range.first).unwrap_or(usize::MAX).min(data.len());
                    let end = range
                        .last
                        .and_then(|last| usize::try_from(last).ok())
                        .map_or(data.len(), |last| last.saturating_add(1).min(data.len()));
                    (StatusCode::PARTIAL_CONTENT, data.slice(first..end.max(first)))
                }
                None => (StatusCode::OK, data),
            };

            let break_at = state
                .resets
                .get_mut(&key)
                .and_then(|offsets| (!offsets.is_empty()).then(|| offsets.remove(0)));
            (status, body, break_at, state.latency)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let content_length = Some(body.len() as u64);
        let mut chunks: Vec<Result<Bytes>> = Vec::new();
        let limit = break_at.map_or(body.len(), |at| (at as usize).min(body.len()));
        let mut pos = 0;
        while pos < limit {
            let end = (pos + CHUNK_SIZE).min(limit);
            chunks.push(Ok(body.slice(pos..end)));
            pos = end;
        }
        if break_at.is_some() {
            chunks.push(Err(IngestError::stream_reset(key, "connection reset")));
        }

        Ok(FetchResponse {
            status,
            content_length,
            final_url: request.url,
            body: futures::stream::iter(chunks).boxed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ByteRange;

    #[tokio::test]
    async fn serves_ranges_and_injected_breaks() {
        let url = Url::parse("memory://host/seg0.ts").unwrap();
        let fetcher = MemoryFetcher::new();
        fetcher.insert(&url, vec![7u8; 10_000]);
        fetcher.break_after(&url, 5000);

        let response = fetcher.fetch(FetchRequest::new(url.clone())).await.unwrap();
        let chunks: Vec<_> = response.body.collect().await;
        assert!(matches!(chunks.last(), Some(Err(IngestError::StreamReset { .. }))));
        let received: usize = chunks.iter().filter_map(|c| c.as_ref().ok()).map(Bytes::len).sum();
        assert_eq!(received, 5000);

        let ranged = fetcher
            .fetch(FetchRequest::new(url.clone()).with_range(Some(ByteRange::from_offset(5000))))
            .await
            .unwrap();
        assert_eq!(ranged.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(ranged.content_length, Some(5000));

        let missing = Url::parse("memory://host/missing.ts").unwrap();
        assert!(matches!(
            fetcher.fetch(FetchRequest::new(missing)).await,
            Err(IngestError::HttpStatus { .. })
        ));
        assert_eq!(fetcher.request_count(&url), 2);
    }

    #[tokio::test]
    async fn refusals_and_ranged_breaks_are_injected() {
        let url = Url::parse("memory://host/seg1.ts").unwrap();
        let fetcher = MemoryFetcher::new();
        fetcher.insert(&url, vec![3u8; 1000]);
        fetcher.refuse(&url, 2);
        fetcher.break_after(&url, 100);

        for _ in 0..2 {
            assert!(matches!(
                fetcher.fetch(FetchRequest::new(url.clone())).await,
                Err(IngestError::CannotConnect { .. })
            ));
        }
        let ranged = fetcher
            .fetch(FetchRequest::new(url.clone()).with_range(Some(ByteRange::from_offset(500))))
            .await
            .unwrap();
        let chunks: Vec<_> = ranged.body.collect().await;
        let received: usize = chunks.iter().filter_map(|c| c.as_ref().ok()).map(Bytes::len).sum();
        assert_eq!(received, 100);
        assert!(matches!(chunks.last(), Some(Err(IngestError::StreamReset { .. }))));

        let whole = fetcher.fetch(FetchRequest::new(url.clone())).await.unwrap();
        let chunks: Vec<_> = whole.body.collect().await;
        assert!(chunks.iter().all(Result::is_ok));
        assert_eq!(fetcher.request_count(&url), 4);
    }

    #[tokio::test]
    async fn delayed_fetch_runs_on_a_spawned_task() {
        let url = Url::parse("memory://host/slow.ts").unwrap();
        let fetcher = MemoryFetcher::new();
        fetcher.insert(&url, vec![1u8; 64]);
        fetcher.set_latency(std::time::Duration::from_millis(5));

        let spawned = fetcher.clone();
        let missing = Url::parse("memory://host/none.ts").unwrap();
        let (found, not_found) = tokio::spawn(async move {
            let found = spawned.fetch(FetchRequest::new(url)).await;
            let not_found = spawned.fetch(FetchRequest::new(missing)).await;
            (found.map(|r| r.content_length), not_found.is_err())
        })
        .await
        .unwrap();
        assert_eq!(found.unwrap(), Some(64));
        assert!(not_found);
    }
}
