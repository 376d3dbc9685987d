//! Byte fetching: the HTTP collaborator the fetchers download through.

mod http;
mod memory;
mod retry;

pub use http::{HttpByteFetcher, create_client};
pub use memory::MemoryFetcher;
pub use retry::{Retry, RetryOn, RetryPolicy};

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::trace;
use url::Url;

use crate::error::{IngestError, Result};

/// Inclusive byte range `first..=last`; `last == None` reads to the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub first: u64,
    pub last: Option<u64>,
}

impl ByteRange {
    pub fn new(offset: u64, length: u64) -> Self {
        Self {
            first: offset,
            last: Some(offset + length.saturating_sub(1)),
        }
    }

    pub fn from_offset(first: u64) -> Self {
        Self { first, last: None }
    }

    /// Value of the `Range` request header.
    pub fn header_value(&self) -> String {
        match self.last {
            Some(last) => format!("bytes={}-{}", self.first, last),
            None => format!("bytes={}-", self.first),
        }
    }

    /// Range that resumes this one after `consumed` bytes were read.
    pub fn advanced(&self, consumed: u64) -> Self {
        Self {
            first: self.first + consumed,
            last: self.last,
        }
    }

    pub fn len(&self) -> Option<u64> {
        self.last.map(|last| last + 1 - self.first)
    }
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: Url,
    pub range: Option<ByteRange>,
    pub timeout: Option<Duration>,
}

impl FetchRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            range: None,
            timeout: None,
        }
    }

    pub fn with_range(mut self, range: Option<ByteRange>) -> Self {
        self.range = range;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

pub struct FetchResponse {
    pub status: StatusCode,
    pub content_length: Option<u64>,
    /// URL after redirects.
    pub final_url: Url,
    pub body: BoxStream<'static, Result<Bytes>>,
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .field("final_url", &self.final_url.as_str())
            .finish_non_exhaustive()
    }
}

/// Performs (ranged) GET requests.
///
/// Implementations report transport failures before the response as
/// [`IngestError::CannotConnect`], non-success statuses as
/// [`IngestError::HttpStatus`] and failures while streaming the body as
/// [`IngestError::StreamReset`].
#[async_trait]
pub trait ByteFetcher: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse>;
}

/// Download a whole body into memory, retrying transient failures.
pub async fn fetch_all(
    fetcher: &dyn ByteFetcher,
    request: FetchRequest,
    policy: &RetryPolicy,
    token: &CancellationToken,
) -> Result<(Bytes, Url)> {
    Retry::new(policy, RetryOn::Any)
        .run(token, |attempt| {
            let request = request.clone();
            async move {
                trace!(url = %request.url, attempt, "Fetching resource");
                fetch_once(fetcher, request).await
            }
        })
        .await
}

async fn fetch_once(fetcher: &dyn ByteFetcher, request: FetchRequest) -> Result<(Bytes, Url)> {
    let response = fetcher.fetch(request).await?;
    let final_url = response.final_url;
    let mut body = response.body;
    let mut buffer = BytesMut::with_capacity(response.content_length.unwrap_or(0) as usize);
    while let Some(chunk) = body.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok((buffer.freeze(), final_url))
}
