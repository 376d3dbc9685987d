//! Single segment download: key prefetch, ranged GET with open retries and
//! block-wise decryption.

use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;
use reqwest::StatusCode;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::config::FetcherConfig;
use crate::decryption::{KeyFetcher, SegmentDecryptor, iv_for_sequence, parse_iv};
use crate::error::{FailurePoint, IngestError, Result};
use crate::net::{ByteFetcher, ByteRange, FetchRequest, FetchResponse, Retry, RetryOn};
use crate::playlist::SegmentItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SegmentStats {
    /// Bytes received from the network (ciphertext when encrypted).
    pub bytes: u64,
    pub elapsed: Duration,
}

/// Open a (ranged) GET. Failures before a response arrives are retried
/// until `open_failure_timeout` has passed since the first attempt.
pub(crate) async fn open(
    fetcher: &dyn ByteFetcher,
    config: &FetcherConfig,
    url: &Url,
    range: Option<ByteRange>,
    token: &CancellationToken,
) -> Result<FetchResponse> {
    let request = FetchRequest::new(url.clone()).with_range(range);
    Retry::new(&config.segment_retry, RetryOn::Open)
        .until(Instant::now() + config.open_failure_timeout)
        .run(token, |attempt| {
            let request = request.clone();
            async move {
                let result = fetcher.fetch(request).await;
                if let Err(e) = &result {
                    debug!(url = %url, attempt, error = %e, "Segment open failed");
                }
                result
            }
        })
        .await
}

/// Download one segment, handing plaintext to `on_block` in blocks of
/// `download_block_size` bytes.
///
/// The key is fetched before the segment body. Padding is validated only
/// once the whole segment has been received. A body that breaks off is
/// resumed once with a range request from the byte reached; a second break
/// surfaces as [`IngestError::StreamReset`].
pub(crate) async fn download_segment<F>(
    fetcher: &dyn ByteFetcher,
    keys: &KeyFetcher,
    config: &FetcherConfig,
    item: &SegmentItem,
    token: &CancellationToken,
    mut on_block: F,
) -> Result<SegmentStats>
where
    F: FnMut(&[u8]) -> Result<()>,
{
    let started = Instant::now();
    let mut decryptor = match &item.cipher {
        Some(cipher) => {
            let key = keys.key_for(&cipher.key_uri, token).await?;
            let iv = match &cipher.iv {
                Some(iv) => parse_iv(iv)?,
                None => iv_for_sequence(item.seq),
            };
            Some(SegmentDecryptor::new(&key, &iv)?)
        }
        None => None,
    };

    let block_size = config.download_block_size.max(1);
    let mut response = open(fetcher, config, &item.uri, item.byte_range, token).await?;
    let mut received = 0u64;
    let mut pending = BytesMut::with_capacity(block_size);
    let mut resumed = false;

    loop {
        let chunk = tokio::select! {
            _ = token.cancelled() => return Err(IngestError::Cancelled),
            chunk = response.body.next() => chunk,
        };
        match chunk {
            None => break,
            Some(Ok(chunk)) => {
                received += chunk.len() as u64;
                pending.extend_from_slice(&chunk);
                while pending.len() >= block_size {
                    let block = pending.split_to(block_size);
                    emit(&mut decryptor, &block, &mut on_block)?;
                }
            }
            Some(Err(err)) if !resumed && err.failure_point() == Some(FailurePoint::Body) => {
                resumed = true;
                let range = match item.byte_range {
                    Some(range) => range.advanced(received),
                    None => ByteRange::from_offset(received),
                };
                warn!(uri = %item.uri, seq = item.seq, received, error = %err, "Resuming interrupted segment");
                response = match open(fetcher, config, &item.uri, Some(range), token).await {
                    Ok(response) if response.status == StatusCode::PARTIAL_CONTENT => response,
                    Ok(_) | Err(_) => return Err(err),
                };
            }
            Some(Err(err)) => return Err(err),
        }
    }

    if !pending.is_empty() {
        emit(&mut decryptor, &pending, &mut on_block)?;
    }
    if let Some(decryptor) = decryptor {
        if received > 0 {
            let tail = decryptor.finish()?;
            if !tail.is_empty() {
                on_block(&tail)?;
            }
        }
    }

    Ok(SegmentStats {
        bytes: received,
        elapsed: started.elapsed(),
    })
}

fn emit<F>(decryptor: &mut Option<SegmentDecryptor>, data: &[u8], on_block: &mut F) -> Result<()>
where
    F: FnMut(&[u8]) -> Result<()>,
{
    match decryptor {
        Some(decryptor) => {
            let plain = decryptor.update(data);
            if plain.is_empty() {
                Ok(())
            } else {
                on_block(&plain)
            }
        }
        None => on_block(data),
    }
}
