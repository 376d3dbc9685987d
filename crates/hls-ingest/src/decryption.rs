// Segment decryption: key cache, key fetching and streaming AES-128-CBC.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aes::Aes128;
use bytes::{Bytes, BytesMut};
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::error::{IngestError, Result};
use crate::net::{ByteFetcher, FetchRequest, RetryPolicy, fetch_all};

type Aes128CbcDec = cbc::Decryptor<Aes128>;

pub const AES_BLOCK_SIZE: usize = 16;

/// Parse a manifest `IV` attribute (`0x` followed by up to 32 hex digits).
///
/// The value is a 128-bit big-endian number; shorter values are left
/// padded with zeros.
pub fn parse_iv(iv_hex: &str) -> Result<[u8; 16]> {
    let digits = iv_hex
        .strip_prefix("0x")
        .or_else(|| iv_hex.strip_prefix("0X"))
        .unwrap_or(iv_hex);
    if digits.is_empty() || digits.len() > 32 {
        return Err(IngestError::decryption(format!("invalid IV length in '{iv_hex}'")));
    }
    let padded = format!("{digits:0>32}");
    let mut iv = [0u8; 16];
    hex::decode_to_slice(&padded, &mut iv)
        .map_err(|e| IngestError::decryption(format!("failed to parse IV '{iv_hex}': {e}")))?;
    Ok(iv)
}

/// IV implied by a media sequence number when the key has no `IV`.
pub fn iv_for_sequence(seq: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&seq.to_be_bytes());
    iv
}

/// Validate and strip PKCS#7 padding from a fully decrypted segment.
pub fn strip_pkcs7_padding(data: &mut BytesMut) -> Result<()> {
    let pad = *data
        .last()
        .ok_or_else(|| IngestError::decryption("empty decrypted segment"))? as usize;
    if pad == 0 || pad > AES_BLOCK_SIZE || pad > data.len() {
        return Err(IngestError::decryption(format!("invalid padding length {pad}")));
    }
    if !data[data.len() - pad..].iter().all(|b| *b as usize == pad) {
        return Err(IngestError::decryption("inconsistent padding bytes"));
    }
    data.truncate(data.len() - pad);
    Ok(())
}

/// Decrypt a whole segment at once.
pub fn decrypt_segment(data: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Result<Bytes> {
    let cipher = Aes128CbcDec::new_from_slices(key, iv)
        .map_err(|e| IngestError::decryption(format!("failed to initialize AES decryptor: {e}")))?;
    let mut buffer = data.to_vec();
    let len = cipher
        .decrypt_padded_mut::<Pkcs7>(&mut buffer)
        .map_err(|e| IngestError::decryption(format!("decryption failed: {e}")))?
        .len();
    buffer.truncate(len);
    Ok(Bytes::from(buffer))
}

/// Incremental AES-128-CBC decryptor for one segment.
///
/// Input may arrive in arbitrary pieces; only whole 16-byte blocks are
/// decrypted and the chaining state carries across calls. The final
/// decrypted block is withheld until [`finish`](Self::finish) so padding is
/// only examined once the segment is complete.
pub struct SegmentDecryptor {
    cipher: Aes128CbcDec,
    partial: BytesMut,
    held: Option<[u8; AES_BLOCK_SIZE]>,
}

impl SegmentDecryptor {
    pub fn new(key: &[u8; 16], iv: &[u8; 16]) -> Result<Self> {
        let cipher = Aes128CbcDec::new_from_slices(key, iv).map_err(|e| {
            IngestError::decryption(format!("failed to initialize AES decryptor: {e}"))
        })?;
        Ok(Self {
            cipher,
            partial: BytesMut::new(),
            held: None,
        })
    }

    /// Feed ciphertext, returning whatever plaintext is now final.
    pub fn update(&mut self, data: &[u8]) -> Bytes {
        self.partial.extend_from_slice(data);
        let whole = self.partial.len() - self.partial.len() % AES_BLOCK_SIZE;
        if whole == 0 {
            return Bytes::new();
        }
        let mut blocks = self.partial.split_to(whole);
        for chunk in blocks.chunks_exact_mut(AES_BLOCK_SIZE) {
            self.cipher
                .decrypt_block_mut(GenericArray::from_mut_slice(chunk));
        }

        let mut out = BytesMut::with_capacity(whole);
        if let Some(previous) = self.held.take() {
            out.extend_from_slice(&previous);
        }
        let tail = blocks.split_off(whole - AES_BLOCK_SIZE);
        out.extend_from_slice(&blocks);
        let mut last = [0u8; AES_BLOCK_SIZE];
        last.copy_from_slice(&tail);
        self.held = Some(last);
        out.freeze()
    }

    /// Complete the segment: checks alignment and strips padding.
    pub fn finish(mut self) -> Result<Bytes> {
        if !self.partial.is_empty() {
            return Err(IngestError::decryption(format!(
                "ciphertext not block aligned ({} trailing bytes)",
                self.partial.len()
            )));
        }
        let Some(last) = self.held.take() else {
            return Err(IngestError::decryption("empty encrypted segment"));
        };
        let mut last = BytesMut::from(&last[..]);
        strip_pkcs7_padding(&mut last)?;
        Ok(last.freeze())
    }
}

/// Session-lifetime cache of AES keys by absolute key URI.
#[derive(Debug, Default)]
pub struct KeyCache {
    keys: RwLock<HashMap<String, [u8; 16]>>,
}

impl KeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, uri: &str) -> Option<[u8; 16]> {
        self.keys.read().get(uri).copied()
    }

    pub fn insert(&self, uri: impl Into<String>, key: [u8; 16]) {
        self.keys.write().insert(uri.into(), key);
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fetches keys through the byte fetcher, consulting the cache first.
pub struct KeyFetcher {
    fetcher: Arc<dyn ByteFetcher>,
    cache: Arc<KeyCache>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl KeyFetcher {
    pub fn new(
        fetcher: Arc<dyn ByteFetcher>,
        cache: Arc<KeyCache>,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            fetcher,
            cache,
            policy,
            timeout,
        }
    }

    pub async fn key_for(&self, uri: &Url, token: &CancellationToken) -> Result<[u8; 16]> {
        if let Some(key) = self.cache.get(uri.as_str()) {
            return Ok(key);
        }

        let request = FetchRequest::new(uri.clone()).with_timeout(self.timeout);
        let (bytes, _) = fetch_all(self.fetcher.as_ref(), request, &self.policy, token).await?;
        let key: [u8; 16] = bytes.as_ref().try_into().map_err(|_| {
            IngestError::decryption(format!(
                "key from {uri} has incorrect length: {} bytes (expected 16)",
                bytes.len()
            ))
        })?;
        debug!(uri = %uri, "Fetched decryption key");
        self.cache.insert(uri.as_str(), key);
        Ok(key)
    }
}
