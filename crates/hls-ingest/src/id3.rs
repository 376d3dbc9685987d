//! Minimal ID3v2 reader.
//!
//! Packed audio segments start with an ID3v2 tag whose `PRIV` frame owned by
//! `com.apple.streaming.transportStreamTimestamp` carries the 33-bit 90 kHz
//! timestamp of the first sample. Only what is needed to find that frame
//! and to skip the tag is parsed.

use crate::error::{IngestError, Result};

pub const ID3_HEADER_LEN: usize = 10;
pub const TIMESTAMP_OWNER: &[u8] = b"com.apple.streaming.transportStreamTimestamp";

const FLAG_UNSYNCHRONISATION: u8 = 0x80;
const FLAG_EXTENDED_HEADER: u8 = 0x40;
const FLAG_FOOTER: u8 = 0x10;

/// Decode a 28-bit syncsafe integer.
fn syncsafe(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < 4 || bytes[..4].iter().any(|b| b & 0x80 != 0) {
        return None;
    }
    Some(
        (usize::from(bytes[0]) << 21)
            | (usize::from(bytes[1]) << 14)
            | (usize::from(bytes[2]) << 7)
            | usize::from(bytes[3]),
    )
}

/// Parsed ID3v2 tag header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Id3Header {
    pub major_version: u8,
    pub flags: u8,
    /// Size of the tag body, excluding header and footer.
    pub size: usize,
}

impl Id3Header {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < ID3_HEADER_LEN || &data[..3] != b"ID3" {
            return None;
        }
        let major_version = data[3];
        if major_version == 0xFF || data[4] == 0xFF {
            return None;
        }
        Some(Self {
            major_version,
            flags: data[5],
            size: syncsafe(&data[6..10])?,
        })
    }

    /// Total bytes occupied by the tag, header and footer included.
    pub fn tag_len(&self) -> usize {
        let footer = if self.flags & FLAG_FOOTER != 0 {
            ID3_HEADER_LEN
        } else {
            0
        };
        ID3_HEADER_LEN + self.size + footer
    }
}

/// Length of the ID3 tag at the start of `data`, if there is one.
pub fn tag_len(data: &[u8]) -> Option<usize> {
    Id3Header::parse(data).map(|h| h.tag_len())
}

/// One frame of a tag body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Id3Frame<'a> {
    pub id: [u8; 4],
    pub data: &'a [u8],
}

/// Walk the frames of a complete tag starting at `data[0]`.
pub fn frames(data: &[u8]) -> Result<Vec<Id3Frame<'_>>> {
    let header = Id3Header::parse(data)
        .ok_or_else(|| IngestError::malformed("missing ID3v2 header"))?;
    if data.len() < header.tag_len() {
        return Err(IngestError::malformed(format!(
            "truncated ID3 tag: {} of {} bytes",
            data.len(),
            header.tag_len()
        )));
    }
    if header.flags & FLAG_UNSYNCHRONISATION != 0 {
        return Err(IngestError::malformed("unsynchronised ID3 tags are not supported"));
    }

    let body = &data[ID3_HEADER_LEN..ID3_HEADER_LEN + header.size];
    let mut pos = 0;
    if header.flags & FLAG_EXTENDED_HEADER != 0 && body.len() >= 4 {
        let ext = if header.major_version >= 4 {
            syncsafe(body).unwrap_or(body.len())
        } else {
            // v2.3 size excludes its own four bytes.
            u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize + 4
        };
        pos = ext.min(body.len());
    }

    let mut out = Vec::new();
    while pos + 10 <= body.len() {
        let id = [body[pos], body[pos + 1], body[pos + 2], body[pos + 3]];
        if id[0] == 0 {
            // Padding.
            break;
        }
        let size_bytes = &body[pos + 4..pos + 8];
        let size = if header.major_version >= 4 {
            syncsafe(size_bytes).ok_or_else(|| IngestError::malformed("bad ID3 frame size"))?
        } else {
            u32::from_be_bytes([size_bytes[0], size_bytes[1], size_bytes[2], size_bytes[3]])
                as usize
        };
        let start = pos + 10;
        let end = start
            .checked_add(size)
            .filter(|end| *end <= body.len())
            .ok_or_else(|| IngestError::malformed("ID3 frame overruns tag"))?;
        out.push(Id3Frame {
            id,
            data: &body[start..end],
        });
        pos = end;
    }
    Ok(out)
}

/// Timestamp from the transport stream timestamp `PRIV` frame, in 90 kHz
/// units (33 bits).
pub fn transport_stream_timestamp(data: &[u8]) -> Result<Option<u64>> {
    for frame in frames(data)? {
        if &frame.id != b"PRIV" {
            continue;
        }
        let Some(owner_end) = frame.data.iter().position(|b| *b == 0) else {
            continue;
        };
        if &frame.data[..owner_end] != TIMESTAMP_OWNER {
            continue;
        }
        let payload = &frame.data[owner_end + 1..];
        let Some(raw) = payload.get(..8) else {
            return Err(IngestError::malformed("short transport stream timestamp"));
        };
        let mut be = [0u8; 8];
        be.copy_from_slice(raw);
        return Ok(Some(u64::from_be_bytes(be) & 0x1_FFFF_FFFF));
    }
    Ok(None)
}
