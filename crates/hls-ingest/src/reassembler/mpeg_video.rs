//! MPEG-1/2 and MPEG-4 part 2 video framing.
//!
//! Both are start-code delimited. A unit ends when, after a picture (VOP)
//! has been seen, a start code that opens the next picture or header group
//! arrives.

use bytes::Bytes;
use h265::next_start_code;
use tracing::trace;

use super::{Framed, Scan};
use crate::error::Result;
use crate::format::{MIME_MPEG2_VIDEO, MIME_MPEG4_VIDEO, MediaFormat};

const PICTURE_START: u8 = 0x00;
const SEQUENCE_HEADER: u8 = 0xB3;
const GOP_START: u8 = 0xB8;
pub(crate) const MPEG2_SEQUENCE_END: u8 = 0xB7;

const VOS_START: u8 = 0xB0;
pub(crate) const VOS_END: u8 = 0xB1;
const GOV_START: u8 = 0xB3;
const VOP_START: u8 = 0xB6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MpegVideoKind {
    Mpeg2,
    Mpeg4,
}

impl MpegVideoKind {
    /// Whether `code` ends the current unit once a picture was seen.
    fn closes_unit(self, code: u8) -> bool {
        match self {
            Self::Mpeg2 => matches!(
                code,
                PICTURE_START | SEQUENCE_HEADER | GOP_START | MPEG2_SEQUENCE_END
            ),
            Self::Mpeg4 => matches!(code, VOS_START | VOS_END | GOV_START | VOP_START)
                || (0x20..=0x2F).contains(&code),
        }
    }

    fn is_picture(self, code: u8) -> bool {
        match self {
            Self::Mpeg2 => code == PICTURE_START,
            Self::Mpeg4 => code == VOP_START,
        }
    }

    /// Intra picture check on the bytes following a picture start code.
    fn is_intra(self, body: &[u8]) -> bool {
        match self {
            // temporal_reference(10) picture_coding_type(3)
            Self::Mpeg2 => body.get(1).is_some_and(|b| (b >> 3) & 0x07 == 1),
            // vop_coding_type(2)
            Self::Mpeg4 => body.first().is_some_and(|b| b >> 6 == 0),
        }
    }

    /// Marker appended by `signal_eos` so the final picture can be cut.
    pub fn end_marker(self) -> [u8; 4] {
        match self {
            Self::Mpeg2 => [0x00, 0x00, 0x01, MPEG2_SEQUENCE_END],
            Self::Mpeg4 => [0x00, 0x00, 0x01, VOS_END],
        }
    }
}

fn format_for(kind: MpegVideoKind, unit: &[u8]) -> Option<MediaFormat> {
    match kind {
        MpegVideoKind::Mpeg2 => {
            let mut from = 0;
            while let Some((pos, len)) = next_start_code(unit, from) {
                let body = &unit[pos + len..];
                if body.first() == Some(&SEQUENCE_HEADER) && body.len() >= 4 {
                    let width = (u32::from(body[1]) << 4) | u32::from(body[2] >> 4);
                    let height = (u32::from(body[2] & 0x0F) << 8) | u32::from(body[3]);
                    let csd_end = next_start_code(unit, pos + len + 1)
                        .map_or(unit.len(), |(next, _)| next);
                    return Some(
                        MediaFormat::video(MIME_MPEG2_VIDEO, width, height)
                            .with_csd(vec![Bytes::copy_from_slice(&unit[pos..csd_end])]),
                    );
                }
                from = pos + len;
            }
            None
        }
        MpegVideoKind::Mpeg4 => {
            // Configuration headers precede the first VOP.
            let mut from = 0;
            while let Some((pos, len)) = next_start_code(unit, from) {
                if unit.get(pos + len) == Some(&VOP_START) {
                    let csd = (pos > 0).then(|| vec![Bytes::copy_from_slice(&unit[..pos])]);
                    return Some(MediaFormat::new(MIME_MPEG4_VIDEO).with_csd(csd.unwrap_or_default()));
                }
                from = pos + len;
            }
            None
        }
    }
}

pub(crate) fn scan(
    kind: MpegVideoKind,
    data: &[u8],
    eos: bool,
    need_format: bool,
) -> Result<Scan> {
    let Some((first, _)) = next_start_code(data, 0) else {
        return Ok(if eos && !data.is_empty() {
            Scan::Skip(data.len())
        } else {
            Scan::NeedMore
        });
    };
    if first > 0 {
        return Ok(Scan::Skip(first));
    }

    let mut saw_picture = false;
    let mut is_sync = false;
    let mut from = 0;
    while let Some((pos, len)) = next_start_code(data, from) {
        let Some(&code) = data.get(pos + len) else {
            break;
        };
        if saw_picture && kind.closes_unit(code) {
            let unit = &data[..pos];
            let format = if need_format { format_for(kind, unit) } else { None };
            trace!(size = pos, is_sync, "MPEG video access unit");
            return Ok(Scan::Unit(Framed {
                data: Bytes::copy_from_slice(unit),
                consumed: pos,
                is_sync,
                sei: Vec::new(),
                format,
                duration_us: None,
            }));
        }
        if kind.is_picture(code) {
            saw_picture = true;
            is_sync = kind.is_intra(&data[pos + len + 1..]);
        }
        from = pos + len + 1;
    }

    if eos {
        // Nothing but headers or the end marker left.
        return Ok(Scan::Skip(data.len()));
    }
    Ok(Scan::NeedMore)
}
