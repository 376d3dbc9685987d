//! H.265 Annex-B access unit framing.

use bytes::{Bytes, BytesMut};
use h265::{NalUnit, NalUnitType, decode_sps, extract_parameter_sets, nal_units};
use tracing::{debug, trace};

use super::{Framed, Scan};
use crate::error::Result;
use crate::format::{MIME_HEVC, MediaFormat};

const START_CODE: &[u8] = &[0x00, 0x00, 0x00, 0x01];

fn first_slice_segment_in_pic(nal: &[u8]) -> bool {
    nal.get(2).is_some_and(|b| b & 0x80 != 0)
}

/// Whether `nal_type` opens a new access unit when a picture is already in
/// progress.
fn starts_unit(nal_type: NalUnitType, nal: &[u8]) -> bool {
    match nal_type {
        NalUnitType::Vps
        | NalUnitType::Sps
        | NalUnitType::Pps
        | NalUnitType::Aud
        | NalUnitType::PrefixSei => true,
        t if t.is_vcl() => first_slice_segment_in_pic(nal),
        _ => false,
    }
}

/// Cut the next access unit from the front of `data`.
pub(crate) fn scan(data: &[u8], eos: bool, need_format: bool) -> Result<Scan> {
    let mut units: Vec<NalUnit<'_>> = Vec::new();
    let mut picture_in_progress = false;
    let mut flush_at = None;

    let mut iter = nal_units(data).peekable();
    while let Some(nal) = iter.next() {
        let complete = iter.peek().is_some() || eos;
        if !complete {
            break;
        }
        let Some(nal_type) = nal.hevc_type() else {
            continue;
        };
        if picture_in_progress && starts_unit(nal_type, nal.data) {
            flush_at = Some(nal.start_code_offset);
            break;
        }
        if nal_type.is_vcl() {
            picture_in_progress = true;
        }
        units.push(nal);
        if eos && iter.peek().is_none() {
            flush_at = Some(data.len());
        }
    }

    let Some(consumed) = flush_at else {
        return Ok(Scan::NeedMore);
    };
    if units.is_empty() {
        return Ok(Scan::Skip(consumed));
    }

    let mut out = BytesMut::with_capacity(consumed + units.len());
    let mut sei = Vec::new();
    let mut is_sync = false;
    for nal in &units {
        out.extend_from_slice(START_CODE);
        let start = out.len();
        out.extend_from_slice(nal.data);
        match nal.hevc_type() {
            Some(NalUnitType::PrefixSei | NalUnitType::SuffixSei) => sei.push(start..out.len()),
            Some(t) if t.is_irap() => is_sync = true,
            _ => {}
        }
    }
    let data = out.freeze();

    let format = if need_format { make_format(&data) } else { None };
    trace!(size = data.len(), nals = units.len(), is_sync, "H.265 access unit");
    Ok(Scan::Unit(Framed {
        data,
        consumed,
        is_sync,
        sei,
        format,
        duration_us: None,
    }))
}

/// Format from the parameter sets carried by an access unit.
fn make_format(unit: &[u8]) -> Option<MediaFormat> {
    let sets = extract_parameter_sets(unit);
    let sps = sets
        .iter()
        .find(|nal| nal.hevc_type() == Some(NalUnitType::Sps))?;
    let info = match decode_sps(sps.data) {
        Ok(info) => info,
        Err(e) => {
            debug!(error = %e, "Failed to decode HEVC SPS");
            return None;
        }
    };
    let csd = sets
        .iter()
        .map(|nal| {
            let mut buf = BytesMut::with_capacity(nal.data.len() + 4);
            buf.extend_from_slice(START_CODE);
            buf.extend_from_slice(nal.data);
            buf.freeze()
        })
        .collect::<Vec<Bytes>>();
    Some(MediaFormat::video(MIME_HEVC, info.width, info.height).with_csd(csd))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nal(header: [u8; 2], body: &[u8]) -> Vec<u8> {
        let mut out = START_CODE.to_vec();
        out.extend_from_slice(&header);
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn splits_on_first_slice_and_parameter_sets() {
        let mut stream = Vec::new();
        stream.extend(nal([0x46, 0x01], &[0x10])); // AUD
        stream.extend(nal([0x26, 0x01], &[0xAF, 0x11])); // IDR, first slice
        stream.extend(nal([0x26, 0x01], &[0x2F, 0x12])); // IDR, dependent slice
        stream.extend(nal([0x50, 0x01], &[0x05, 0x13])); // suffix SEI
        stream.extend(nal([0x46, 0x01], &[0x10])); // AUD
        stream.extend(nal([0x02, 0x01], &[0xD0, 0x14])); // TRAIL_R

        let Scan::Unit(first) = scan(&stream, false, false).unwrap() else {
            panic!("expected a unit");
        };
        assert!(first.is_sync);
        assert_eq!(nal_units(&first.data).count(), 4);
        assert_eq!(first.sei.len(), 1);

        let rest = &stream[first.consumed..];
        let Scan::Unit(second) = scan(rest, true, false).unwrap() else {
            panic!("expected a unit");
        };
        assert!(!second.is_sync);
        assert_eq!(second.consumed, rest.len());
    }
}
