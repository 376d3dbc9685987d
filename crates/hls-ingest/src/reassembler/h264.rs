//! H.264 Annex-B access unit framing.

use bytes::{Bytes, BytesMut};
use expgolomb::{BitReader, rbsp_from_ebsp};
use h265::{NalUnit, nal_units};
use tracing::{debug, trace};

use super::{Framed, Scan};
use crate::error::Result;
use crate::format::{MIME_AVC, MediaFormat};

const NAL_SLICE: u8 = 1;
const NAL_IDR: u8 = 5;
const NAL_SEI: u8 = 6;
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;
const NAL_AUD: u8 = 9;

const START_CODE: &[u8] = &[0x00, 0x00, 0x00, 0x01];

/// `first_mb_in_slice` of a slice NAL unit.
fn first_mb_in_slice(nal: &[u8]) -> Option<u64> {
    let rbsp = rbsp_from_ebsp(nal.get(1..)?);
    BitReader::new(&rbsp).read_exp_golomb().ok()
}

/// Cut the next access unit from the front of `data`.
///
/// A unit ends where a new picture begins: a slice with
/// `first_mb_in_slice == 0`, or an AUD/SPS, once a slice has been seen.
/// Only NAL units followed by another start code count as complete, unless
/// the stream has ended.
pub(crate) fn scan(data: &[u8], eos: bool, need_format: bool) -> Result<Scan> {
    let mut units: Vec<NalUnit<'_>> = Vec::new();
    let mut found_slice = false;
    let mut flush_at = None;

    let mut iter = nal_units(data).peekable();
    while let Some(nal) = iter.next() {
        let complete = iter.peek().is_some() || eos;
        if !complete {
            break;
        }
        let Some(nal_type) = nal.avc_type() else {
            continue;
        };
        let starts_unit = match nal_type {
            NAL_SLICE | NAL_IDR => {
                let first_mb = first_mb_in_slice(nal.data).unwrap_or(0);
                let starts = first_mb == 0 && found_slice;
                if !starts {
                    found_slice = true;
                }
                starts
            }
            NAL_AUD | NAL_SPS => found_slice,
            _ => false,
        };
        if starts_unit {
            flush_at = Some(nal.start_code_offset);
            break;
        }
        units.push(nal);
        if eos && iter.peek().is_none() && !units.is_empty() {
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
    let mut sps: Option<&[u8]> = None;
    let mut pps: Option<&[u8]> = None;
    for nal in &units {
        out.extend_from_slice(START_CODE);
        let start = out.len();
        out.extend_from_slice(nal.data);
        match nal.avc_type() {
            Some(NAL_SEI) => sei.push(start..out.len()),
            Some(NAL_IDR) => is_sync = true,
            Some(NAL_SPS) => sps = sps.or(Some(nal.data)),
            Some(NAL_PPS) => pps = pps.or(Some(nal.data)),
            _ => {}
        }
    }

    let format = match (need_format, sps, pps) {
        (true, Some(sps), Some(pps)) => Some(make_format(sps, pps)),
        _ => None,
    };

    trace!(size = out.len(), nals = units.len(), is_sync, "H.264 access unit");
    Ok(Scan::Unit(Framed {
        data: out.freeze(),
        consumed,
        is_sync,
        sei,
        format,
        duration_us: None,
    }))
}

fn make_format(sps: &[u8], pps: &[u8]) -> MediaFormat {
    let format = match parse_sps_dimensions(sps) {
        Ok((width, height)) => MediaFormat::video(MIME_AVC, width, height),
        Err(e) => {
            debug!(error = %e, "Failed to decode H.264 SPS");
            MediaFormat::new(MIME_AVC)
        }
    };
    let csd = [sps, pps]
        .iter()
        .map(|nal| {
            let mut buf = BytesMut::with_capacity(nal.len() + 4);
            buf.extend_from_slice(START_CODE);
            buf.extend_from_slice(nal);
            buf.freeze()
        })
        .collect::<Vec<Bytes>>();
    format.with_csd(csd)
}

fn skip_scaling_list(reader: &mut BitReader<'_>, size: usize) -> std::io::Result<()> {
    let mut last = 8i64;
    let mut next = 8i64;
    for _ in 0..size {
        if next != 0 {
            let delta = reader.read_signed_exp_golomb()?;
            next = (last + delta + 256) % 256;
        }
        last = if next == 0 { last } else { next };
    }
    Ok(())
}

/// Display dimensions from an SPS NAL unit (header byte included).
pub(crate) fn parse_sps_dimensions(nal: &[u8]) -> std::io::Result<(u32, u32)> {
    let rbsp = rbsp_from_ebsp(nal.get(1..).unwrap_or_default());
    let mut r = BitReader::new(&rbsp);

    let profile_idc = r.read_u8()?;
    r.skip_bits(16)?; // constraint flags, level_idc
    r.read_exp_golomb()?; // seq_parameter_set_id

    let mut chroma_format_idc = 1u64;
    if matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        chroma_format_idc = r.read_exp_golomb()?;
        if chroma_format_idc == 3 {
            r.skip_bits(1)?; // separate_colour_plane_flag
        }
        r.read_exp_golomb()?; // bit_depth_luma_minus8
        r.read_exp_golomb()?; // bit_depth_chroma_minus8
        r.skip_bits(1)?; // qpprime_y_zero_transform_bypass_flag
        if r.read_bit()? {
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..lists {
                if r.read_bit()? {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    r.read_exp_golomb()?; // log2_max_frame_num_minus4
    match r.read_exp_golomb()? {
        0 => {
            r.read_exp_golomb()?; // log2_max_pic_order_cnt_lsb_minus4
        }
        1 => {
            r.skip_bits(1)?; // delta_pic_order_always_zero_flag
            r.read_signed_exp_golomb()?;
            r.read_signed_exp_golomb()?;
            let cycle = r.read_exp_golomb()?;
            for _ in 0..cycle {
                r.read_signed_exp_golomb()?;
            }
        }
        _ => {}
    }
    r.read_exp_golomb()?; // max_num_ref_frames
    r.skip_bits(1)?; // gaps_in_frame_num_value_allowed_flag

    let width_mbs = r.read_exp_golomb()?;
    let height_map_units = r.read_exp_golomb()?;
    let frame_mbs_only = r.read_bit()?;
    if !frame_mbs_only {
        r.skip_bits(1)?; // mb_adaptive_frame_field_flag
    }
    r.skip_bits(1)?; // direct_8x8_inference_flag

    let frame_height_factor = if frame_mbs_only { 1 } else { 2 };
    let mut width = width_mbs
        .checked_add(1)
        .and_then(|mbs| mbs.checked_mul(16))
        .ok_or_else(|| invalid_sps("pic_width_in_mbs_minus1"))?;
    let mut height = height_map_units
        .checked_add(1)
        .and_then(|units| units.checked_mul(16 * frame_height_factor))
        .ok_or_else(|| invalid_sps("pic_height_in_map_units_minus1"))?;

    if r.read_bit()? {
        let (left, right, top, bottom) = (
            r.read_exp_golomb()?,
            r.read_exp_golomb()?,
            r.read_exp_golomb()?,
            r.read_exp_golomb()?,
        );
        let (crop_x, crop_y) = if chroma_format_idc == 0 {
            (1, frame_height_factor)
        } else {
            let sub_width = if chroma_format_idc == 3 { 1 } else { 2 };
            let sub_height = if chroma_format_idc == 1 { 2 } else { 1 };
            (sub_width, sub_height * frame_height_factor)
        };
        let crop_w = left
            .checked_add(right)
            .and_then(|sum| sum.checked_mul(crop_x))
            .ok_or_else(|| invalid_sps("frame_crop_offset"))?;
        let crop_h = top
            .checked_add(bottom)
            .and_then(|sum| sum.checked_mul(crop_y))
            .ok_or_else(|| invalid_sps("frame_crop_offset"))?;
        width = width.saturating_sub(crop_w);
        height = height.saturating_sub(crop_h);
    }

    let width = u32::try_from(width).map_err(|_| invalid_sps("width"))?;
    let height = u32::try_from(height).map_err(|_| invalid_sps("height"))?;
    Ok((width, height))
}

fn invalid_sps(field: &str) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("SPS field {field} out of range"),
    )
}
