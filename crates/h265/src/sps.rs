use expgolomb::{BitReader, rbsp_from_ebsp};

use crate::enums::NumTemporalLayers;
use crate::nal::{NalUnitType, next_start_code};
use crate::{H265Error, Result};

/// Fields of an HEVC sequence parameter set needed to describe the track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpsInfo {
    pub sps_id: u64,
    pub general_profile_idc: u8,
    pub general_level_idc: u8,
    pub chroma_format_idc: u64,
    pub bit_depth_luma: u8,
    pub bit_depth_chroma: u8,
    pub temporal_layers: NumTemporalLayers,
    /// Display width after the conformance window is applied.
    pub width: u32,
    /// Display height after the conformance window is applied.
    pub height: u32,
}

/// Decode an SPS NAL unit.
///
/// `nal` starts with the two-byte NAL header; a leading Annex-B start code
/// is tolerated and skipped.
pub fn decode_sps(nal: &[u8]) -> Result<SpsInfo> {
    let nal = match next_start_code(nal, 0) {
        Some((0, len)) => &nal[len..],
        _ => nal,
    };
    if nal.len() < 3 {
        return Err(H265Error::NalTooShort(nal.len()));
    }
    let nal_type = NalUnitType::from_header(nal[0]);
    if nal_type != NalUnitType::Sps {
        return Err(H265Error::NotSps(u8::from(nal_type)));
    }

    let rbsp = rbsp_from_ebsp(&nal[2..]);
    let mut r = BitReader::new(&rbsp);

    r.skip_bits(4)?; // sps_video_parameter_set_id
    let max_sub_layers_minus1 = r.read_bits(3)? as u8;
    r.skip_bits(1)?; // sps_temporal_id_nesting_flag

    let (general_profile_idc, general_level_idc) = skip_profile_tier_level(&mut r, max_sub_layers_minus1)?;

    let sps_id = r.read_exp_golomb()?;
    let chroma_format_idc = r.read_exp_golomb()?;
    if chroma_format_idc > 3 {
        return Err(H265Error::Unsupported {
            field: "chroma_format_idc",
            value: chroma_format_idc,
        });
    }
    let separate_colour_plane = chroma_format_idc == 3 && r.read_bit()?;

    let pic_width = r.read_exp_golomb()?;
    let pic_height = r.read_exp_golomb()?;

    let (mut crop_left, mut crop_right, mut crop_top, mut crop_bottom) = (0, 0, 0, 0);
    if r.read_bit()? {
        crop_left = r.read_exp_golomb()?;
        crop_right = r.read_exp_golomb()?;
        crop_top = r.read_exp_golomb()?;
        crop_bottom = r.read_exp_golomb()?;
    }

    let bit_depth_luma = bit_depth(r.read_exp_golomb()?, "bit_depth_luma_minus8")?;
    let bit_depth_chroma = bit_depth(r.read_exp_golomb()?, "bit_depth_chroma_minus8")?;

    // Conformance window offsets are in chroma sample units.
    let (sub_width, sub_height) = match (chroma_format_idc, separate_colour_plane) {
        (1, _) => (2, 2),
        (2, _) => (2, 1),
        _ => (1, 1),
    };
    let crop_w = crop_left
        .checked_add(crop_right)
        .and_then(|sum| sum.checked_mul(sub_width))
        .ok_or(H265Error::Unsupported {
            field: "conf_win_offset",
            value: crop_left.max(crop_right),
        })?;
    let crop_h = crop_top
        .checked_add(crop_bottom)
        .and_then(|sum| sum.checked_mul(sub_height))
        .ok_or(H265Error::Unsupported {
            field: "conf_win_offset",
            value: crop_top.max(crop_bottom),
        })?;
    let width = dimension(pic_width.saturating_sub(crop_w), "pic_width_in_luma_samples")?;
    let height = dimension(pic_height.saturating_sub(crop_h), "pic_height_in_luma_samples")?;

    Ok(SpsInfo {
        sps_id,
        general_profile_idc,
        general_level_idc,
        chroma_format_idc,
        bit_depth_luma,
        bit_depth_chroma,
        temporal_layers: NumTemporalLayers::from_max_sub_layers_minus1(max_sub_layers_minus1),
        width,
        height,
    })
}

fn bit_depth(minus8: u64, field: &'static str) -> Result<u8> {
    match u8::try_from(minus8) {
        Ok(v) if v <= 8 => Ok(v + 8),
        _ => Err(H265Error::Unsupported {
            field,
            value: minus8,
        }),
    }
}

fn dimension(value: u64, field: &'static str) -> Result<u32> {
    u32::try_from(value).map_err(|_| H265Error::Unsupported { field, value })
}

/// Walk `profile_tier_level(1, max_sub_layers_minus1)`, returning the
/// general profile and level.
fn skip_profile_tier_level(r: &mut BitReader<'_>, max_sub_layers_minus1: u8) -> Result<(u8, u8)> {
    r.skip_bits(2)?; // general_profile_space
    r.skip_bits(1)?; // general_tier_flag
    let profile_idc = r.read_bits(5)? as u8;
    r.skip_bits(32)?; // general_profile_compatibility_flags
    r.skip_bits(4)?; // progressive, interlaced, non_packed, frame_only
    r.skip_bits(44)?; // reserved / constraint flags
    let level_idc = r.read_bits(8)? as u8;

    let mut profile_present = [false; 8];
    let mut level_present = [false; 8];
    for i in 0..max_sub_layers_minus1 as usize {
        profile_present[i] = r.read_bit()?;
        level_present[i] = r.read_bit()?;
    }
    if max_sub_layers_minus1 > 0 {
        for _ in max_sub_layers_minus1..8 {
            r.skip_bits(2)?;
        }
    }
    for i in 0..max_sub_layers_minus1 as usize {
        if profile_present[i] {
            r.skip_bits(88)?;
        }
        if level_present[i] {
            r.skip_bits(8)?;
        }
    }
    Ok((profile_idc, level_idc))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[derive(Default)]
    pub(crate) struct BitWriter {
        bits: Vec<bool>,
    }

    impl BitWriter {
        pub(crate) fn bits(&mut self, value: u64, count: u8) -> &mut Self {
            for i in (0..count).rev() {
                self.bits.push((value >> i) & 1 == 1);
            }
            self
        }

        pub(crate) fn ue(&mut self, value: u64) -> &mut Self {
            let code = value + 1;
            let len = 64 - code.leading_zeros() as u8;
            self.bits(0, len - 1).bits(code, len)
        }

        /// Pack with rbsp trailing bits and emulation prevention.
        pub(crate) fn finish_ebsp(&mut self) -> Vec<u8> {
            self.bits.push(true);
            while self.bits.len() % 8 != 0 {
                self.bits.push(false);
            }
            let mut raw = vec![0u8; self.bits.len() / 8];
            for (i, bit) in self.bits.iter().enumerate() {
                if *bit {
                    raw[i / 8] |= 0x80 >> (i % 8);
                }
            }
            let mut out = Vec::new();
            let mut zeros = 0;
            for byte in raw {
                if zeros >= 2 && byte <= 3 {
                    out.push(0x03);
                    zeros = 0;
                }
                zeros = if byte == 0 { zeros + 1 } else { 0 };
                out.push(byte);
            }
            out
        }
    }

    /// Build an SPS NAL unit (header included) for a 4:2:0 picture.
    pub(crate) fn build_sps(coded_w: u64, coded_h: u64, crop_bottom: u64, sub_layers_minus1: u8) -> Vec<u8> {
        let mut w = BitWriter::default();
        w.bits(0, 4).bits(sub_layers_minus1 as u64, 3).bits(1, 1);
        w.bits(0, 2).bits(0, 1).bits(1, 5).bits(0x6000_0000, 32).bits(0b1001, 4);
        w.bits(0, 44).bits(93, 8);
        for _ in 0..sub_layers_minus1 {
            w.bits(0, 2);
        }
        if sub_layers_minus1 > 0 {
            for _ in sub_layers_minus1..8 {
                w.bits(0, 2);
            }
        }
        w.ue(0).ue(1).ue(coded_w).ue(coded_h);
        if crop_bottom > 0 {
            w.bits(1, 1).ue(0).ue(0).ue(0).ue(crop_bottom);
        } else {
            w.bits(0, 1);
        }
        w.ue(0).ue(0);
        let mut nal = vec![0x42, 0x01];
        nal.extend(w.finish_ebsp());
        nal
    }

    #[test]
    fn decodes_1080p_with_conformance_window() {
        let nal = build_sps(1920, 1088, 4, 0);
        let info = decode_sps(&nal).unwrap();
        assert_eq!(info.width, 1920);
        assert_eq!(info.height, 1080);
        assert_eq!(info.general_profile_idc, 1);
        assert_eq!(info.general_level_idc, 93);
        assert_eq!(info.bit_depth_luma, 8);
        assert_eq!(info.temporal_layers, NumTemporalLayers::NotScalable);
    }

    #[test]
    fn accepts_start_code_prefix_and_sub_layers() {
        let mut buf = vec![0x00, 0x00, 0x00, 0x01];
        buf.extend(build_sps(1280, 720, 0, 2));
        let info = decode_sps(&buf).unwrap();
        assert_eq!((info.width, info.height), (1280, 720));
        assert_eq!(info.temporal_layers.count(), 3);
    }

    #[test]
    fn out_of_range_fields_are_errors() {
        let err = decode_sps(&build_sps(1920, 1088, u64::MAX - 1, 0)).unwrap_err();
        assert!(matches!(
            err,
            H265Error::Unsupported {
                field: "conf_win_offset",
                ..
            }
        ));

        let err = decode_sps(&build_sps(1 << 33, 1088, 0, 0)).unwrap_err();
        assert!(matches!(
            err,
            H265Error::Unsupported {
                field: "pic_width_in_luma_samples",
                value,
            } if value == 1 << 33
        ));
    }

    #[test]
    fn rejects_non_sps() {
        let err = decode_sps(&[0x40, 0x01, 0x0C, 0x01]).unwrap_err();
        assert!(matches!(err, H265Error::NotSps(32)));
        assert!(matches!(decode_sps(&[0x42]), Err(H265Error::NalTooShort(1))));
    }
}
