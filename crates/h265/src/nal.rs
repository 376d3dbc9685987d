use memchr::memmem;

/// HEVC NAL unit types (ITU-T H.265 Table 7-1) that the ingest path cares
/// about. Everything else is carried through as [`NalUnitType::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    /// Non-IRAP VCL slice (types 0..=9).
    Slice(u8),
    BlaWLp,
    BlaWRadl,
    BlaNLp,
    IdrWRadl,
    IdrNLp,
    Cra,
    /// Reserved IRAP types 22 and 23.
    ReservedIrap(u8),
    Vps,
    Sps,
    Pps,
    Aud,
    EndOfSequence,
    EndOfBitstream,
    FillerData,
    PrefixSei,
    SuffixSei,
    Other(u8),
}

impl From<u8> for NalUnitType {
    fn from(value: u8) -> Self {
        match value {
            0..=9 => NalUnitType::Slice(value),
            16 => NalUnitType::BlaWLp,
            17 => NalUnitType::BlaWRadl,
            18 => NalUnitType::BlaNLp,
            19 => NalUnitType::IdrWRadl,
            20 => NalUnitType::IdrNLp,
            21 => NalUnitType::Cra,
            22 | 23 => NalUnitType::ReservedIrap(value),
            32 => NalUnitType::Vps,
            33 => NalUnitType::Sps,
            34 => NalUnitType::Pps,
            35 => NalUnitType::Aud,
            36 => NalUnitType::EndOfSequence,
            37 => NalUnitType::EndOfBitstream,
            38 => NalUnitType::FillerData,
            39 => NalUnitType::PrefixSei,
            40 => NalUnitType::SuffixSei,
            other => NalUnitType::Other(other),
        }
    }
}

impl From<NalUnitType> for u8 {
    fn from(value: NalUnitType) -> Self {
        match value {
            NalUnitType::Slice(v) | NalUnitType::ReservedIrap(v) | NalUnitType::Other(v) => v,
            NalUnitType::BlaWLp => 16,
            NalUnitType::BlaWRadl => 17,
            NalUnitType::BlaNLp => 18,
            NalUnitType::IdrWRadl => 19,
            NalUnitType::IdrNLp => 20,
            NalUnitType::Cra => 21,
            NalUnitType::Vps => 32,
            NalUnitType::Sps => 33,
            NalUnitType::Pps => 34,
            NalUnitType::Aud => 35,
            NalUnitType::EndOfSequence => 36,
            NalUnitType::EndOfBitstream => 37,
            NalUnitType::FillerData => 38,
            NalUnitType::PrefixSei => 39,
            NalUnitType::SuffixSei => 40,
        }
    }
}

impl NalUnitType {
    /// Type carried in the first header byte of an HEVC NAL unit.
    pub fn from_header(first_byte: u8) -> Self {
        Self::from((first_byte >> 1) & 0x3F)
    }

    pub fn is_vcl(&self) -> bool {
        u8::from(*self) < 32
    }

    /// Intra random access point picture (BLA, IDR, CRA).
    pub fn is_irap(&self) -> bool {
        (16..=23).contains(&u8::from(*self))
    }

    pub fn is_parameter_set(&self) -> bool {
        matches!(self, NalUnitType::Vps | NalUnitType::Sps | NalUnitType::Pps)
    }
}

/// One NAL unit located inside an Annex-B buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalUnit<'a> {
    /// Offset of the start code that precedes this unit.
    pub start_code_offset: usize,
    /// Length of that start code (3 or 4).
    pub start_code_len: usize,
    /// NAL unit bytes including the NAL header, without start code.
    pub data: &'a [u8],
}

impl NalUnit<'_> {
    /// HEVC NAL unit type, `None` for an empty unit.
    pub fn hevc_type(&self) -> Option<NalUnitType> {
        self.data.first().map(|b| NalUnitType::from_header(*b))
    }

    /// H.264 `nal_unit_type` (low five bits of the header byte).
    pub fn avc_type(&self) -> Option<u8> {
        self.data.first().map(|b| b & 0x1F)
    }

    /// Offset one past the last byte of this unit in the source buffer.
    pub fn end_offset(&self) -> usize {
        self.start_code_offset + self.start_code_len + self.data.len()
    }
}

/// Find the next Annex-B start code at or after `from`.
///
/// Returns `(offset, len)` where `len` is 4 when the three-byte prefix is
/// preceded by an extra zero byte.
pub fn next_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let haystack = data.get(from..)?;
    let pos = memmem::find(haystack, &[0x00, 0x00, 0x01])? + from;
    if pos > from && data[pos - 1] == 0x00 {
        Some((pos - 1, 4))
    } else {
        Some((pos, 3))
    }
}

/// Iterate over every NAL unit of an Annex-B buffer.
///
/// Bytes before the first start code are skipped. The final unit runs to
/// the end of the buffer.
pub fn nal_units(data: &[u8]) -> impl Iterator<Item = NalUnit<'_>> {
    let mut cursor = next_start_code(data, 0);
    std::iter::from_fn(move || {
        let (offset, len) = cursor?;
        let payload_start = offset + len;
        let next = next_start_code(data, payload_start);
        let payload_end = next.map_or(data.len(), |(pos, _)| pos);
        cursor = next;
        Some(NalUnit {
            start_code_offset: offset,
            start_code_len: len,
            data: &data[payload_start..payload_end],
        })
    })
}

/// Locate the first HEVC NAL unit of type `nal_type`.
pub fn find_nal(data: &[u8], nal_type: NalUnitType) -> Option<NalUnit<'_>> {
    nal_units(data).find(|nal| nal.hevc_type() == Some(nal_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &[u8] = &[
        0x00, 0x00, 0x00, 0x01, 0x40, 0x01, 0xAA, // VPS
        0x00, 0x00, 0x01, 0x42, 0x01, 0xBB, 0xCC, // SPS
        0x00, 0x00, 0x01, 0x44, 0x01, 0xDD, // PPS
        0x00, 0x00, 0x01, 0x26, 0x01, 0xEE, // IDR_W_RADL
    ];

    #[test]
    fn iterates_units_with_mixed_start_codes() {
        let units: Vec<_> = nal_units(STREAM).collect();
        assert_eq!(units.len(), 4);
        assert_eq!(units[0].start_code_len, 4);
        assert_eq!(units[0].data, &[0x40, 0x01, 0xAA]);
        assert_eq!(units[1].start_code_len, 3);
        assert_eq!(units[1].hevc_type(), Some(NalUnitType::Sps));
        assert_eq!(units[3].hevc_type(), Some(NalUnitType::IdrWRadl));
        assert_eq!(units[3].end_offset(), STREAM.len());
    }

    #[test]
    fn find_nal_returns_requested_type() {
        let pps = find_nal(STREAM, NalUnitType::Pps).unwrap();
        assert_eq!(pps.data, &[0x44, 0x01, 0xDD]);
        assert_eq!(pps.start_code_offset, 14);
        assert!(find_nal(STREAM, NalUnitType::Aud).is_none());
    }

    #[test]
    fn classifies_types() {
        assert!(NalUnitType::IdrNLp.is_irap());
        assert!(NalUnitType::Cra.is_vcl());
        assert!(!NalUnitType::Sps.is_vcl());
        assert!(NalUnitType::Vps.is_parameter_set());
        assert_eq!(NalUnitType::from(u8::from(NalUnitType::PrefixSei)), NalUnitType::PrefixSei);
    }

    #[test]
    fn no_start_code_yields_nothing() {
        assert_eq!(nal_units(&[0x01, 0x02, 0x03]).count(), 0);
        assert!(next_start_code(&[0x00, 0x00], 0).is_none());
    }
}
