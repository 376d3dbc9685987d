use crate::nal::{NalUnit, NalUnitType, nal_units};

/// Length of the codec-specific-data prefix of an Annex-B buffer.
///
/// Counts the leading run of VPS/SPS/PPS units (start codes included) and
/// returns the offset at which the first other NAL unit begins, or the
/// whole length when the buffer holds nothing but parameter sets. Returns
/// `None` when the buffer does not open with a parameter set.
pub fn cast_specific_data(data: &[u8]) -> Option<usize> {
    let mut end = None;
    for nal in nal_units(data) {
        match nal.hevc_type() {
            Some(t) if t.is_parameter_set() => end = Some(nal.end_offset()),
            _ => return end.map(|_| nal.start_code_offset),
        }
    }
    end
}

/// Collect every VPS, SPS and PPS unit found anywhere in `data`, in order.
pub fn extract_parameter_sets(data: &[u8]) -> Vec<NalUnit<'_>> {
    nal_units(data)
        .filter(|nal| {
            matches!(
                nal.hevc_type(),
                Some(NalUnitType::Vps | NalUnitType::Sps | NalUnitType::Pps)
            )
        })
        .collect()
}
