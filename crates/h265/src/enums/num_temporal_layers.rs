/// Temporal layering advertised by an SPS.
///
/// Derived from `sps_max_sub_layers_minus1`; a single sub-layer means the
/// stream is not temporally scalable.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NumTemporalLayers {
    /// Only the base temporal layer is present.
    NotScalable,
    /// Number of temporal sub-layers (2..=7).
    Count(u8),
}

impl NumTemporalLayers {
    pub fn from_max_sub_layers_minus1(value: u8) -> Self {
        match value {
            0 => NumTemporalLayers::NotScalable,
            n => NumTemporalLayers::Count(n + 1),
        }
    }

    pub fn count(&self) -> u8 {
        match *self {
            NumTemporalLayers::NotScalable => 1,
            NumTemporalLayers::Count(count) => count,
        }
    }
}
