//! HEVC (H.265) bitstream helpers.
//!
//! Stateless functions over Annex-B byte slices:
//!
//! - [`find_nal`] locates the first NAL unit of a given type
//! - [`decode_sps`] extracts picture dimensions from a sequence parameter set
//! - [`cast_specific_data`] measures the VPS/SPS/PPS prefix of a buffer
//!
//! None of them take ownership of the input buffer.

mod csd;
mod enums;
mod error;
mod nal;
mod sps;

pub use csd::{cast_specific_data, extract_parameter_sets};
pub use enums::NumTemporalLayers;
pub use error::H265Error;
pub use nal::{NalUnit, NalUnitType, find_nal, nal_units, next_start_code};
pub use sps::{SpsInfo, decode_sps};

pub type Result<T> = std::result::Result<T, H265Error>;
