use thiserror::Error;

#[derive(Error, Debug)]
pub enum H265Error {
    #[error("NAL unit too short: {0} bytes")]
    NalTooShort(usize),

    #[error("expected SPS NAL unit, found type {0}")]
    NotSps(u8),

    #[error("unsupported SPS field {field} = {value}")]
    Unsupported { field: &'static str, value: u64 },

    #[error("bitstream error: {0}")]
    Bitstream(#[from] std::io::Error),
}
