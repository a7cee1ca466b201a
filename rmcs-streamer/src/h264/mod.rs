//! Pure H.264 Annex-B / length-prefixed bitstream utilities.
//!
//! Nothing in this module holds state: every function takes its input by
//! reference and returns owned data. See `spec.md` §4.A.

mod emulation;
mod nal;
mod sei;

pub use emulation::encode_emulation_prevention;
pub use nal::{
    split_annex_b, split_auto, split_length_prefixed, to_annex_b, NalType, NalUnit,
    StreamingSplitter,
};
pub use sei::build_sei;
