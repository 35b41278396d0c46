//! H.264 depacketization

mod decoder;
mod depacketizer;
mod frame;
mod nal;

pub use decoder::{Decoder, SampleBuffer, StreamDecoder};
pub use depacketizer::{DepacketizerStats, H264Depacketizer};
pub use frame::Frame;
pub use nal::{NalHeader, NalKind, NAL_TYPE_FU_A, NAL_TYPE_STAP_A};
