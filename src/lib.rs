//! RTP/RTCP session stack with H.264 depacketization
//!
//! Provides:
//! - RTP and RTCP wire codec with compound packets
//! - Session state machine with automated RTCP, SSRC collision handling and
//!   single- or multi-participant membership
//! - H.264 (RFC 6184) depacketizer feeding a pluggable decoder
//! - Playout buffers that reorder and pace packets ahead of decoding

/// Per-packet diagnostics: `debug!` when the component runs in debug mode,
/// `trace!` otherwise
macro_rules! diag {
    ($debug:expr, $($arg:tt)+) => {
        if $debug {
            tracing::debug!($($arg)+)
        } else {
            tracing::trace!($($arg)+)
        }
    };
}

pub mod config;
pub mod constants;
pub mod error;
pub mod h264;
pub mod network;
pub mod packet;
pub mod participant;
pub mod playout;
pub mod session;

pub use error::{CodecError, DecoderError, Error, NetworkError, Result};
