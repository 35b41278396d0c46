//! Error types
//!
//! Codec failures never tear a session down: the boundary that detects
//! them logs and drops the offending packet. Transport failures surface
//! from `init()` and from explicit sends.

use thiserror::Error;

/// Malformed or out-of-range packet content
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("packet too short: need {needed} bytes, got {actual}")]
    TooShort { needed: usize, actual: usize },

    #[error("unsupported protocol version {0}")]
    InvalidVersion(u8),

    #[error("unknown RTCP packet type {0}")]
    UnknownPacketType(u8),

    #[error("invalid length: {0}")]
    InvalidLength(String),

    #[error("{what} runs past the end of the buffer")]
    Truncated { what: &'static str },

    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    #[error("{field} out of range: {value} (max {max})")]
    OutOfRange {
        field: &'static str,
        value: usize,
        max: usize,
    },

    #[error("{field} must be a non-negative multiple of 4, got {value}")]
    Misaligned { field: &'static str, value: usize },
}

/// Transport layer failures
#[derive(Debug, Clone, Error)]
pub enum NetworkError {
    #[error("bind failed: {0}")]
    BindFailed(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error("transport not bound")]
    NotBound,
}

/// Host decoder failures
#[derive(Debug, Clone, Error)]
pub enum DecoderError {
    #[error("no input buffer available: {0}")]
    BufferUnavailable(String),

    #[error("failed to submit sample: {0}")]
    SubmitFailed(String),
}

/// Crate-level error
#[derive(Debug, Error)]
pub enum Error {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("decoder error: {0}")]
    Decoder(#[from] DecoderError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
