//! Protocol constants and defaults

/// The only RTP/RTCP version on the wire
pub const RTP_VERSION: u8 = 2;

/// Fixed RTP header length
pub const RTP_HEADER_SIZE: usize = 12;

/// RTCP common header length
pub const RTCP_HEADER_SIZE: usize = 4;

/// Reception report block length
pub const REPORT_BLOCK_SIZE: usize = 24;

/// Largest value a 5-bit RTCP count field can carry
pub const MAX_RTCP_COUNT: usize = 31;

/// Highest valid payload type
pub const MAX_PAYLOAD_TYPE: u8 = 127;

/// RTCP packet type tags
pub const RTCP_SENDER_REPORT: u8 = 200;
pub const RTCP_RECEIVER_REPORT: u8 = 201;
pub const RTCP_SOURCE_DESCRIPTION: u8 = 202;
pub const RTCP_BYE: u8 = 203;
pub const RTCP_APP_DATA: u8 = 204;

/// Tool string announced in SDES packets
pub const TOOL_NAME: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

// Session defaults
pub const DEFAULT_BANDWIDTH_LIMIT: u32 = 256;
pub const DEFAULT_MAX_COLLISIONS: u32 = 3;
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_RTCP_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_TIMEOUT_NO_PACKETS_SECS: u64 = 60;
pub const DEFAULT_TIMEOUT_AFTER_BYE_SECS: u64 = 5;
pub const DEFAULT_UNKNOWN_SSRC_THRESHOLD: u32 = 50;

// Transport defaults
pub const DEFAULT_SEND_BUFFER_SIZE: usize = 1500;
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 1500;
pub const DEFAULT_DATA_PORT: u16 = 5006;
pub const DEFAULT_CONTROL_PORT: u16 = 5007;
pub const DEFAULT_PAYLOAD_TYPE: u8 = 96;

/// Largest datagram a receive thread reads
pub const MAX_DATAGRAM_SIZE: usize = 65_536;

// Playout defaults
pub const DEFAULT_WINDOW_MS: u64 = 500;
pub const DEFAULT_TICK_MS: u64 = 20;
pub const DEFAULT_MIN_DELAY_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_FRAMES_WINDOW: usize = 50;
pub const DEFAULT_FRAME_INTERVAL_MS: u64 = 28;
pub const DEFAULT_CLOCK_RATE: u32 = 90_000;

/// Annex-B start code written ahead of every NAL unit
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];
