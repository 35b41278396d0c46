//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::*;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Raise per-packet diagnostics to debug level
    pub debug: bool,

    /// Write a per-packet arrival trace here
    pub trace_path: Option<PathBuf>,

    /// RTP session behaviour
    pub session: SessionConfig,

    /// Socket options
    pub transport: TransportConfig,

    /// Playout buffer selection and timing
    pub playout: PlayoutConfig,

    /// H.264 depacketizer options
    pub depacketizer: DepacketizerConfig,
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Drop data packets not newer than the last one from the same source
    pub discard_out_of_order: bool,

    /// Advisory bandwidth limit in kbit/s
    pub bandwidth_limit: u32,

    /// SSRC collisions tolerated before a loop is assumed
    pub max_collisions_before_considering_loop: u32,

    /// Session builds and consumes RTCP itself
    pub automated_rtcp_handling: bool,

    /// Apply every SDES chunk, not only the first one per participant
    pub try_to_update_on_every_sdes: bool,

    pub participant_database_cleanup_secs: u64,

    pub periodic_rtcp_interval_secs: u64,

    pub timeout_after_no_packets_secs: u64,

    pub timeout_after_bye_secs: u64,

    /// Single-peer sessions reply to wherever the peer last sent from
    pub send_to_last_origin: bool,

    /// Single-peer sessions drop packets from other sources
    pub ignore_from_unknown_ssrc: bool,

    /// Consecutive foreign packets before `SsrcChanged` is raised
    pub unknown_ssrc_threshold: u32,

    /// Items announced about the local participant
    pub sdes: SdesConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            discard_out_of_order: true,
            bandwidth_limit: DEFAULT_BANDWIDTH_LIMIT,
            max_collisions_before_considering_loop: DEFAULT_MAX_COLLISIONS,
            automated_rtcp_handling: true,
            try_to_update_on_every_sdes: true,
            participant_database_cleanup_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
            periodic_rtcp_interval_secs: DEFAULT_RTCP_INTERVAL_SECS,
            timeout_after_no_packets_secs: DEFAULT_TIMEOUT_NO_PACKETS_SECS,
            timeout_after_bye_secs: DEFAULT_TIMEOUT_AFTER_BYE_SECS,
            send_to_last_origin: true,
            ignore_from_unknown_ssrc: true,
            unknown_ssrc_threshold: DEFAULT_UNKNOWN_SSRC_THRESHOLD,
            sdes: SdesConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.participant_database_cleanup_secs)
    }

    pub fn rtcp_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_rtcp_interval_secs)
    }
}

/// Local SDES items. CNAME is derived from the session unless set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SdesConfig {
    pub cname: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub location: Option<String>,
    pub tool: String,
    pub note: Option<String>,
}

impl Default for SdesConfig {
    fn default() -> Self {
        Self {
            cname: None,
            name: None,
            email: None,
            phone: None,
            location: None,
            tool: TOOL_NAME.to_string(),
            note: None,
        }
    }
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Non-blocking sockets polled with backoff instead of blocking reads
    pub use_nio: bool,

    /// Socket send buffer size
    pub send_buffer_size: usize,

    /// Socket receive buffer size
    pub recv_buffer_size: usize,

    /// Enable SO_REUSEADDR
    pub reuse_addr: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            use_nio: true,
            send_buffer_size: DEFAULT_SEND_BUFFER_SIZE,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            reuse_addr: true,
        }
    }
}

/// Playout strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlayoutStrategy {
    /// Forward in-order packets immediately, wait out gaps up to a timeout
    MinDelay,
    /// Release packets a fixed window behind real time
    #[default]
    TimeWindow,
    /// Buffer whole frames and emit one per tick
    JitterAvoidance,
}

/// Playout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayoutConfig {
    pub strategy: PlayoutStrategy,

    /// Delay between arrival timeline and release (time-window)
    pub window_ms: u64,

    /// Pacing thread period (time-window)
    pub tick_ms: u64,

    /// Longest gap waited for before skipping (min-delay)
    pub min_delay_timeout_ms: u64,

    /// Frames buffered before consumption starts (jitter-avoidance)
    pub frames_window: usize,

    /// Target spacing between emitted frames (jitter-avoidance)
    pub frame_interval_ms: u64,

    /// Media clock rate in Hz
    pub clock_rate: u32,
}

impl Default for PlayoutConfig {
    fn default() -> Self {
        Self {
            strategy: PlayoutStrategy::default(),
            window_ms: DEFAULT_WINDOW_MS,
            tick_ms: DEFAULT_TICK_MS,
            min_delay_timeout_ms: DEFAULT_MIN_DELAY_TIMEOUT_MS,
            frames_window: DEFAULT_FRAMES_WINDOW,
            frame_interval_ms: DEFAULT_FRAME_INTERVAL_MS,
            clock_rate: DEFAULT_CLOCK_RATE,
        }
    }
}

impl PlayoutConfig {
    /// Units of the RTP clock per millisecond
    pub fn ticks_per_ms(&self) -> u32 {
        (self.clock_rate / 1000).max(1)
    }
}

/// Depacketizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DepacketizerConfig {
    /// Prefix every NAL unit with an Annex-B start code
    pub use_byte_stream_format: bool,
}

impl Default for DepacketizerConfig {
    fn default() -> Self {
        Self {
            use_byte_stream_format: true,
        }
    }
}

impl AppConfig {
    /// Load configuration from file
    pub fn load(path: &PathBuf) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        Ok(config)
    }

    /// Parse and validate TOML text
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| crate::Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &PathBuf) -> crate::Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "rtp-media-player", "rtp-media-player")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Reject values the pacing loops and sockets cannot work with
    pub fn validate(&self) -> crate::Result<()> {
        let checks = [
            (self.playout.tick_ms == 0, "playout.tick_ms must be positive"),
            (self.playout.clock_rate == 0, "playout.clock_rate must be positive"),
            (
                self.playout.frame_interval_ms == 0,
                "playout.frame_interval_ms must be positive",
            ),
            (
                self.transport.recv_buffer_size == 0,
                "transport.recv_buffer_size must be positive",
            ),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, msg)) => Err(crate::Error::Config(msg.to_string())),
            None => Ok(()),
        }
    }
}
