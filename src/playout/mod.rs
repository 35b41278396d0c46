//! Playout buffers
//!
//! A playout buffer sits between the session and the depacketizer. It
//! reorders packets and paces their release so that arrival jitter does not
//! reach the decoder. Every strategy compares media time in milliseconds,
//! `rtp_timestamp / (clock_rate / 1000)` over a timestamp unwrapped to 64
//! bits, so the 32-bit wrap does not stall the stream.

mod jitter_avoidance;
mod min_delay;
mod time_window;
mod tracer;

pub use jitter_avoidance::JitterAvoidanceBuffer;
pub use min_delay::MinDelayBuffer;
pub use time_window::TimeWindowBuffer;
pub use tracer::PacketTracer;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::{PlayoutConfig, PlayoutStrategy};
use crate::packet::DataPacket;
use crate::session::DataListener;

/// A reordering and pacing stage in front of a downstream listener
pub trait PlayoutBuffer: DataListener {
    /// Stop pacing; later packets are ignored
    fn stop(&self);

    fn stats(&self) -> PlayoutStats;
}

/// Playout counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlayoutStats {
    pub received: u64,
    pub emitted: u64,
    /// Packets behind the playout point
    pub dropped_late: u64,
    /// Packets of frames that never completed
    pub dropped_incomplete: u64,
    /// Times the buffer gave up waiting and restarted
    pub resets: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    received: AtomicU64,
    emitted: AtomicU64,
    dropped_late: AtomicU64,
    dropped_incomplete: AtomicU64,
    resets: AtomicU64,
}

impl Counters {
    pub(crate) fn received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn emitted(&self, count: usize) {
        self.emitted.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn dropped_late(&self, count: usize) {
        self.dropped_late.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn dropped_incomplete(&self, count: usize) {
        self.dropped_incomplete.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn reset(&self) {
        self.resets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> PlayoutStats {
        PlayoutStats {
            received: self.received.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            dropped_late: self.dropped_late.load(Ordering::Relaxed),
            dropped_incomplete: self.dropped_incomplete.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
        }
    }
}

/// Extends a wrapping RTP counter to 64 bits. The first value is taken as
/// is; every later value lands within half the counter range of the newest
/// one seen.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Unwrapper {
    bits: u32,
    /// Newest raw value and its extension
    newest: Option<(u32, i64)>,
}

impl Unwrapper {
    pub(crate) fn timestamps() -> Self {
        Self { bits: 32, newest: None }
    }

    pub(crate) fn sequences() -> Self {
        Self { bits: 16, newest: None }
    }

    pub(crate) fn extend(&mut self, raw: u32) -> i64 {
        let Some((newest_raw, newest)) = self.newest else {
            self.newest = Some((raw, raw as i64));
            return raw as i64;
        };
        let modulus = 1i64 << self.bits;
        let mut delta = (raw as i64 - newest_raw as i64).rem_euclid(modulus);
        if delta >= modulus / 2 {
            delta -= modulus;
        }
        let extended = newest + delta;
        if delta > 0 {
            self.newest = Some((raw, extended));
        }
        extended
    }
}

/// Media time in milliseconds over the unwrapped RTP timestamp
#[derive(Debug, Clone, Copy)]
pub(crate) struct MediaClock {
    ticks_per_ms: i64,
    timestamps: Unwrapper,
}

impl MediaClock {
    pub(crate) fn new(ticks_per_ms: u32) -> Self {
        Self {
            ticks_per_ms: ticks_per_ms.max(1) as i64,
            timestamps: Unwrapper::timestamps(),
        }
    }

    pub(crate) fn media_ms(&mut self, packet: &DataPacket) -> i64 {
        self.timestamps
            .extend(packet.timestamp())
            .div_euclid(self.ticks_per_ms)
    }
}

/// Build the buffer selected by `config.strategy`
pub fn create_buffer(
    config: &PlayoutConfig,
    downstream: Arc<dyn DataListener>,
    debug: bool,
) -> Arc<dyn PlayoutBuffer> {
    match config.strategy {
        PlayoutStrategy::MinDelay => {
            tracing::info!(
                "Using MinDelay playout with timeout = [{}ms]",
                config.min_delay_timeout_ms
            );
            Arc::new(MinDelayBuffer::new(config, downstream).with_debug(debug))
        }
        PlayoutStrategy::TimeWindow => {
            tracing::info!("Using TimeWindow playout with window = [{}ms]", config.window_ms);
            Arc::new(TimeWindowBuffer::new(config, downstream).with_debug(debug))
        }
        PlayoutStrategy::JitterAvoidance => {
            tracing::info!(
                "Using JitterAvoidance playout with frames window = [{}]",
                config.frames_window
            );
            Arc::new(JitterAvoidanceBuffer::new(config, downstream).with_debug(debug))
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use parking_lot::Mutex;

    use crate::packet::DataPacket;
    use crate::participant::ParticipantInfo;
    use crate::session::DataListener;

    /// Downstream that records what it is given
    #[derive(Default)]
    pub(crate) struct Sink {
        pub(crate) packets: Mutex<Vec<(std::time::Instant, DataPacket)>>,
    }

    impl Sink {
        pub(crate) fn sequences(&self) -> Vec<u16> {
            self.packets.lock().iter().map(|(_, p)| p.sequence_number()).collect()
        }
    }

    impl DataListener for Sink {
        fn data_packet_received(&self, _participant: &ParticipantInfo, packet: &DataPacket) {
            self.packets.lock().push((std::time::Instant::now(), packet.clone()));
        }
    }

    /// Packet with a media time of `media_ms` at 90 kHz
    pub(crate) fn packet(seq: u16, media_ms: u32) -> DataPacket {
        let mut packet = DataPacket::new(vec![0x65, seq as u8]);
        packet.set_sequence_number(seq);
        packet.set_timestamp(media_ms * 90);
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testing::{packet, Sink};

    #[test]
    fn test_media_time() {
        let mut clock = MediaClock::new(90);
        assert_eq!(clock.media_ms(&packet(1, 1234)), 1234);
        assert_eq!(clock.media_ms(&packet(2, 1200)), 1200);
    }

    #[test]
    fn test_media_time_continues_across_timestamp_wrap() {
        let mut clock = MediaClock::new(90);
        let mut before = packet(1, 0);
        before.set_timestamp(u32::MAX - 899);
        let mut after = packet(2, 0);
        after.set_timestamp(2700);

        let start = clock.media_ms(&before);
        assert_eq!(clock.media_ms(&after) - start, 40);
        // a straggler from before the wrap stays behind
        assert_eq!(clock.media_ms(&before), start);
    }

    #[test]
    fn test_sequences_unwrap_both_ways() {
        let mut seqs = Unwrapper::sequences();
        assert_eq!(seqs.extend(65534), 65534);
        assert_eq!(seqs.extend(0), 65536);
        assert_eq!(seqs.extend(65535), 65535);
        assert_eq!(seqs.extend(1), 65537);

        let mut seqs = Unwrapper::sequences();
        assert_eq!(seqs.extend(3), 3);
        assert_eq!(seqs.extend(65533), -3);
    }

    #[test]
    fn test_factory_selects_strategy() {
        let sink = Arc::new(Sink::default());
        for strategy in [
            PlayoutStrategy::MinDelay,
            PlayoutStrategy::TimeWindow,
            PlayoutStrategy::JitterAvoidance,
        ] {
            let config = PlayoutConfig {
                strategy,
                ..Default::default()
            };
            let buffer = create_buffer(&config, sink.clone(), false);
            assert_eq!(buffer.stats(), PlayoutStats::default());
            buffer.stop();
        }
    }
}
