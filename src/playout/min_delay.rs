//! Minimum-delay playout: forward in order, wait out gaps up to a timeout

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{Counters, MediaClock, PlayoutBuffer, PlayoutStats};
use crate::config::PlayoutConfig;
use crate::packet::DataPacket;
use crate::participant::ParticipantInfo;
use crate::session::DataListener;

struct State {
    started: bool,
    next_expected: u16,
    last_forwarded_ms: i64,
    clock: MediaClock,
    pending: HashMap<u16, (ParticipantInfo, DataPacket)>,
}

impl State {
    fn new(ticks_per_ms: u32) -> Self {
        Self {
            started: false,
            next_expected: 0,
            last_forwarded_ms: 0,
            clock: MediaClock::new(ticks_per_ms),
            pending: HashMap::new(),
        }
    }
}

/// Forwards a packet as soon as it is the next expected one. Packets ahead
/// of a gap are held; when the stream moves more than the timeout past the
/// last forwarded packet the gap is given up on.
pub struct MinDelayBuffer {
    downstream: Arc<dyn DataListener>,
    timeout_ms: i64,
    debug: bool,
    state: Mutex<State>,
    stopped: AtomicBool,
    counters: Counters,
}

impl MinDelayBuffer {
    pub fn new(config: &PlayoutConfig, downstream: Arc<dyn DataListener>) -> Self {
        Self {
            downstream,
            timeout_ms: config.min_delay_timeout_ms as i64,
            debug: false,
            state: Mutex::new(State::new(config.ticks_per_ms())),
            stopped: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Packets held behind a gap
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Decide what to release for `packet`, under the lock
    fn accept(&self, participant: &ParticipantInfo, packet: &DataPacket) -> Vec<(ParticipantInfo, DataPacket)> {
        let mut state = self.state.lock();
        let seq = packet.sequence_number();
        let media_ms = state.clock.media_ms(packet);

        if !state.started {
            state.started = true;
            state.next_expected = seq;
            diag!(self.debug, "Stream started at #{}", seq);
        }

        let mut release = Vec::new();
        if seq == state.next_expected {
            release.push((participant.clone(), packet.clone()));
            state.last_forwarded_ms = media_ms;
            state.next_expected = seq.wrapping_add(1);

            // now-contiguous successors
            loop {
                let next = state.next_expected;
                let Some((info, held)) = state.pending.remove(&next) else {
                    break;
                };
                diag!(self.debug, "Sending old buffered packet. #{}", next);
                state.last_forwarded_ms = state.clock.media_ms(&held);
                state.next_expected = next.wrapping_add(1);
                release.push((info, held));
            }
            return release;
        }

        if (seq.wrapping_sub(state.next_expected) as i16) < 0 {
            self.counters.dropped_late(1);
            diag!(self.debug, "Discarded late packet #{} (expecting #{})", seq, state.next_expected);
            return release;
        }

        if media_ms - state.last_forwarded_ms > self.timeout_ms {
            diag!(self.debug, "Out of order packets are getting too old. Resetting");
            self.counters.reset();
            self.counters.dropped_late(state.pending.len());
            state.pending.clear();
            state.last_forwarded_ms = media_ms;
            state.next_expected = seq.wrapping_add(1);
            release.push((participant.clone(), packet.clone()));
        } else {
            diag!(self.debug, "Saving out of order packet. #{}", seq);
            state.pending.insert(seq, (participant.clone(), packet.clone()));
        }
        release
    }
}

impl DataListener for MinDelayBuffer {
    fn data_packet_received(&self, participant: &ParticipantInfo, packet: &DataPacket) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.counters.received();

        let release = self.accept(participant, packet);
        self.counters.emitted(release.len());
        for (info, packet) in &release {
            self.downstream.data_packet_received(info, packet);
        }
    }
}

impl PlayoutBuffer for MinDelayBuffer {
    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.state.lock().pending.clear();
    }

    fn stats(&self) -> PlayoutStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playout::testing::{packet, Sink};

    fn setup(timeout_ms: u64) -> (Arc<Sink>, MinDelayBuffer) {
        let sink = Arc::new(Sink::default());
        let config = PlayoutConfig {
            min_delay_timeout_ms: timeout_ms,
            ..Default::default()
        };
        let buffer = MinDelayBuffer::new(&config, sink.clone());
        (sink, buffer)
    }

    fn feed(buffer: &MinDelayBuffer, seq: u16, media_ms: u32) {
        buffer.data_packet_received(&ParticipantInfo::new(1), &packet(seq, media_ms));
    }

    #[test]
    fn test_in_order_passes_straight_through() {
        let (sink, buffer) = setup(1000);
        for seq in 1..=3 {
            feed(&buffer, seq, seq as u32 * 30);
        }
        assert_eq!(sink.sequences(), vec![1, 2, 3]);
        assert_eq!(buffer.stats().emitted, 3);
    }

    #[test]
    fn test_gap_is_filled_then_flushed() {
        let (sink, buffer) = setup(1000);
        feed(&buffer, 1, 0);
        feed(&buffer, 3, 60);
        feed(&buffer, 4, 90);
        assert_eq!(sink.sequences(), vec![1]);
        assert_eq!(buffer.pending(), 2);

        feed(&buffer, 2, 30);
        assert_eq!(sink.sequences(), vec![1, 2, 3, 4]);
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn test_timeout_resets_stream() {
        let (sink, buffer) = setup(100);
        feed(&buffer, 1, 0);
        feed(&buffer, 3, 50);
        feed(&buffer, 4, 200);
        assert_eq!(sink.sequences(), vec![1, 4]);
        assert_eq!(buffer.pending(), 0);

        let stats = buffer.stats();
        assert_eq!(stats.resets, 1);
        assert_eq!(stats.dropped_late, 1);

        feed(&buffer, 5, 230);
        assert_eq!(sink.sequences(), vec![1, 4, 5]);
    }

    #[test]
    fn test_late_packet_discarded() {
        let (sink, buffer) = setup(1000);
        feed(&buffer, 10, 0);
        feed(&buffer, 11, 30);
        feed(&buffer, 9, 0);
        assert_eq!(sink.sequences(), vec![10, 11]);
        assert_eq!(buffer.stats().dropped_late, 1);
    }

    #[test]
    fn test_wraps_sequence_numbers() {
        let (sink, buffer) = setup(1000);
        feed(&buffer, 65535, 0);
        feed(&buffer, 1, 60);
        feed(&buffer, 0, 30);
        assert_eq!(sink.sequences(), vec![65535, 0, 1]);
    }

    #[test]
    fn test_timestamp_wrap_keeps_timeout() {
        let (sink, buffer) = setup(100);
        let stamped = |seq: u16, timestamp: u32| {
            let mut packet = packet(seq, 0);
            packet.set_timestamp(timestamp);
            packet
        };
        let info = ParticipantInfo::new(1);
        buffer.data_packet_received(&info, &stamped(1, u32::MAX - 2699));
        buffer.data_packet_received(&info, &stamped(3, 2700));
        assert_eq!(buffer.pending(), 1);
        buffer.data_packet_received(&info, &stamped(2, 0));
        assert_eq!(sink.sequences(), vec![1, 2, 3]);
        assert_eq!(buffer.stats().resets, 0);

        // a gap older than the timeout is still given up on after the wrap
        buffer.data_packet_received(&info, &stamped(5, 2700 + 18_000));
        assert_eq!(sink.sequences(), vec![1, 2, 3, 5]);
        assert_eq!(buffer.stats().resets, 1);
    }

    #[test]
    fn test_stop_ignores_later_packets() {
        let (sink, buffer) = setup(1000);
        feed(&buffer, 1, 0);
        buffer.stop();
        feed(&buffer, 2, 30);
        assert_eq!(sink.sequences(), vec![1]);
    }
}
