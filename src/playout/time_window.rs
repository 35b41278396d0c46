//! Time-window playout: release packets a fixed delay behind real time

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::{Counters, MediaClock, PlayoutBuffer, PlayoutStats, Unwrapper};
use crate::config::PlayoutConfig;
use crate::packet::DataPacket;
use crate::participant::ParticipantInfo;
use crate::session::DataListener;

type Released = Vec<(ParticipantInfo, DataPacket)>;

struct WindowState {
    started: bool,
    /// Local clock minus media clock, fixed by the first packet
    offset_ms: i64,
    /// Media time up to which everything was released
    play_head_ms: i64,
    clock: MediaClock,
    sequences: Unwrapper,
    /// Keyed by media time, then extended sequence number
    pending: BTreeMap<(i64, i64), (ParticipantInfo, DataPacket)>,
}

impl WindowState {
    fn new(ticks_per_ms: u32) -> Self {
        Self {
            started: false,
            offset_ms: 0,
            play_head_ms: 0,
            clock: MediaClock::new(ticks_per_ms),
            sequences: Unwrapper::sequences(),
            pending: BTreeMap::new(),
        }
    }
}

struct Shared {
    downstream: Arc<dyn DataListener>,
    window_ms: i64,
    tick: Duration,
    debug: bool,
    epoch: Instant,
    state: Mutex<WindowState>,
    running: AtomicBool,
    stopped: AtomicBool,
    counters: Counters,
}

impl Shared {
    fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

    /// Buffer a packet that arrived at `now_ms`. Returns true when it was
    /// the first packet of the stream.
    fn receive_at(&self, now_ms: i64, participant: &ParticipantInfo, packet: &DataPacket) -> bool {
        let mut state = self.state.lock();
        let media_ms = state.clock.media_ms(packet);
        let seq = state.sequences.extend(packet.sequence_number() as u32);

        let first = !state.started;
        if first {
            state.started = true;
            state.offset_ms = now_ms - media_ms;
            state.play_head_ms = media_ms - self.window_ms;
        }

        if media_ms < state.play_head_ms {
            self.counters.dropped_late(1);
            diag!(
                self.debug,
                "Discarded packet: (s#, pt, st) {}/{}/{}",
                packet.sequence_number(),
                media_ms,
                now_ms
            );
            return first;
        }

        state
            .pending
            .insert((media_ms, seq), (participant.clone(), packet.clone()));
        first
    }

    /// Advance the play head to `now_ms` and take everything in
    /// `[previous head, new head)`
    fn tick_at(&self, now_ms: i64) -> Released {
        let mut state = self.state.lock();
        if !state.started {
            return Vec::new();
        }

        let previous = state.play_head_ms;
        let play_head = now_ms - state.offset_ms - self.window_ms;
        state.play_head_ms = play_head;

        let mut released = Vec::new();
        while let Some(entry) = state.pending.first_entry() {
            let (media_ms, _) = *entry.key();
            if media_ms >= play_head {
                break;
            }
            let (info, packet) = entry.remove();
            if media_ms < previous {
                tracing::warn!(
                    "Dropping packet #{} from buffer. This shouldn't happen",
                    packet.sequence_number()
                );
                self.counters.dropped_late(1);
            } else {
                released.push((info, packet));
            }
        }
        released
    }

    fn deliver(&self, released: &Released) {
        self.counters.emitted(released.len());
        for (info, packet) in released {
            self.downstream.data_packet_received(info, packet);
        }
    }

    fn run(&self) {
        while self.running.load(Ordering::SeqCst) {
            // the first packet starts the loop, so wait before the first release
            thread::sleep(self.tick);
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            let released = self.tick_at(self.now_ms());
            self.deliver(&released);
        }
        tracing::debug!("Time-window playout loop exited");
    }
}

/// Accumulates a fixed playout delay from the first packet, then on every
/// tick releases what the moving play head passed, in media time then
/// sequence order
pub struct TimeWindowBuffer {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimeWindowBuffer {
    pub fn new(config: &PlayoutConfig, downstream: Arc<dyn DataListener>) -> Self {
        Self {
            shared: Arc::new(Shared {
                downstream,
                window_ms: config.window_ms as i64,
                tick: Duration::from_millis(config.tick_ms.max(1)),
                debug: false,
                epoch: Instant::now(),
                state: Mutex::new(WindowState::new(config.ticks_per_ms())),
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                counters: Counters::default(),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Must be called before the buffer is shared
    pub fn with_debug(mut self, debug: bool) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.debug = debug;
        }
        self
    }

    /// Packets waiting for the play head
    pub fn pending(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    fn start_pacing(&self) {
        let mut thread = self.thread.lock();
        if thread.is_some() || self.shared.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name("playout-time-window".into())
            .spawn(move || shared.run())
        {
            Ok(handle) => *thread = Some(handle),
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                tracing::error!("Failed to start playout thread: {}", e);
            }
        }
    }
}

impl DataListener for TimeWindowBuffer {
    fn data_packet_received(&self, participant: &ParticipantInfo, packet: &DataPacket) {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.shared.counters.received();
        if self.shared.receive_at(self.shared.now_ms(), participant, packet) {
            tracing::info!(
                "Streaming started; releasing packets {}ms behind arrival",
                self.shared.window_ms
            );
            self.start_pacing();
        }
    }
}

impl PlayoutBuffer for TimeWindowBuffer {
    fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::error!("Time-window playout thread panicked");
            }
        }
    }

    fn stats(&self) -> PlayoutStats {
        self.shared.counters.snapshot()
    }
}

impl Drop for TimeWindowBuffer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playout::testing::{packet, Sink};

    fn setup(window_ms: u64, tick_ms: u64) -> (Arc<Sink>, TimeWindowBuffer) {
        let sink = Arc::new(Sink::default());
        let config = PlayoutConfig {
            window_ms,
            tick_ms,
            ..Default::default()
        };
        (sink.clone(), TimeWindowBuffer::new(&config, sink))
    }

    fn receive(buffer: &TimeWindowBuffer, now_ms: i64, seq: u16, media_ms: u32) {
        buffer
            .shared
            .receive_at(now_ms, &ParticipantInfo::new(1), &packet(seq, media_ms));
    }

    fn sequences(released: &Released) -> Vec<u16> {
        released.iter().map(|(_, p)| p.sequence_number()).collect()
    }

    #[test]
    fn test_window_delays_release() {
        let (_sink, buffer) = setup(500, 20);
        receive(&buffer, 1000, 1, 10_000);
        receive(&buffer, 1000, 2, 10_000);

        assert!(buffer.shared.tick_at(1020).is_empty());
        assert!(buffer.shared.tick_at(1500).is_empty());
        assert_eq!(sequences(&buffer.shared.tick_at(1501)), vec![1, 2]);
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn test_reordered_within_window() {
        let (_sink, buffer) = setup(500, 20);
        receive(&buffer, 1000, 1, 10_000);
        receive(&buffer, 1000, 2, 10_000);
        receive(&buffer, 1000, 4, 10_000);
        receive(&buffer, 1034, 5, 10_034);
        receive(&buffer, 1034, 6, 10_034);
        receive(&buffer, 1068, 7, 10_068);
        receive(&buffer, 1068, 8, 10_068);
        receive(&buffer, 1068, 3, 10_000);

        let mut released = Vec::new();
        for now in (1500..1600).step_by(20) {
            released.extend(sequences(&buffer.shared.tick_at(now)));
        }
        assert_eq!(released, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_too_old_is_never_released() {
        let (_sink, buffer) = setup(200, 20);
        receive(&buffer, 1000, 1, 10_000);
        buffer.shared.tick_at(1300);

        // play head is now at media 10_100
        receive(&buffer, 1300, 2, 10_050);
        assert_eq!(buffer.pending(), 0);
        assert_eq!(buffer.stats().dropped_late, 1);

        receive(&buffer, 1300, 3, 10_150);
        assert!(buffer.shared.tick_at(1350).is_empty());
        assert_eq!(sequences(&buffer.shared.tick_at(1351)), vec![3]);
    }

    #[test]
    fn test_media_time_orders_release() {
        let (_sink, buffer) = setup(100, 20);
        receive(&buffer, 0, 10, 1_000);
        receive(&buffer, 0, 12, 1_020);
        receive(&buffer, 0, 11, 1_040);
        assert_eq!(sequences(&buffer.shared.tick_at(200)), vec![10, 12, 11]);
    }

    #[test]
    fn test_fragments_across_sequence_wrap_keep_order() {
        let (_sink, buffer) = setup(100, 20);
        receive(&buffer, 0, 65534, 1_000);
        receive(&buffer, 0, 0, 1_000);
        receive(&buffer, 0, 65535, 1_000);
        receive(&buffer, 0, 1, 1_033);
        assert_eq!(sequences(&buffer.shared.tick_at(500)), vec![65534, 65535, 0, 1]);
    }

    #[test]
    fn test_timestamp_wrap_keeps_streaming() {
        let (_sink, buffer) = setup(100, 20);
        let info = ParticipantInfo::new(1);
        let mut before = packet(1, 0);
        before.set_timestamp(u32::MAX - 899);
        let mut after = packet(2, 0);
        after.set_timestamp(2700);

        buffer.shared.receive_at(1000, &info, &before);
        buffer.shared.receive_at(1040, &info, &after);
        assert_eq!(buffer.pending(), 2);
        assert_eq!(buffer.stats().dropped_late, 0);

        assert_eq!(sequences(&buffer.shared.tick_at(1101)), vec![1]);
        assert_eq!(sequences(&buffer.shared.tick_at(1141)), vec![2]);
    }

    #[test]
    fn test_pacing_thread_emits_in_order() {
        let (sink, buffer) = setup(100, 5);
        let info = ParticipantInfo::new(1);
        let start = Instant::now();

        for seq in [1, 2, 4] {
            buffer.data_packet_received(&info, &packet(seq, 0));
        }
        thread::sleep(Duration::from_millis(34));
        buffer.data_packet_received(&info, &packet(5, 34));
        buffer.data_packet_received(&info, &packet(6, 34));
        thread::sleep(Duration::from_millis(34));
        buffer.data_packet_received(&info, &packet(7, 68));
        buffer.data_packet_received(&info, &packet(8, 68));
        buffer.data_packet_received(&info, &packet(3, 0));

        thread::sleep(Duration::from_millis(400));
        buffer.stop();

        assert_eq!(sink.sequences(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        for (at, packet) in sink.packets.lock().iter() {
            let nominal = Duration::from_millis((packet.timestamp() / 90) as u64 + 100);
            let actual = at.duration_since(start);
            let skew = actual.as_millis() as i64 - nominal.as_millis() as i64;
            assert!(skew.abs() <= 30, "packet #{} released {}ms off", packet.sequence_number(), skew);
        }
        assert_eq!(buffer.stats().emitted, 8);
    }

    #[test]
    fn test_stop_ends_pacing() {
        let (sink, buffer) = setup(50, 5);
        buffer.data_packet_received(&ParticipantInfo::new(1), &packet(1, 0));
        buffer.stop();
        buffer.data_packet_received(&ParticipantInfo::new(1), &packet(2, 0));
        thread::sleep(Duration::from_millis(100));
        assert!(sink.sequences().is_empty());
        assert_eq!(buffer.stats().received, 1);
    }
}
