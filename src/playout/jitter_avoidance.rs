//! Jitter-avoidance playout: buffer whole frames, then play them at a fixed rate

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::{Counters, MediaClock, PlayoutBuffer, PlayoutStats};
use crate::config::PlayoutConfig;
use crate::h264::Frame;
use crate::packet::DataPacket;
use crate::participant::ParticipantInfo;
use crate::session::DataListener;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Phase {
    #[default]
    Idle,
    /// Collecting the initial frames
    Waiting,
    Streaming,
}

struct JitterState {
    phase: Phase,
    /// Media time of the last frame handed to the consumer
    last_ms: Option<i64>,
    clock: MediaClock,
    frames: BTreeMap<i64, Frame>,
    source: Option<ParticipantInfo>,
}

impl JitterState {
    fn new(ticks_per_ms: u32) -> Self {
        Self {
            phase: Phase::Idle,
            last_ms: None,
            clock: MediaClock::new(ticks_per_ms),
            frames: BTreeMap::new(),
            source: None,
        }
    }
}

/// What the consumer did with the oldest frame
enum Played {
    Emitted(ParticipantInfo, Vec<DataPacket>),
    Dropped,
    Nothing,
}

struct Shared {
    downstream: Arc<dyn DataListener>,
    frames_window: usize,
    interval: Duration,
    debug: bool,
    state: Mutex<JitterState>,
    running: AtomicBool,
    stopped: AtomicBool,
    counters: Counters,
}

impl Shared {
    /// Buffer a packet into its frame. Returns true when enough frames have
    /// accumulated for streaming to begin.
    fn receive(&self, participant: &ParticipantInfo, packet: &DataPacket) -> bool {
        let mut state = self.state.lock();
        let media_ms = state.clock.media_ms(packet);

        if state.phase == Phase::Streaming && state.last_ms.is_some_and(|last| media_ms <= last) {
            self.counters.dropped_late(1);
            diag!(
                self.debug,
                "Discarded late packet #{} for frame {}ms",
                packet.sequence_number(),
                media_ms
            );
            return false;
        }

        if state.phase == Phase::Idle {
            state.phase = Phase::Waiting;
            diag!(self.debug, "Buffering {} frames", self.frames_window);
        }
        state.source = Some(participant.clone());
        state
            .frames
            .entry(media_ms)
            .and_modify(|frame| frame.add_packet(packet.clone()))
            .or_insert_with(|| Frame::new(packet.clone()));

        if state.phase == Phase::Waiting && state.frames.len() >= self.frames_window {
            state.phase = Phase::Streaming;
            return true;
        }
        false
    }

    /// Take the oldest frame, emitting it if complete
    fn next_frame(&self) -> Played {
        let mut state = self.state.lock();
        let Some((media_ms, frame)) = state.frames.pop_first() else {
            return Played::Nothing;
        };
        state.last_ms = Some(media_ms);

        if !frame.is_complete() {
            self.counters.dropped_incomplete(frame.len());
            diag!(
                self.debug,
                "Dropping incomplete frame {}ms ({} packets)",
                media_ms,
                frame.len()
            );
            return Played::Dropped;
        }
        match state.source.clone() {
            Some(info) => Played::Emitted(info, frame.into_packets()),
            None => Played::Dropped,
        }
    }

    fn play(&self) -> bool {
        match self.next_frame() {
            Played::Emitted(info, packets) => {
                self.counters.emitted(packets.len());
                for packet in &packets {
                    self.downstream.data_packet_received(&info, packet);
                }
                true
            }
            Played::Dropped => true,
            Played::Nothing => false,
        }
    }

    fn run(&self) {
        while self.running.load(Ordering::SeqCst) {
            let started = Instant::now();
            if !self.play() {
                tracing::trace!("Playout buffer ran dry");
            }
            // pacing keeps the nominal rate even when delivery is slow
            if let Some(rest) = self.interval.checked_sub(started.elapsed()) {
                thread::sleep(rest);
            }
        }
        tracing::debug!("Jitter-avoidance playout loop exited");
    }
}

/// Holds the first `frames_window` frames, then hands one frame per
/// interval to the downstream listener. Frames that are incomplete when
/// their turn comes are dropped whole.
pub struct JitterAvoidanceBuffer {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl JitterAvoidanceBuffer {
    pub fn new(config: &PlayoutConfig, downstream: Arc<dyn DataListener>) -> Self {
        Self {
            shared: Arc::new(Shared {
                downstream,
                frames_window: config.frames_window.max(1),
                interval: Duration::from_millis(config.frame_interval_ms),
                debug: false,
                state: Mutex::new(JitterState::new(config.ticks_per_ms())),
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

    /// Frames waiting to be played
    pub fn buffered_frames(&self) -> usize {
        self.shared.state.lock().frames.len()
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.state.lock().phase == Phase::Streaming
    }

    fn start_consumer(&self) {
        let mut thread = self.thread.lock();
        if thread.is_some() || self.shared.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name("playout-jitter".into())
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

impl DataListener for JitterAvoidanceBuffer {
    fn data_packet_received(&self, participant: &ParticipantInfo, packet: &DataPacket) {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.shared.counters.received();
        if self.shared.receive(participant, packet) {
            tracing::info!(
                "Buffered {} frames; streaming at one frame every {}ms",
                self.shared.frames_window,
                self.shared.interval.as_millis()
            );
            self.start_consumer();
        }
    }
}

impl PlayoutBuffer for JitterAvoidanceBuffer {
    fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::error!("Jitter-avoidance playout thread panicked");
            }
        }
    }

    fn stats(&self) -> PlayoutStats {
        self.shared.counters.snapshot()
    }
}

impl Drop for JitterAvoidanceBuffer {
    fn drop(&mut self) {
        self.stop();
    }
}
