//! Access unit reassembly from RTP payloads

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::decoder::{Decoder, SampleBuffer};
use super::nal::{NalHeader, NalKind};
use crate::config::DepacketizerConfig;
use crate::constants::START_CODE;
use crate::packet::DataPacket;
use crate::participant::ParticipantInfo;
use crate::session::DataListener;

/// Depacketizer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DepacketizerStats {
    pub units_emitted: u64,
    pub units_dropped: u64,
    pub sequence_gaps: u64,
    pub unknown_nal_types: u64,
}

#[derive(Default)]
struct State {
    last_sequence: Option<u16>,
    current: Option<SampleBuffer>,
    current_errored: bool,
}

/// Rebuilds NAL units from FULL, FU-A and STAP-A payloads and hands each
/// finished access unit to a [`Decoder`]
pub struct H264Depacketizer {
    decoder: Arc<dyn Decoder>,
    byte_stream: bool,
    debug: bool,
    state: Mutex<State>,

    units_emitted: AtomicU64,
    units_dropped: AtomicU64,
    sequence_gaps: AtomicU64,
    unknown_nal_types: AtomicU64,
}

impl H264Depacketizer {
    pub fn new(decoder: Arc<dyn Decoder>, config: &DepacketizerConfig) -> Self {
        Self {
            decoder,
            byte_stream: config.use_byte_stream_format,
            debug: false,
            state: Mutex::new(State::default()),
            units_emitted: AtomicU64::new(0),
            units_dropped: AtomicU64::new(0),
            sequence_gaps: AtomicU64::new(0),
            unknown_nal_types: AtomicU64::new(0),
        }
    }

    /// Raise per-packet diagnostics to debug level
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn stats(&self) -> DepacketizerStats {
        DepacketizerStats {
            units_emitted: self.units_emitted.load(Ordering::Relaxed),
            units_dropped: self.units_dropped.load(Ordering::Relaxed),
            sequence_gaps: self.sequence_gaps.load(Ordering::Relaxed),
            unknown_nal_types: self.unknown_nal_types.load(Ordering::Relaxed),
        }
    }

    /// Process one RTP packet
    pub fn process(&self, packet: &DataPacket) {
        let mut state = self.state.lock();
        let seq = packet.sequence_number();

        // forward distance from the newest sequence seen; duplicates and
        // stragglers neither advance it nor count as a gap
        let delta = state.last_sequence.map(|last| seq.wrapping_sub(last));
        let forward = delta.map_or(true, |delta| (1..0x8000).contains(&delta));
        let skipped = match delta {
            Some(delta) if forward => delta - 1,
            _ => 0,
        };
        let gap = skipped != 0;
        if gap {
            self.sequence_gaps.fetch_add(1, Ordering::Relaxed);
            diag!(
                self.debug,
                "RTP data {}b #{} {} SKIPPED ({})",
                packet.payload_len(),
                seq,
                packet.timestamp(),
                skipped
            );
        }
        if forward {
            state.last_sequence = Some(seq);
        }

        let payload = packet.payload();
        let Some(header) = NalHeader::parse(payload) else {
            tracing::warn!("Dropped RTP packet #{} with truncated H.264 payload ({} bytes)", seq, payload.len());
            return;
        };

        match header.kind {
            NalKind::Full => {
                diag!(self.debug, "NAL: full packet");
                self.emit_unit(&mut state, packet.timestamp(), payload);
            }
            NalKind::Aggregate => {
                diag!(self.debug, "NAL: STAP-A");
                self.emit_aggregate(&mut state, packet.timestamp(), payload.clone());
            }
            NalKind::Fragment => {
                diag!(self.debug, "NAL: FU-A fragment");
                self.fragment(&mut state, &header, packet.timestamp(), payload, gap);
            }
            NalKind::Unknown => {
                self.unknown_nal_types.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("NAL: Unimplemented unit type: {}", header.nal_type);
            }
        }
    }

    /// Open a new unit. A unit still in progress is abandoned and its buffer reused.
    fn start_unit(&self, state: &mut State, rtp_timestamp: u32) {
        state.current_errored = false;
        match state.current.take() {
            Some(mut abandoned) => {
                self.units_dropped.fetch_add(1, Ordering::Relaxed);
                abandoned.data.clear();
                abandoned.rtp_timestamp = rtp_timestamp;
                state.current = Some(abandoned);
            }
            None => match self.decoder.acquire_buffer() {
                Ok(mut buffer) => {
                    buffer.data.clear();
                    buffer.rtp_timestamp = rtp_timestamp;
                    state.current = Some(buffer);
                }
                Err(e) => {
                    tracing::error!("Failed to acquire decoder buffer: {}", e);
                    state.current_errored = true;
                }
            },
        }
        if self.byte_stream {
            if let Some(buffer) = state.current.as_mut() {
                buffer.data.extend_from_slice(&START_CODE);
            }
        }
    }

    fn finish_unit(&self, state: &mut State) {
        let Some(buffer) = state.current.take() else {
            return;
        };
        if state.current_errored {
            diag!(self.debug, "Dropping frame");
            self.units_dropped.fetch_add(1, Ordering::Relaxed);
            self.decoder.release(buffer);
            return;
        }
        match self.decoder.submit(buffer) {
            Ok(()) => {
                self.units_emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.units_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::error!("Exception sending frame to decoder: {}", e);
            }
        }
    }

    fn emit_unit(&self, state: &mut State, rtp_timestamp: u32, nal: &[u8]) {
        self.start_unit(state, rtp_timestamp);
        if let Some(buffer) = state.current.as_mut() {
            buffer.data.extend_from_slice(nal);
            self.finish_unit(state);
        }
    }

    fn emit_aggregate(&self, state: &mut State, rtp_timestamp: u32, mut payload: Bytes) {
        // STAP-A header octet
        payload.advance(1);
        while payload.has_remaining() {
            if payload.remaining() < 2 {
                tracing::warn!("STAP-A: {} trailing bytes ignored", payload.remaining());
                return;
            }
            let size = payload.get_u16() as usize;
            if size > payload.remaining() {
                tracing::warn!(
                    "STAP-A: unit of {} bytes exceeds remaining {} bytes",
                    size,
                    payload.remaining()
                );
                return;
            }
            let nal = payload.split_to(size);
            self.emit_unit(state, rtp_timestamp, &nal);
        }
    }

    fn fragment(&self, state: &mut State, header: &NalHeader, rtp_timestamp: u32, payload: &[u8], gap: bool) {
        if header.is_start() {
            diag!(self.debug, "FU-A start found. Starting new frame");
            self.start_unit(state, rtp_timestamp);
            if let Some(buffer) = state.current.as_mut() {
                buffer.data.extend_from_slice(&[header.reconstructed_header()]);
            }
        }

        // Without a buffer the start was missed; nothing to attach to
        let Some(buffer) = state.current.as_mut() else {
            return;
        };

        if rtp_timestamp != buffer.rtp_timestamp {
            diag!(self.debug, "Non-consecutive timestamp found");
            state.current_errored = true;
        }
        if gap && !header.is_start() {
            state.current_errored = true;
        }

        if !state.current_errored {
            buffer.data.extend_from_slice(&payload[2..]);
        }

        if header.is_end() {
            diag!(self.debug, "FU-A end found. Sending frame!");
            self.finish_unit(state);
        }
    }
}

impl DataListener for H264Depacketizer {
    fn data_packet_received(&self, _participant: &ParticipantInfo, packet: &DataPacket) {
        self.process(packet);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecoderError;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct Collector {
        units: Mutex<Vec<(u32, Vec<u8>)>>,
        released: AtomicU64,
        fail_acquire: AtomicBool,
    }

    impl Decoder for Collector {
        fn acquire_buffer(&self) -> Result<SampleBuffer, DecoderError> {
            if self.fail_acquire.load(Ordering::SeqCst) {
                return Err(DecoderError::BufferUnavailable("busy".into()));
            }
            Ok(SampleBuffer::new(0, 1024))
        }

        fn submit(&self, sample: SampleBuffer) -> Result<(), DecoderError> {
            self.units.lock().push((sample.rtp_timestamp, sample.data.to_vec()));
            Ok(())
        }

        fn release(&self, _sample: SampleBuffer) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn setup(byte_stream: bool) -> (Arc<Collector>, H264Depacketizer) {
        let collector = Arc::new(Collector::default());
        let config = DepacketizerConfig {
            use_byte_stream_format: byte_stream,
        };
        let depacketizer = H264Depacketizer::new(collector.clone(), &config);
        (collector, depacketizer)
    }

    fn packet(seq: u16, ts: u32, payload: &[u8]) -> DataPacket {
        let mut packet = DataPacket::new(payload.to_vec());
        packet.set_sequence_number(seq);
        packet.set_timestamp(ts);
        packet
    }

    #[test]
    fn test_full_unit_gets_start_code() {
        let (collector, depacketizer) = setup(true);
        depacketizer.process(&packet(1, 3000, &[0x65, 0xAA, 0xBB]));

        let units = collector.units.lock();
        assert_eq!(units.as_slice(), &[(3000, vec![0, 0, 0, 1, 0x65, 0xAA, 0xBB])]);
    }

    #[test]
    fn test_raw_nal_without_byte_stream_format() {
        let (collector, depacketizer) = setup(false);
        depacketizer.process(&packet(1, 3000, &[0x41, 0x01]));
        assert_eq!(collector.units.lock()[0].1, vec![0x41, 0x01]);
    }

    #[test]
    fn test_aggregate_splits_units() {
        let (collector, depacketizer) = setup(true);
        depacketizer.process(&packet(1, 0, &[0x78, 0, 2, 0x67, 0x42, 0, 1, 0x68]));

        let units = collector.units.lock();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].1, vec![0, 0, 0, 1, 0x67, 0x42]);
        assert_eq!(units[1].1, vec![0, 0, 0, 1, 0x68]);
    }

    #[test]
    fn test_aggregate_overrun_stops_parsing() {
        let (collector, depacketizer) = setup(true);
        depacketizer.process(&packet(1, 0, &[0x78, 0, 1, 0x67, 0, 9, 0x68]));
        assert_eq!(collector.units.lock().len(), 1);
    }

    #[test]
    fn test_fragments_reassemble() {
        let (collector, depacketizer) = setup(true);
        depacketizer.process(&packet(10, 9000, &[0x7C, 0x85, 1, 2]));
        depacketizer.process(&packet(11, 9000, &[0x7C, 0x05, 3]));
        depacketizer.process(&packet(12, 9000, &[0x7C, 0x45, 4]));

        let units = collector.units.lock();
        assert_eq!(units.as_slice(), &[(9000, vec![0, 0, 0, 1, 0x65, 1, 2, 3, 4])]);
        assert_eq!(depacketizer.stats().units_emitted, 1);
    }

    #[test]
    fn test_gap_errors_unit_in_progress() {
        let (collector, depacketizer) = setup(true);
        depacketizer.process(&packet(10, 9000, &[0x7C, 0x85, 1]));
        depacketizer.process(&packet(12, 9000, &[0x7C, 0x45, 3]));

        assert!(collector.units.lock().is_empty());
        assert_eq!(collector.released.load(Ordering::SeqCst), 1);
        let stats = depacketizer.stats();
        assert_eq!(stats.sequence_gaps, 1);
        assert_eq!(stats.units_dropped, 1);

        // the next unit is unaffected
        depacketizer.process(&packet(13, 12000, &[0x65, 9]));
        assert_eq!(collector.units.lock().len(), 1);
    }

    #[test]
    fn test_gap_before_start_does_not_error_new_unit() {
        let (collector, depacketizer) = setup(true);
        depacketizer.process(&packet(1, 0, &[0x65, 1]));
        depacketizer.process(&packet(5, 3000, &[0x7C, 0x85, 1]));
        depacketizer.process(&packet(6, 3000, &[0x7C, 0x45, 2]));

        let units = collector.units.lock();
        assert_eq!(units.len(), 2);
        assert_eq!(units[1].1, vec![0, 0, 0, 1, 0x65, 1, 2]);
    }

    #[test]
    fn test_timestamp_change_errors_unit() {
        let (collector, depacketizer) = setup(true);
        depacketizer.process(&packet(1, 9000, &[0x7C, 0x85, 1]));
        depacketizer.process(&packet(2, 12000, &[0x7C, 0x45, 2]));
        assert!(collector.units.lock().is_empty());
        assert_eq!(depacketizer.stats().units_dropped, 1);
    }

    #[test]
    fn test_fragments_without_start_are_ignored() {
        let (collector, depacketizer) = setup(true);
        depacketizer.process(&packet(1, 9000, &[0x7C, 0x05, 1]));
        depacketizer.process(&packet(2, 9000, &[0x7C, 0x45, 2]));
        assert!(collector.units.lock().is_empty());
    }

    #[test]
    fn test_abandoned_unit_buffer_is_reused() {
        let (collector, depacketizer) = setup(true);
        depacketizer.process(&packet(1, 9000, &[0x7C, 0x85, 1]));
        depacketizer.process(&packet(2, 12000, &[0x65, 7]));

        let units = collector.units.lock();
        assert_eq!(units.as_slice(), &[(12000, vec![0, 0, 0, 1, 0x65, 7])]);
        assert_eq!(depacketizer.stats().units_dropped, 1);
    }

    #[test]
    fn test_acquire_failure_drops_unit() {
        let (collector, depacketizer) = setup(true);
        collector.fail_acquire.store(true, Ordering::SeqCst);
        depacketizer.process(&packet(1, 0, &[0x65, 1]));
        depacketizer.process(&packet(2, 0, &[0x7C, 0x85, 1]));
        depacketizer.process(&packet(3, 0, &[0x7C, 0x45, 2]));
        assert!(collector.units.lock().is_empty());

        collector.fail_acquire.store(false, Ordering::SeqCst);
        depacketizer.process(&packet(4, 0, &[0x65, 1]));
        assert_eq!(collector.units.lock().len(), 1);
    }

    #[test]
    fn test_unknown_and_truncated_payloads() {
        let (collector, depacketizer) = setup(true);
        depacketizer.process(&packet(1, 0, &[0x1D, 0x80]));
        depacketizer.process(&packet(2, 0, &[]));
        depacketizer.process(&packet(3, 0, &[0x7C]));
        assert!(collector.units.lock().is_empty());
        assert_eq!(depacketizer.stats().unknown_nal_types, 1);
        assert_eq!(depacketizer.stats().sequence_gaps, 0);
    }

    #[test]
    fn test_duplicate_and_backward_packets_are_not_gaps() {
        let (collector, depacketizer) = setup(true);
        depacketizer.process(&packet(20, 0, &[0x65, 1]));
        depacketizer.process(&packet(20, 0, &[0x65, 1]));
        depacketizer.process(&packet(18, 0, &[0x65, 2]));
        assert_eq!(depacketizer.stats().sequence_gaps, 0);

        // the straggler did not move the tracked sequence backwards
        depacketizer.process(&packet(21, 3000, &[0x65, 3]));
        assert_eq!(depacketizer.stats().sequence_gaps, 0);
        depacketizer.process(&packet(23, 6000, &[0x65, 4]));
        assert_eq!(depacketizer.stats().sequence_gaps, 1);
        assert_eq!(collector.units.lock().len(), 5);
    }

    #[test]
    fn test_sequence_wrap_is_not_a_gap() {
        let (collector, depacketizer) = setup(true);
        depacketizer.process(&packet(65535, 0, &[0x7C, 0x85, 1]));
        depacketizer.process(&packet(0, 0, &[0x7C, 0x45, 2]));
        assert_eq!(collector.units.lock().len(), 1);
        assert_eq!(depacketizer.stats().sequence_gaps, 0);
    }
}
