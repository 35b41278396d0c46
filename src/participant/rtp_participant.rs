//! Remote or local RTP endpoint

use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::{ParticipantInfo, ReceptionStats};
use crate::packet::{DataPacket, ReceptionReport, SdesChunk};

/// Mutable per-participant bookkeeping
#[derive(Debug)]
struct State {
    info: ParticipantInfo,
    last_data_origin: Option<SocketAddr>,
    last_control_origin: Option<SocketAddr>,
    last_reception: Option<Instant>,
    bye_reception: Option<Instant>,
    last_sequence_number: Option<u16>,
    received_sdes: bool,
    stats: ReceptionStats,
    last_report_about_us: Option<ReceptionReport>,
}

/// A session participant. Shared between the database and the session
/// behind an `Arc`; all mutation goes through interior locks.
#[derive(Debug)]
pub struct RtpParticipant {
    /// Where data packets for this participant go
    data_destination: Option<SocketAddr>,

    /// Where control packets for this participant go
    control_destination: Option<SocketAddr>,

    created_at: Instant,

    state: RwLock<State>,

    /// Data packets accepted from this participant
    received_packets: AtomicU64,

    /// Payload bytes accepted from this participant
    received_bytes: AtomicU64,
}

impl RtpParticipant {
    fn with(info: ParticipantInfo, data: Option<SocketAddr>, control: Option<SocketAddr>) -> Self {
        Self {
            data_destination: data,
            control_destination: control,
            created_at: Instant::now(),
            state: RwLock::new(State {
                info,
                last_data_origin: None,
                last_control_origin: None,
                last_reception: None,
                bye_reception: None,
                last_sequence_number: None,
                received_sdes: false,
                stats: ReceptionStats::new(),
                last_report_about_us: None,
            }),
            received_packets: AtomicU64::new(0),
            received_bytes: AtomicU64::new(0),
        }
    }

    /// Participant we send to, reachable at known data and control addresses
    pub fn receiver(info: ParticipantInfo, data: SocketAddr, control: SocketAddr) -> Self {
        Self::with(info, Some(data), Some(control))
    }

    /// Member first seen through a data packet from an unknown source
    pub fn from_data_packet(origin: SocketAddr, packet: &DataPacket) -> Self {
        let participant = Self::with(ParticipantInfo::new(packet.ssrc()), None, None);
        participant.state.write().last_data_origin = Some(origin);
        participant
    }

    /// Member first seen through an SDES chunk from an unknown source
    pub fn from_sdes_chunk(origin: SocketAddr, chunk: &SdesChunk) -> Self {
        let participant = Self::with(ParticipantInfo::new(chunk.ssrc), None, None);
        {
            let mut state = participant.state.write();
            state.last_control_origin = Some(origin);
            state.info.update_from_sdes_chunk(chunk);
            state.received_sdes = true;
        }
        participant
    }

    pub fn ssrc(&self) -> u32 {
        self.state.read().info.ssrc
    }

    pub fn set_ssrc(&self, ssrc: u32) {
        self.state.write().info.ssrc = ssrc;
    }

    /// Snapshot of the descriptive info
    pub fn info(&self) -> ParticipantInfo {
        self.state.read().info.clone()
    }

    pub fn cname(&self) -> Option<String> {
        self.state.read().info.cname.clone()
    }

    /// Apply an SDES chunk, returning whether anything changed
    pub fn update_from_sdes_chunk(&self, chunk: &SdesChunk) -> bool {
        self.state.write().info.update_from_sdes_chunk(chunk)
    }

    /// Draw new SSRCs until ours differs from `avoid`
    pub fn resolve_ssrc_conflict(&self, avoid: u32) -> u32 {
        let mut state = self.state.write();
        while state.info.ssrc == avoid {
            state.info.ssrc = ParticipantInfo::generate_ssrc();
        }
        state.info.ssrc
    }

    /// Both destinations are known
    pub fn is_receiver(&self) -> bool {
        self.data_destination.is_some() && self.control_destination.is_some()
    }

    pub fn data_destination(&self) -> Option<SocketAddr> {
        self.data_destination
    }

    pub fn control_destination(&self) -> Option<SocketAddr> {
        self.control_destination
    }

    pub fn last_data_origin(&self) -> Option<SocketAddr> {
        self.state.read().last_data_origin
    }

    pub fn set_last_data_origin(&self, origin: SocketAddr) {
        self.state.write().last_data_origin = Some(origin);
    }

    pub fn last_control_origin(&self) -> Option<SocketAddr> {
        self.state.read().last_control_origin
    }

    pub fn set_last_control_origin(&self, origin: SocketAddr) {
        self.state.write().last_control_origin = Some(origin);
    }

    pub fn bye_received(&self) {
        self.state.write().bye_reception = Some(Instant::now());
    }

    pub fn has_received_bye(&self) -> bool {
        self.state.read().bye_reception.is_some()
    }

    pub fn bye_reception_instant(&self) -> Option<Instant> {
        self.state.read().bye_reception
    }

    pub fn mark_received_sdes(&self) {
        self.state.write().received_sdes = true;
    }

    pub fn has_received_sdes(&self) -> bool {
        self.state.read().received_sdes
    }

    /// Refresh the liveness timestamp
    pub fn packet_received(&self) {
        self.state.write().last_reception = Some(Instant::now());
    }

    pub fn last_reception_instant(&self) -> Option<Instant> {
        self.state.read().last_reception
    }

    /// Time without traffic, counted from creation if nothing arrived yet
    pub fn silent_for(&self, now: Instant) -> Duration {
        let since = self.state.read().last_reception.unwrap_or(self.created_at);
        now.saturating_duration_since(since)
    }

    pub fn last_sequence_number(&self) -> Option<u16> {
        self.state.read().last_sequence_number
    }

    pub fn set_last_sequence_number(&self, seq: u16) {
        self.state.write().last_sequence_number = Some(seq);
    }

    /// Record an accepted data packet: sequence, origin, counters, statistics
    pub fn data_packet_accepted(&self, origin: SocketAddr, packet: &DataPacket, clock_rate: u32) {
        let now = Instant::now();
        {
            let mut state = self.state.write();
            state.last_sequence_number = Some(packet.sequence_number());
            state.last_data_origin = Some(origin);
            state.last_reception = Some(now);
            state
                .stats
                .packet_received(packet.sequence_number(), packet.timestamp(), now, clock_rate);
        }
        self.received_packets.fetch_add(1, Ordering::Relaxed);
        self.received_bytes
            .fetch_add(packet.payload_len() as u64, Ordering::Relaxed);
    }

    /// Get received packets count
    pub fn received_packets(&self) -> u64 {
        self.received_packets.load(Ordering::Relaxed)
    }

    /// Get received bytes count
    pub fn received_bytes(&self) -> u64 {
        self.received_bytes.load(Ordering::Relaxed)
    }

    pub fn sender_report_received(&self, ntp_timestamp: u64) {
        self.state
            .write()
            .stats
            .sender_report_received(ntp_timestamp, Instant::now());
    }

    /// Store what this participant last reported about our stream
    pub fn set_last_report_about_us(&self, report: ReceptionReport) {
        self.state.write().last_report_about_us = Some(report);
    }

    pub fn last_report_about_us(&self) -> Option<ReceptionReport> {
        self.state.read().last_report_about_us
    }

    /// Report block about this participant, if anything was received from it
    pub fn build_reception_report(&self) -> Option<ReceptionReport> {
        if self.received_packets() == 0 {
            return None;
        }
        let mut state = self.state.write();
        let ssrc = state.info.ssrc;
        Some(state.stats.build_report(ssrc, Instant::now()))
    }

    pub fn stats(&self) -> ReceptionStats {
        self.state.read().stats.clone()
    }
}

impl std::fmt::Display for RtpParticipant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.state.read().info)
    }
}
