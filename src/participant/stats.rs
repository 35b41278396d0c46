//! Per-source reception statistics (RFC 3550 appendix A.3 and A.8)

use std::time::Instant;

use crate::packet::{ReceptionReport, MAX_CUMULATIVE_LOST};

/// Receiver-side view of one remote source
#[derive(Debug, Clone, Default)]
pub struct ReceptionStats {
    started: bool,

    /// First sequence number seen
    base_seq: u16,

    /// Highest sequence number seen, without cycles
    max_seq: u16,

    /// Number of sequence number wraps
    cycles: u32,

    received: u64,

    expected_prior: u64,

    received_prior: u64,

    /// Interarrival jitter estimate in timestamp units
    jitter: f64,

    last_rtp_timestamp: u32,

    last_arrival: Option<Instant>,

    /// Middle 32 bits of the last SR's NTP timestamp
    last_sr: u32,

    last_sr_arrival: Option<Instant>,
}

impl ReceptionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for one accepted data packet
    pub fn packet_received(&mut self, seq: u16, rtp_timestamp: u32, arrival: Instant, clock_rate: u32) {
        self.received += 1;

        if !self.started {
            self.started = true;
            self.base_seq = seq;
            self.max_seq = seq;
            self.last_rtp_timestamp = rtp_timestamp;
            self.last_arrival = Some(arrival);
            return;
        }

        let delta = seq.wrapping_sub(self.max_seq);
        if delta > 0 && delta < 0x8000 {
            if seq < self.max_seq {
                self.cycles += 1;
            }
            self.max_seq = seq;
        }

        if let Some(last_arrival) = self.last_arrival {
            let elapsed = arrival.saturating_duration_since(last_arrival).as_secs_f64() * clock_rate as f64;
            let d = elapsed - (rtp_timestamp as f64 - self.last_rtp_timestamp as f64);
            self.jitter += (d.abs() - self.jitter) / 16.0;
        }
        self.last_rtp_timestamp = rtp_timestamp;
        self.last_arrival = Some(arrival);
    }

    /// Remember an SR from this source for LSR/DLSR
    pub fn sender_report_received(&mut self, ntp_timestamp: u64, arrival: Instant) {
        self.last_sr = (ntp_timestamp >> 16) as u32;
        self.last_sr_arrival = Some(arrival);
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn extended_highest_sequence(&self) -> u32 {
        (self.cycles << 16) | self.max_seq as u32
    }

    fn expected(&self) -> u64 {
        if !self.started {
            return 0;
        }
        let extended = ((self.cycles as u64) << 16) | self.max_seq as u64;
        extended + 1 - self.base_seq as u64
    }

    /// Packets lost since the start, clamped to the 24-bit field
    pub fn cumulative_lost(&self) -> u32 {
        let lost = self.expected().saturating_sub(self.received);
        lost.min(MAX_CUMULATIVE_LOST as u64) as u32
    }

    pub fn jitter(&self) -> u32 {
        self.jitter as u32
    }

    /// Build a report block about `ssrc` and start a new reporting interval
    pub fn build_report(&mut self, ssrc: u32, now: Instant) -> ReceptionReport {
        let expected = self.expected();
        let expected_interval = expected - self.expected_prior;
        let received_interval = self.received - self.received_prior;
        self.expected_prior = expected;
        self.received_prior = self.received;

        let lost_interval = expected_interval.saturating_sub(received_interval);
        let fraction_lost = if expected_interval == 0 || lost_interval == 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval).min(255) as u8
        };

        let mut report = ReceptionReport::new(ssrc);
        report.fraction_lost = fraction_lost;
        // clamped above
        let _ = report.set_cumulative_lost(self.cumulative_lost());
        report.extended_highest_sequence = self.extended_highest_sequence();
        report.jitter = self.jitter();
        report.last_sr = self.last_sr;
        report.delay_since_last_sr = match self.last_sr_arrival {
            Some(at) => (now.saturating_duration_since(at).as_secs_f64() * 65536.0) as u32,
            None => 0,
        };
        report
    }
}
