//! Sender and receiver reports

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::check_count;
use crate::constants::REPORT_BLOCK_SIZE;
use crate::error::CodecError;

/// Largest cumulative loss a 24-bit field can carry
pub const MAX_CUMULATIVE_LOST: u32 = 0x00ff_ffff;

/// Sender info block of an SR: ntp(8) + rtp ts(4) + packets(4) + octets(4)
const SENDER_INFO_SIZE: usize = 20;

/// Reception report block, 24 bytes on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReceptionReport {
    /// Source this block reports on
    pub ssrc: u32,

    /// Fraction of packets lost since the previous report, in 1/256 units
    pub fraction_lost: u8,

    cumulative_lost: u32,

    /// Cycles in the high 16 bits, highest sequence seen in the low 16
    pub extended_highest_sequence: u32,

    /// Interarrival jitter in timestamp units
    pub jitter: u32,

    /// Middle 32 bits of the last SR's NTP timestamp
    pub last_sr: u32,

    /// Delay since the last SR, in 1/65536 seconds
    pub delay_since_last_sr: u32,
}

impl ReceptionReport {
    pub fn new(ssrc: u32) -> Self {
        Self {
            ssrc,
            ..Default::default()
        }
    }

    pub fn cumulative_lost(&self) -> u32 {
        self.cumulative_lost
    }

    /// Set the cumulative loss, which must fit in 24 bits
    pub fn set_cumulative_lost(&mut self, lost: u32) -> Result<(), CodecError> {
        if lost > MAX_CUMULATIVE_LOST {
            return Err(CodecError::OutOfRange {
                field: "cumulative packets lost",
                value: lost as usize,
                max: MAX_CUMULATIVE_LOST as usize,
            });
        }
        self.cumulative_lost = lost;
        Ok(())
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32(self.ssrc);
        buf.put_u8(self.fraction_lost);
        buf.put_uint(self.cumulative_lost as u64, 3);
        buf.put_u32(self.extended_highest_sequence);
        buf.put_u32(self.jitter);
        buf.put_u32(self.last_sr);
        buf.put_u32(self.delay_since_last_sr);
    }

    /// Caller guarantees 24 bytes are available
    fn read(buf: &mut Bytes) -> Self {
        Self {
            ssrc: buf.get_u32(),
            fraction_lost: buf.get_u8(),
            cumulative_lost: buf.get_uint(3) as u32,
            extended_highest_sequence: buf.get_u32(),
            jitter: buf.get_u32(),
            last_sr: buf.get_u32(),
            delay_since_last_sr: buf.get_u32(),
        }
    }
}

fn push_report(
    reports: &mut Vec<ReceptionReport>,
    report: ReceptionReport,
) -> Result<(), CodecError> {
    check_count("reception report count", reports.len() + 1)?;
    reports.push(report);
    Ok(())
}

fn read_reports(count: u8, buf: &mut Bytes) -> Result<Vec<ReceptionReport>, CodecError> {
    let needed = count as usize * REPORT_BLOCK_SIZE;
    if buf.remaining() < needed {
        return Err(CodecError::TooShort {
            needed,
            actual: buf.remaining(),
        });
    }
    Ok((0..count).map(|_| ReceptionReport::read(buf)).collect())
}

/// Sender report (PT 200)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SenderReport {
    pub sender_ssrc: u32,

    /// 64-bit NTP timestamp, seconds in the high word
    pub ntp_timestamp: u64,

    /// RTP timestamp matching `ntp_timestamp`
    pub rtp_timestamp: u32,

    pub packet_count: u32,

    pub octet_count: u32,

    reports: Vec<ReceptionReport>,
}

impl SenderReport {
    pub fn new(sender_ssrc: u32) -> Self {
        Self {
            sender_ssrc,
            ..Default::default()
        }
    }

    pub fn reports(&self) -> &[ReceptionReport] {
        &self.reports
    }

    /// Append a report block; the 32nd is rejected and nothing changes
    pub fn add_report(&mut self, report: ReceptionReport) -> Result<(), CodecError> {
        push_report(&mut self.reports, report)
    }

    /// Replace all report blocks
    pub fn set_reports(&mut self, reports: Vec<ReceptionReport>) -> Result<(), CodecError> {
        check_count("reception report count", reports.len())?;
        self.reports = reports;
        Ok(())
    }

    pub(crate) fn body_len(&self) -> usize {
        4 + SENDER_INFO_SIZE + self.reports.len() * REPORT_BLOCK_SIZE
    }

    pub(crate) fn write_body(&self, buf: &mut BytesMut) {
        buf.put_u32(self.sender_ssrc);
        buf.put_u64(self.ntp_timestamp);
        buf.put_u32(self.rtp_timestamp);
        buf.put_u32(self.packet_count);
        buf.put_u32(self.octet_count);
        for report in &self.reports {
            report.write(buf);
        }
    }

    /// Trailing profile-specific extension bytes are ignored
    pub(crate) fn decode(count: u8, buf: &mut Bytes) -> Result<Self, CodecError> {
        if buf.remaining() < 4 + SENDER_INFO_SIZE {
            return Err(CodecError::TooShort {
                needed: 4 + SENDER_INFO_SIZE,
                actual: buf.remaining(),
            });
        }
        let sender_ssrc = buf.get_u32();
        let ntp_timestamp = buf.get_u64();
        let rtp_timestamp = buf.get_u32();
        let packet_count = buf.get_u32();
        let octet_count = buf.get_u32();
        let reports = read_reports(count, buf)?;

        Ok(Self {
            sender_ssrc,
            ntp_timestamp,
            rtp_timestamp,
            packet_count,
            octet_count,
            reports,
        })
    }
}

/// Receiver report (PT 201)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReceiverReport {
    pub sender_ssrc: u32,

    reports: Vec<ReceptionReport>,
}

impl ReceiverReport {
    pub fn new(sender_ssrc: u32) -> Self {
        Self {
            sender_ssrc,
            reports: Vec::new(),
        }
    }

    pub fn reports(&self) -> &[ReceptionReport] {
        &self.reports
    }

    /// Append a report block; the 32nd is rejected and nothing changes
    pub fn add_report(&mut self, report: ReceptionReport) -> Result<(), CodecError> {
        push_report(&mut self.reports, report)
    }

    pub fn set_reports(&mut self, reports: Vec<ReceptionReport>) -> Result<(), CodecError> {
        check_count("reception report count", reports.len())?;
        self.reports = reports;
        Ok(())
    }

    pub(crate) fn body_len(&self) -> usize {
        4 + self.reports.len() * REPORT_BLOCK_SIZE
    }

    pub(crate) fn write_body(&self, buf: &mut BytesMut) {
        buf.put_u32(self.sender_ssrc);
        for report in &self.reports {
            report.write(buf);
        }
    }

    pub(crate) fn decode(count: u8, buf: &mut Bytes) -> Result<Self, CodecError> {
        if buf.remaining() < 4 {
            return Err(CodecError::TooShort {
                needed: 4,
                actual: buf.remaining(),
            });
        }
        let sender_ssrc = buf.get_u32();
        let reports = read_reports(count, buf)?;
        Ok(Self {
            sender_ssrc,
            reports,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ControlPacket;

    fn block(ssrc: u32) -> ReceptionReport {
        let mut report = ReceptionReport::new(ssrc);
        report.fraction_lost = 12;
        report.set_cumulative_lost(0x00ab_cdef).unwrap();
        report.extended_highest_sequence = 0x0001_0203;
        report.jitter = 55;
        report.last_sr = 0x1234_5678;
        report.delay_since_last_sr = 65536;
        report
    }

    #[test]
    fn test_cumulative_lost_is_24_bits() {
        let mut report = ReceptionReport::new(1);
        assert!(report.set_cumulative_lost(MAX_CUMULATIVE_LOST).is_ok());
        assert!(report.set_cumulative_lost(MAX_CUMULATIVE_LOST + 1).is_err());
        assert_eq!(report.cumulative_lost(), MAX_CUMULATIVE_LOST);
    }

    #[test]
    fn test_report_block_layout() {
        let mut rr = ReceiverReport::new(0xaabb_ccdd);
        rr.add_report(block(0x1111_2222)).unwrap();
        let encoded = ControlPacket::from(rr).encode();

        assert_eq!(&encoded[8..12], &0x1111_2222u32.to_be_bytes());
        assert_eq!(encoded[12], 12);
        assert_eq!(&encoded[13..16], &[0xab, 0xcd, 0xef]);
    }

    #[test]
    fn test_thirty_second_block_rejected() {
        let mut sr = SenderReport::new(1);
        for i in 0..31 {
            sr.add_report(ReceptionReport::new(i)).unwrap();
        }
        assert!(matches!(
            sr.add_report(ReceptionReport::new(99)),
            Err(CodecError::OutOfRange { value: 32, max: 31, .. })
        ));
        assert_eq!(sr.reports().len(), 31);
        assert!(sr.reports().iter().all(|r| r.ssrc != 99));
    }

    #[test]
    fn test_set_reports_checks_count() {
        let mut rr = ReceiverReport::new(1);
        let too_many = (0..32).map(ReceptionReport::new).collect();
        assert!(rr.set_reports(too_many).is_err());
        assert!(rr.reports().is_empty());
    }

    #[test]
    fn test_sender_report_round_trip() {
        let mut sr = SenderReport::new(0x0506_0708);
        sr.ntp_timestamp = 0xe5a1_b2c3_8000_0000;
        sr.rtp_timestamp = 90_000;
        sr.packet_count = 100;
        sr.octet_count = 140_000;
        sr.add_report(block(1)).unwrap();
        sr.add_report(block(2)).unwrap();

        let packet = ControlPacket::from(sr);
        let mut encoded = packet.encode();
        assert_eq!(encoded.len(), 28 + 48);
        assert_eq!(encoded[0] & 0x1f, 2);

        assert_eq!(ControlPacket::decode(&mut encoded).unwrap(), packet);
    }

    #[test]
    fn test_missing_blocks_rejected() {
        // count says 1, length only covers the sender ssrc
        let mut buf = Bytes::from_static(&[0x81, 201, 0x00, 0x01, 0, 0, 0, 5]);
        assert!(matches!(
            ControlPacket::decode(&mut buf),
            Err(CodecError::TooShort { needed: 24, actual: 0 })
        ));
    }
}
