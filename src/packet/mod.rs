//! RTP and RTCP wire format
//!
//! Every RTCP packet starts with the same 32-bit header:
//!
//! ```text
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|  count  |      PT       |   length (words - 1)          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

mod app;
mod bye;
mod compound;
mod data;
mod report;
mod sdes;

pub use app::AppData;
pub use bye::Bye;
pub use compound::CompoundControlPacket;
pub use data::{DataPacket, HeaderExtension, MAX_CSRC_COUNT, MAX_EXTENSION_WORDS};
pub use report::{ReceiverReport, ReceptionReport, SenderReport, MAX_CUMULATIVE_LOST};
pub use sdes::{SdesChunk, SdesItem, SdesItemType, SourceDescription};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::{
    MAX_RTCP_COUNT, RTCP_APP_DATA, RTCP_BYE, RTCP_HEADER_SIZE, RTCP_RECEIVER_REPORT,
    RTCP_SENDER_REPORT, RTCP_SOURCE_DESCRIPTION, RTP_VERSION,
};
use crate::error::CodecError;

/// RTCP packet type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlPacketType {
    SenderReport = RTCP_SENDER_REPORT,
    ReceiverReport = RTCP_RECEIVER_REPORT,
    SourceDescription = RTCP_SOURCE_DESCRIPTION,
    Bye = RTCP_BYE,
    AppData = RTCP_APP_DATA,
}

impl TryFrom<u8> for ControlPacketType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            RTCP_SENDER_REPORT => Ok(Self::SenderReport),
            RTCP_RECEIVER_REPORT => Ok(Self::ReceiverReport),
            RTCP_SOURCE_DESCRIPTION => Ok(Self::SourceDescription),
            RTCP_BYE => Ok(Self::Bye),
            RTCP_APP_DATA => Ok(Self::AppData),
            other => Err(CodecError::UnknownPacketType(other)),
        }
    }
}

/// A single RTCP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPacket {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    SourceDescription(SourceDescription),
    Bye(Bye),
    AppData(AppData),
}

impl ControlPacket {
    pub fn packet_type(&self) -> ControlPacketType {
        match self {
            Self::SenderReport(_) => ControlPacketType::SenderReport,
            Self::ReceiverReport(_) => ControlPacketType::ReceiverReport,
            Self::SourceDescription(_) => ControlPacketType::SourceDescription,
            Self::Bye(_) => ControlPacketType::Bye,
            Self::AppData(_) => ControlPacketType::AppData,
        }
    }

    /// Value of the 5-bit count field
    fn count(&self) -> u8 {
        match self {
            Self::SenderReport(sr) => sr.reports().len() as u8,
            Self::ReceiverReport(rr) => rr.reports().len() as u8,
            Self::SourceDescription(sdes) => sdes.chunks().len() as u8,
            Self::Bye(bye) => bye.ssrcs().len() as u8,
            Self::AppData(app) => app.subtype(),
        }
    }

    fn body_len(&self) -> usize {
        match self {
            Self::SenderReport(sr) => sr.body_len(),
            Self::ReceiverReport(rr) => rr.body_len(),
            Self::SourceDescription(sdes) => sdes.body_len(),
            Self::Bye(bye) => bye.body_len(),
            Self::AppData(app) => app.body_len(),
        }
    }

    fn write_body(&self, buf: &mut BytesMut) {
        match self {
            Self::SenderReport(sr) => sr.write_body(buf),
            Self::ReceiverReport(rr) => rr.write_body(buf),
            Self::SourceDescription(sdes) => sdes.write_body(buf),
            Self::Bye(bye) => bye.write_body(buf),
            Self::AppData(app) => app.write_body(buf),
        }
    }

    /// Encoded length without padding
    pub fn encoded_len(&self) -> usize {
        RTCP_HEADER_SIZE + self.body_len()
    }

    /// Encode without padding
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write(&mut buf, 0);
        buf.freeze()
    }

    /// Encode with padding so that `current_compound_length` plus this
    /// packet ends on a `fixed_block_size` boundary
    pub fn encode_padded(
        &self,
        current_compound_length: usize,
        fixed_block_size: usize,
    ) -> Result<Bytes, CodecError> {
        let size = self.encoded_len();
        let padding = padding_for(size, current_compound_length, fixed_block_size)?;
        let mut buf = BytesMut::with_capacity(size + padding);
        self.write(&mut buf, padding);
        Ok(buf.freeze())
    }

    fn write(&self, buf: &mut BytesMut, padding: usize) {
        let total = self.encoded_len() + padding;
        let mut b = RTP_VERSION << 6;
        if padding > 0 {
            b |= 0x20;
        }
        b |= self.count() & 0x1f;
        buf.put_u8(b);
        buf.put_u8(self.packet_type() as u8);
        buf.put_u16((total / 4 - 1) as u16);

        self.write_body(buf);

        if padding > 0 {
            buf.put_bytes(0, padding - 1);
            buf.put_u8(padding as u8);
        }
    }

    /// Decode one packet from the front of `buf`.
    ///
    /// The packet's bytes are consumed even when its body turns out to be
    /// malformed, so the caller can continue with the next sibling.
    /// Returns `TooShort` when not even a header is left.
    pub fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        if buf.len() < RTCP_HEADER_SIZE {
            return Err(CodecError::TooShort {
                needed: RTCP_HEADER_SIZE,
                actual: buf.len(),
            });
        }

        let first = buf[0];
        let packet_type = buf[1];
        let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let total = RTCP_HEADER_SIZE + length * 4;

        if buf.len() < total {
            buf.advance(buf.len());
            return Err(CodecError::Truncated { what: "RTCP packet" });
        }
        let mut packet = buf.split_to(total);
        packet.advance(RTCP_HEADER_SIZE);

        let version = first >> 6;
        if version != RTP_VERSION {
            return Err(CodecError::InvalidVersion(version));
        }
        let has_padding = first & 0x20 != 0;
        let count = first & 0x1f;
        let packet_type = ControlPacketType::try_from(packet_type)?;

        // only an SDES or BYE listing no sources may be a bare header
        let may_be_empty = count == 0
            && matches!(
                packet_type,
                ControlPacketType::SourceDescription | ControlPacketType::Bye
            );
        if length == 0 && !(may_be_empty && !has_padding) {
            return Err(CodecError::InvalidLength(
                "RTCP packet without body".to_string(),
            ));
        }

        if has_padding {
            let pad = match packet.last() {
                Some(&pad) => pad as usize,
                None => return Err(CodecError::Truncated { what: "padding" }),
            };
            if pad == 0 || pad > packet.len() {
                return Err(CodecError::InvalidLength(format!(
                    "padding count {} with {} body bytes",
                    pad,
                    packet.len()
                )));
            }
            packet.truncate(packet.len() - pad);
        }

        match packet_type {
            ControlPacketType::SenderReport => {
                SenderReport::decode(count, &mut packet).map(Self::SenderReport)
            }
            ControlPacketType::ReceiverReport => {
                ReceiverReport::decode(count, &mut packet).map(Self::ReceiverReport)
            }
            ControlPacketType::SourceDescription => {
                SourceDescription::decode(count, &mut packet).map(Self::SourceDescription)
            }
            ControlPacketType::Bye => Bye::decode(count, &mut packet).map(Self::Bye),
            ControlPacketType::AppData => AppData::decode(count, &mut packet).map(Self::AppData),
        }
    }
}

impl From<SenderReport> for ControlPacket {
    fn from(p: SenderReport) -> Self {
        Self::SenderReport(p)
    }
}

impl From<ReceiverReport> for ControlPacket {
    fn from(p: ReceiverReport) -> Self {
        Self::ReceiverReport(p)
    }
}

impl From<SourceDescription> for ControlPacket {
    fn from(p: SourceDescription) -> Self {
        Self::SourceDescription(p)
    }
}

impl From<Bye> for ControlPacket {
    fn from(p: Bye) -> Self {
        Self::Bye(p)
    }
}

impl From<AppData> for ControlPacket {
    fn from(p: AppData) -> Self {
        Self::AppData(p)
    }
}

/// Padding bytes needed to end on a block boundary. Zero means none.
pub(crate) fn padding_for(
    size: usize,
    current_compound_length: usize,
    fixed_block_size: usize,
) -> Result<usize, CodecError> {
    if current_compound_length % 4 != 0 {
        return Err(CodecError::Misaligned {
            field: "current compound length",
            value: current_compound_length,
        });
    }
    if fixed_block_size % 4 != 0 {
        return Err(CodecError::Misaligned {
            field: "fixed block size",
            value: fixed_block_size,
        });
    }
    if fixed_block_size == 0 {
        return Ok(0);
    }

    let padding = fixed_block_size - ((size + current_compound_length) % fixed_block_size);
    let padding = if padding == fixed_block_size { 0 } else { padding };
    if padding > u8::MAX as usize {
        return Err(CodecError::OutOfRange {
            field: "padding",
            value: padding,
            max: u8::MAX as usize,
        });
    }
    Ok(padding)
}

/// Reject a list that would overflow the 5-bit count field
pub(crate) fn check_count(field: &'static str, len: usize) -> Result<(), CodecError> {
    if len > MAX_RTCP_COUNT {
        return Err(CodecError::OutOfRange {
            field,
            value: len,
            max: MAX_RTCP_COUNT,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_type_conversion() {
        assert_eq!(
            ControlPacketType::try_from(200).unwrap(),
            ControlPacketType::SenderReport
        );
        assert_eq!(ControlPacketType::try_from(204).unwrap(), ControlPacketType::AppData);
        assert_eq!(
            ControlPacketType::try_from(199).unwrap_err(),
            CodecError::UnknownPacketType(199)
        );
    }

    #[test]
    fn test_padding_formula() {
        assert_eq!(padding_for(20, 0, 0).unwrap(), 0);
        assert_eq!(padding_for(20, 0, 16).unwrap(), 12);
        assert_eq!(padding_for(20, 12, 16).unwrap(), 0);
        assert_eq!(padding_for(8, 4, 32).unwrap(), 20);
    }

    #[test]
    fn test_padding_arguments_must_be_aligned() {
        assert!(matches!(
            padding_for(8, 2, 16),
            Err(CodecError::Misaligned { field: "current compound length", .. })
        ));
        assert!(matches!(
            padding_for(8, 0, 10),
            Err(CodecError::Misaligned { field: "fixed block size", .. })
        ));
    }

    #[test]
    fn test_header_words() {
        let mut rr = ReceiverReport::new(0x0102_0304);
        rr.add_report(ReceptionReport::new(7)).unwrap();
        let encoded = ControlPacket::from(rr).encode();

        assert_eq!(encoded.len(), 32);
        assert_eq!(encoded[0], 0x81);
        assert_eq!(encoded[1], 201);
        assert_eq!(u16::from_be_bytes([encoded[2], encoded[3]]), 7);
    }

    #[test]
    fn test_padded_packet_decodes_same() {
        let packet = ControlPacket::from(Bye::new(vec![42]).unwrap());
        let encoded = packet.encode_padded(0, 32).unwrap();
        assert_eq!(encoded.len(), 32);
        assert_eq!(encoded[0] & 0x20, 0x20);

        let mut buf = encoded;
        assert_eq!(ControlPacket::decode(&mut buf).unwrap(), packet);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_rejects_version() {
        let mut raw = ControlPacket::from(ReceiverReport::new(1)).encode().to_vec();
        raw[0] = (raw[0] & 0x3f) | 0x40;
        let mut buf = Bytes::from(raw);
        assert_eq!(
            ControlPacket::decode(&mut buf).unwrap_err(),
            CodecError::InvalidVersion(1)
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_consumes_unknown_type() {
        let mut raw = vec![0x80, 199, 0x00, 0x01, 1, 2, 3, 4];
        raw.extend_from_slice(&ControlPacket::from(ReceiverReport::new(9)).encode());
        let mut buf = Bytes::from(raw);

        assert_eq!(
            ControlPacket::decode(&mut buf).unwrap_err(),
            CodecError::UnknownPacketType(199)
        );
        let next = ControlPacket::decode(&mut buf).unwrap();
        assert_eq!(next.packet_type(), ControlPacketType::ReceiverReport);
    }

    #[test]
    fn test_decode_rejects_zero_length() {
        // an SDES claiming one chunk
        let mut buf = Bytes::from_static(&[0x81, 202, 0x00, 0x00]);
        assert!(matches!(
            ControlPacket::decode(&mut buf),
            Err(CodecError::InvalidLength(_))
        ));
        assert!(buf.is_empty());

        let mut buf = Bytes::from_static(&[0x80, 201, 0x00, 0x00]);
        assert!(matches!(
            ControlPacket::decode(&mut buf),
            Err(CodecError::InvalidLength(_))
        ));
    }

    #[test]
    fn test_empty_sdes_and_bye_round_trip() {
        for packet in [
            ControlPacket::from(SourceDescription::new()),
            ControlPacket::from(Bye::new(vec![]).unwrap()),
        ] {
            let encoded = packet.encode();
            assert_eq!(encoded.len(), RTCP_HEADER_SIZE);
            assert_eq!(encoded[0], 0x80);

            let mut buf = encoded;
            assert_eq!(ControlPacket::decode(&mut buf).unwrap(), packet);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_decode_truncated_length() {
        let mut buf = Bytes::from_static(&[0x81, 201, 0x00, 0x07, 0, 0, 0, 1]);
        assert_eq!(
            ControlPacket::decode(&mut buf).unwrap_err(),
            CodecError::Truncated { what: "RTCP packet" }
        );
        assert!(buf.is_empty());
    }
}
