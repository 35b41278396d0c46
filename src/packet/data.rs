//! RTP data packet
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           synchronization source (SSRC) identifier            |
//! +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
//! |   extension profile (opt.)    |   extension length in words   |
//! |                  extension data (length * 4)                  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |             contributing source (CSRC) identifiers            |
//! |                             ....                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                payload ...    | padding ... |  pad count      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::{MAX_PAYLOAD_TYPE, RTP_HEADER_SIZE, RTP_VERSION};
use crate::error::CodecError;

/// Maximum number of CSRC entries (4-bit count field)
pub const MAX_CSRC_COUNT: usize = 15;

/// Maximum extension length in 32-bit words (16-bit length field)
pub const MAX_EXTENSION_WORDS: usize = u16::MAX as usize;

/// RTP header extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderExtension {
    /// Profile-defined 16 bits preceding the length word
    pub profile: u16,
    /// Extension body, a whole number of 32-bit words
    pub data: Bytes,
}

/// RTP data packet
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataPacket {
    marker: bool,
    payload_type: u8,
    sequence_number: u16,
    timestamp: u32,
    ssrc: u32,
    csrcs: Vec<u32>,
    extension: Option<HeaderExtension>,
    payload: Bytes,
}

impl DataPacket {
    /// Create a packet carrying `payload` with every header field zeroed
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn marker(&self) -> bool {
        self.marker
    }

    pub fn set_marker(&mut self, marker: bool) {
        self.marker = marker;
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    /// Set payload type, rejecting values outside [0, 127]
    pub fn set_payload_type(&mut self, payload_type: u8) -> Result<(), CodecError> {
        if payload_type > MAX_PAYLOAD_TYPE {
            return Err(CodecError::OutOfRange {
                field: "payload type",
                value: payload_type as usize,
                max: MAX_PAYLOAD_TYPE as usize,
            });
        }
        self.payload_type = payload_type;
        Ok(())
    }

    pub fn sequence_number(&self) -> u16 {
        self.sequence_number
    }

    pub fn set_sequence_number(&mut self, sequence_number: u16) {
        self.sequence_number = sequence_number;
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: u32) {
        self.timestamp = timestamp;
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn set_ssrc(&mut self, ssrc: u32) {
        self.ssrc = ssrc;
    }

    pub fn csrcs(&self) -> &[u32] {
        &self.csrcs
    }

    /// Append a contributing source
    pub fn add_csrc(&mut self, csrc: u32) -> Result<(), CodecError> {
        if self.csrcs.len() >= MAX_CSRC_COUNT {
            return Err(CodecError::OutOfRange {
                field: "CSRC count",
                value: self.csrcs.len() + 1,
                max: MAX_CSRC_COUNT,
            });
        }
        self.csrcs.push(csrc);
        Ok(())
    }

    pub fn extension(&self) -> Option<&HeaderExtension> {
        self.extension.as_ref()
    }

    /// Attach a header extension; `data` must be whole 32-bit words
    pub fn set_extension(&mut self, profile: u16, data: impl Into<Bytes>) -> Result<(), CodecError> {
        let data = data.into();
        if data.len() % 4 != 0 {
            return Err(CodecError::Misaligned {
                field: "extension data",
                value: data.len(),
            });
        }
        if data.len() / 4 > MAX_EXTENSION_WORDS {
            return Err(CodecError::OutOfRange {
                field: "extension words",
                value: data.len() / 4,
                max: MAX_EXTENSION_WORDS,
            });
        }
        self.extension = Some(HeaderExtension { profile, data });
        Ok(())
    }

    pub fn clear_extension(&mut self) {
        self.extension = None;
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: impl Into<Bytes>) {
        self.payload = payload.into();
    }

    /// Payload length in bytes
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Encoded length without padding
    pub fn encoded_len(&self) -> usize {
        let mut size = RTP_HEADER_SIZE + self.csrcs.len() * 4 + self.payload.len();
        if let Some(ext) = &self.extension {
            size += 4 + ext.data.len();
        }
        size
    }

    /// Decode a packet from a datagram
    pub fn decode(mut data: Bytes) -> Result<Self, CodecError> {
        if data.len() < RTP_HEADER_SIZE {
            return Err(CodecError::TooShort {
                needed: RTP_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let b = data.get_u8();
        let version = b >> 6;
        if version != RTP_VERSION {
            return Err(CodecError::InvalidVersion(version));
        }
        let has_padding = b & 0x20 != 0;
        let has_extension = b & 0x10 != 0;
        let csrc_count = (b & 0x0f) as usize;

        let b = data.get_u8();
        let marker = b & 0x80 != 0;
        let payload_type = b & 0x7f;
        let sequence_number = data.get_u16();
        let timestamp = data.get_u32();
        let ssrc = data.get_u32();

        let extension = if has_extension {
            if data.remaining() < 4 {
                return Err(CodecError::Truncated { what: "extension header" });
            }
            let profile = data.get_u16();
            let len = data.get_u16() as usize * 4;
            if data.remaining() < len {
                return Err(CodecError::Truncated { what: "extension data" });
            }
            Some(HeaderExtension {
                profile,
                data: data.split_to(len),
            })
        } else {
            None
        };

        if data.remaining() < csrc_count * 4 {
            return Err(CodecError::Truncated { what: "CSRC list" });
        }
        let csrcs = (0..csrc_count).map(|_| data.get_u32()).collect();

        let payload = if has_padding {
            let pad = match data.last() {
                Some(&pad) => pad as usize,
                None => return Err(CodecError::Truncated { what: "padding" }),
            };
            if pad == 0 || pad > data.len() {
                return Err(CodecError::InvalidLength(format!(
                    "padding count {} with {} bytes remaining",
                    pad,
                    data.len()
                )));
            }
            data.split_to(data.len() - pad)
        } else {
            data
        };

        Ok(Self {
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrcs,
            extension,
            payload,
        })
    }

    /// Encode without padding
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write(&mut buf, 0);
        buf.freeze()
    }

    /// Encode, padding the packet to a multiple of `fixed_block_size`
    pub fn encode_padded(&self, fixed_block_size: usize) -> Result<Bytes, CodecError> {
        if fixed_block_size % 4 != 0 {
            return Err(CodecError::Misaligned {
                field: "fixed block size",
                value: fixed_block_size,
            });
        }
        let size = self.encoded_len();
        let mut padding = 0;
        if fixed_block_size > 0 {
            padding = fixed_block_size - (size % fixed_block_size);
            if padding == fixed_block_size {
                padding = 0;
            }
        }
        if padding > u8::MAX as usize {
            return Err(CodecError::OutOfRange {
                field: "padding",
                value: padding,
                max: u8::MAX as usize,
            });
        }
        let mut buf = BytesMut::with_capacity(size + padding);
        self.write(&mut buf, padding);
        Ok(buf.freeze())
    }

    fn write(&self, buf: &mut BytesMut, padding: usize) {
        let mut b = RTP_VERSION << 6;
        if padding > 0 {
            b |= 0x20;
        }
        if self.extension.is_some() {
            b |= 0x10;
        }
        b |= self.csrcs.len() as u8;
        buf.put_u8(b);

        let mut b = self.payload_type;
        if self.marker {
            b |= 0x80;
        }
        buf.put_u8(b);
        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);

        if let Some(ext) = &self.extension {
            buf.put_u16(ext.profile);
            buf.put_u16((ext.data.len() / 4) as u16);
            buf.put_slice(&ext.data);
        }
        for csrc in &self.csrcs {
            buf.put_u32(*csrc);
        }
        buf.put_slice(&self.payload);

        if padding > 0 {
            buf.put_bytes(0, padding - 1);
            buf.put_u8(padding as u8);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_packet() -> DataPacket {
        let mut packet = DataPacket::new(vec![0x65, 0x88, 0x84, 0x00, 0x33]);
        packet.set_marker(true);
        packet.set_payload_type(96).unwrap();
        packet.set_sequence_number(4711);
        packet.set_timestamp(900_000);
        packet.set_ssrc(0xdead_beef);
        packet
    }

    #[test]
    fn test_header_layout() {
        let encoded = sample_packet().encode();

        assert_eq!(encoded.len(), 17);
        assert_eq!(encoded[0], 0x80);
        assert_eq!(encoded[1], 0x80 | 96);
        assert_eq!(&encoded[2..4], &4711u16.to_be_bytes());
        assert_eq!(&encoded[8..12], &0xdead_beefu32.to_be_bytes());
        assert_eq!(&encoded[12..], &[0x65, 0x88, 0x84, 0x00, 0x33]);
    }

    #[test]
    fn test_decode_rejects_short_buffer() {
        let err = DataPacket::decode(Bytes::from_static(&[0x80; 11])).unwrap_err();
        assert_eq!(err, CodecError::TooShort { needed: 12, actual: 11 });
    }

    #[test]
    fn test_decode_rejects_bad_version() {
        let mut raw = sample_packet().encode().to_vec();
        raw[0] = 0x40;
        let err = DataPacket::decode(Bytes::from(raw)).unwrap_err();
        assert_eq!(err, CodecError::InvalidVersion(1));
    }

    #[test]
    fn test_padding_trimmed_on_decode() {
        let packet = sample_packet();
        let encoded = packet.encode_padded(8).unwrap();

        assert_eq!(encoded.len() % 8, 0);
        assert_eq!(encoded[0] & 0x20, 0x20);
        assert_eq!(*encoded.last().unwrap() as usize, encoded.len() - 17);

        let decoded = DataPacket::decode(encoded).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_padding_collapses_when_aligned() {
        let packet = DataPacket::new(vec![0u8; 4]);
        let encoded = packet.encode_padded(16).unwrap();
        assert_eq!(encoded.len(), 16);
        assert_eq!(encoded[0] & 0x20, 0);
    }

    #[test]
    fn test_padding_block_must_be_word_multiple() {
        assert!(matches!(
            sample_packet().encode_padded(6),
            Err(CodecError::Misaligned { .. })
        ));
    }

    #[test]
    fn test_extension_and_csrcs() {
        let mut packet = sample_packet();
        packet.add_csrc(1).unwrap();
        packet.add_csrc(2).unwrap();
        packet.set_extension(0xbede, vec![1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        let encoded = packet.encode();
        assert_eq!(encoded[0] & 0x1f, 0x10 | 2);

        let decoded = DataPacket::decode(encoded).unwrap();
        assert_eq!(decoded.csrcs(), &[1, 2]);
        assert_eq!(decoded.extension().unwrap().profile, 0xbede);
        assert_eq!(decoded.payload(), packet.payload());
    }

    #[test]
    fn test_extension_must_be_word_aligned() {
        let mut packet = sample_packet();
        assert!(packet.set_extension(1, vec![1, 2, 3]).is_err());
        assert!(packet.extension().is_none());
    }

    #[test]
    fn test_payload_type_range() {
        let mut packet = DataPacket::default();
        assert!(packet.set_payload_type(127).is_ok());
        assert!(packet.set_payload_type(128).is_err());
        assert_eq!(packet.payload_type(), 127);
    }

    #[test]
    fn test_truncated_csrc_list() {
        let mut raw = sample_packet().encode().to_vec();
        raw[0] |= 0x03;
        raw.truncate(14);
        assert!(matches!(
            DataPacket::decode(Bytes::from(raw)),
            Err(CodecError::Truncated { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            marker in any::<bool>(),
            pt in 0u8..=127,
            seq in any::<u16>(),
            ts in any::<u32>(),
            ssrc in any::<u32>(),
            csrcs in proptest::collection::vec(any::<u32>(), 0..=15),
            payload in proptest::collection::vec(any::<u8>(), 0..256),
            block in prop_oneof![Just(0usize), Just(4), Just(16), Just(64)],
        ) {
            let mut packet = DataPacket::new(payload);
            packet.set_marker(marker);
            packet.set_payload_type(pt).unwrap();
            packet.set_sequence_number(seq);
            packet.set_timestamp(ts);
            packet.set_ssrc(ssrc);
            for csrc in csrcs {
                packet.add_csrc(csrc).unwrap();
            }

            let encoded = packet.encode_padded(block).unwrap();
            if block > 0 {
                prop_assert_eq!(encoded.len() % block, 0);
            }
            prop_assert_eq!(DataPacket::decode(encoded).unwrap(), packet);
        }
    }
}
