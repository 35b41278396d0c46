//! Compound RTCP packets
//!
//! A datagram on the control channel carries one or more RTCP packets back
//! to back. Decoding is lenient: a malformed member is skipped and its
//! siblings are still delivered.

use bytes::{Bytes, BytesMut};

use super::ControlPacket;
use crate::error::CodecError;

/// Non-empty, ordered list of control packets sent as one datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompoundControlPacket {
    packets: Vec<ControlPacket>,
}

impl CompoundControlPacket {
    pub fn new(packets: Vec<ControlPacket>) -> Result<Self, CodecError> {
        if packets.is_empty() {
            return Err(CodecError::InvalidLength(
                "compound packet needs at least one RTCP packet".to_string(),
            ));
        }
        Ok(Self { packets })
    }

    /// Convenience for the usual report + SDES pairing
    pub fn pair(first: impl Into<ControlPacket>, second: impl Into<ControlPacket>) -> Self {
        Self {
            packets: vec![first.into(), second.into()],
        }
    }

    pub fn packets(&self) -> &[ControlPacket] {
        &self.packets
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn into_packets(self) -> Vec<ControlPacket> {
        self.packets
    }

    /// Encode all members back to back
    pub fn encode(&self) -> Bytes {
        let size = self.packets.iter().map(ControlPacket::encoded_len).sum();
        let mut buf = BytesMut::with_capacity(size);
        for packet in &self.packets {
            buf.extend_from_slice(&packet.encode());
        }
        buf.freeze()
    }

    /// Encode with the last member padded so the whole datagram ends on a
    /// `fixed_block_size` boundary
    pub fn encode_padded(&self, fixed_block_size: usize) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        let last = self.packets.len() - 1;
        for (i, packet) in self.packets.iter().enumerate() {
            if i == last {
                buf.extend_from_slice(&packet.encode_padded(buf.len(), fixed_block_size)?);
            } else {
                buf.extend_from_slice(&packet.encode());
            }
        }
        Ok(buf.freeze())
    }

    /// Decode a datagram. Returns `None` when the length is not a multiple
    /// of four or no member could be decoded.
    pub fn decode(mut data: Bytes) -> Option<Self> {
        if data.len() % 4 != 0 {
            tracing::debug!(
                "Invalid RTCP packet received: total length should be multiple of 4 but is {}",
                data.len()
            );
            return None;
        }

        let mut packets = Vec::with_capacity(2);
        while !data.is_empty() {
            match ControlPacket::decode(&mut data) {
                Ok(packet) => packets.push(packet),
                Err(CodecError::TooShort { .. }) if data.len() < 4 => break,
                Err(e) => tracing::debug!("Skipping malformed RTCP packet: {}", e),
            }
        }

        if packets.is_empty() {
            None
        } else {
            Some(Self { packets })
        }
    }
}
