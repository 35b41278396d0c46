//! Packets sharing one media timestamp

use std::collections::BTreeMap;

use super::nal::{NalHeader, NalKind};
use crate::packet::DataPacket;

/// The packets of one access unit, ordered by sequence number
#[derive(Debug, Clone)]
pub struct Frame {
    rtp_timestamp: u32,
    /// Sequence number of the first packet added
    base_sequence: u16,
    /// Keyed by signed distance from `base_sequence`, so a frame straddling
    /// the 16-bit wrap keeps its order
    packets: BTreeMap<i16, (DataPacket, Option<NalHeader>)>,
}

impl Frame {
    pub fn new(packet: DataPacket) -> Self {
        let mut frame = Self {
            rtp_timestamp: packet.timestamp(),
            base_sequence: packet.sequence_number(),
            packets: BTreeMap::new(),
        };
        frame.add_packet(packet);
        frame
    }

    /// Add a packet; a repeated sequence number replaces the earlier copy
    pub fn add_packet(&mut self, packet: DataPacket) {
        let header = NalHeader::parse(packet.payload());
        let offset = packet.sequence_number().wrapping_sub(self.base_sequence) as i16;
        self.packets.insert(offset, (packet, header));
    }

    pub fn rtp_timestamp(&self) -> u32 {
        self.rtp_timestamp
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Packets in ascending sequence order
    pub fn packets(&self) -> impl Iterator<Item = &DataPacket> {
        self.packets.values().map(|(packet, _)| packet)
    }

    pub fn into_packets(self) -> Vec<DataPacket> {
        self.packets.into_values().map(|(packet, _)| packet).collect()
    }

    /// A FULL or AGGREGATE packet completes the frame at once. Fragments
    /// complete it when start and end are present with nothing missing
    /// between them.
    pub fn is_complete(&self) -> bool {
        let mut start = None;
        for (offset, (_, header)) in &self.packets {
            let Some(header) = header else {
                continue;
            };
            match header.kind {
                NalKind::Full | NalKind::Aggregate => return true,
                NalKind::Fragment => {
                    if header.is_start() {
                        start = Some(*offset);
                    }
                    if header.is_end() {
                        return match start {
                            Some(start) => {
                                (*offset as i32 - start as i32) as usize + 1 == self.packets.len()
                            }
                            None => false,
                        };
                    }
                }
                NalKind::Unknown => {}
            }
        }
        false
    }
}
