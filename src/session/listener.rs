//! Data and control listener contracts

use crate::packet::{AppData, CompoundControlPacket, DataPacket};
use crate::participant::ParticipantInfo;

/// Receives accepted data packets
pub trait DataListener: Send + Sync {
    fn data_packet_received(&self, participant: &ParticipantInfo, packet: &DataPacket);
}

impl<F> DataListener for F
where
    F: Fn(&ParticipantInfo, &DataPacket) + Send + Sync,
{
    fn data_packet_received(&self, participant: &ParticipantInfo, packet: &DataPacket) {
        self(participant, packet)
    }
}

/// Receives control traffic.
///
/// With automated RTCP handling the session consumes reports, SDES and BYE
/// itself and only APP packets reach `app_data_received`. Without it every
/// compound packet is forwarded verbatim to `control_packet_received`.
pub trait ControlListener: Send + Sync {
    fn control_packet_received(&self, packet: &CompoundControlPacket);

    fn app_data_received(&self, _packet: &AppData) {}
}
