//! Session participants and their bookkeeping

mod database;
mod info;
mod rtp_participant;
mod stats;

pub use database::{
    DefaultParticipantDatabase, ParticipantDatabase, ParticipantEventListener,
    SingleParticipantDatabase,
};
pub use info::ParticipantInfo;
pub use rtp_participant::RtpParticipant;
pub use stats::ReceptionStats;
