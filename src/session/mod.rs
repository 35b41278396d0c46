//! RTP sessions
//!
//! A session binds a data and a control transport, tracks participants,
//! fans accepted packets out to listeners and runs the automated RTCP
//! exchange (join, periodic reports, leave).

mod clock;
mod events;
mod listener;
mod rtp_session;
mod timer;

pub use clock::{ntp_timestamp, rtp_timestamp};
pub use events::{SessionEvent, SessionEventListener};
pub use listener::{ControlListener, DataListener};
pub use rtp_session::RtpSession;
