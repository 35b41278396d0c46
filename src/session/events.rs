//! Session events
//!
//! Events go to registered listeners in registration order and to every
//! broadcast subscriber.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::participant::{ParticipantEventListener, RtpParticipant};

/// Broadcast channel capacity
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted by a session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Unknown source appeared through a data packet
    ParticipantJoinedFromData(Arc<RtpParticipant>),
    /// Unknown source appeared through an SDES chunk
    ParticipantJoinedFromControl(Arc<RtpParticipant>),
    /// SDES changed a participant's description
    ParticipantDataUpdated(Arc<RtpParticipant>),
    /// Participant sent a BYE
    ParticipantLeft(Arc<RtpParticipant>),
    /// Participant evicted by database cleanup
    ParticipantDeleted(Arc<RtpParticipant>),
    /// Local SSRC changed after a collision
    ResolvedSsrcConflict { old: u32, new: u32 },
    /// Single-peer session keeps seeing a different remote SSRC
    SsrcChanged,
    /// Session stopped; `cause` is set when stopped by loop detection
    Terminated { cause: Option<String> },
}

/// Receives session events
pub trait SessionEventListener: Send + Sync {
    fn session_event(&self, session_id: &str, event: &SessionEvent);
}

impl<F> SessionEventListener for F
where
    F: Fn(&str, &SessionEvent) + Send + Sync,
{
    fn session_event(&self, session_id: &str, event: &SessionEvent) {
        self(session_id, event)
    }
}

/// Fan-out point for session events. Also receives database membership
/// changes so they surface as session events.
pub(crate) struct EventBus {
    session_id: String,
    listeners: RwLock<Vec<Arc<dyn SessionEventListener>>>,
    event_tx: broadcast::Sender<SessionEvent>,
    _event_rx: broadcast::Receiver<SessionEvent>,
}

impl EventBus {
    pub(crate) fn new(session_id: impl Into<String>) -> Self {
        let (event_tx, event_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            session_id: session_id.into(),
            listeners: RwLock::new(Vec::new()),
            event_tx,
            _event_rx: event_rx,
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    pub(crate) fn add_listener(&self, listener: Arc<dyn SessionEventListener>) {
        self.listeners.write().push(listener);
    }

    pub(crate) fn remove_listener(&self, listener: &Arc<dyn SessionEventListener>) {
        self.listeners.write().retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub(crate) fn clear(&self) {
        self.listeners.write().clear();
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            listener.session_event(&self.session_id, &event);
        }
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }
}

impl ParticipantEventListener for EventBus {
    fn participant_created_from_sdes_chunk(&self, participant: &Arc<RtpParticipant>) {
        self.emit(SessionEvent::ParticipantJoinedFromControl(Arc::clone(participant)));
    }

    fn participant_created_from_data_packet(&self, participant: &Arc<RtpParticipant>) {
        self.emit(SessionEvent::ParticipantJoinedFromData(Arc::clone(participant)));
    }

    fn participant_deleted(&self, participant: &Arc<RtpParticipant>) {
        self.emit(SessionEvent::ParticipantDeleted(Arc::clone(participant)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_listeners_and_subscribers_both_receive() {
        let bus = EventBus::new("s1");
        let mut rx = bus.subscribe();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.add_listener(Arc::new(move |id: &str, event: &SessionEvent| {
            sink.lock().push(format!("{}:{:?}", id, event));
        }));

        bus.emit(SessionEvent::SsrcChanged);

        assert_eq!(seen.lock().as_slice(), ["s1:SsrcChanged"]);
        assert!(matches!(rx.try_recv().unwrap(), SessionEvent::SsrcChanged));
    }

    #[test]
    fn test_remove_listener() {
        let bus = EventBus::new("s1");
        let seen = Arc::new(Mutex::new(0));
        let sink = seen.clone();
        let listener: Arc<dyn SessionEventListener> =
            Arc::new(move |_: &str, _: &SessionEvent| *sink.lock() += 1);
        bus.add_listener(listener.clone());
        bus.emit(SessionEvent::SsrcChanged);
        bus.remove_listener(&listener);
        bus.emit(SessionEvent::SsrcChanged);
        assert_eq!(*seen.lock(), 1);
    }
}
