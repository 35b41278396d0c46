//! Participant databases
//!
//! Receivers are participants we send to. Members are every source we have
//! heard from, keyed by SSRC. A receiver is promoted into the members map
//! once traffic from it is matched by address or CNAME.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::RtpParticipant;
use crate::constants::{DEFAULT_TIMEOUT_AFTER_BYE_SECS, DEFAULT_TIMEOUT_NO_PACKETS_SECS};
use crate::packet::{DataPacket, SdesChunk};

/// Membership changes raised by a database
pub trait ParticipantEventListener: Send + Sync {
    fn participant_created_from_sdes_chunk(&self, participant: &Arc<RtpParticipant>);

    fn participant_created_from_data_packet(&self, participant: &Arc<RtpParticipant>);

    fn participant_deleted(&self, participant: &Arc<RtpParticipant>);
}

/// Storage and lookup of session participants
pub trait ParticipantDatabase: Send + Sync {
    fn id(&self) -> &str;

    /// Snapshot of the receiver list
    fn receivers(&self) -> Vec<Arc<RtpParticipant>>;

    /// Snapshot of the members map
    fn members(&self) -> HashMap<u32, Arc<RtpParticipant>>;

    /// Run `op` on every receiver under the read lock
    fn do_with_receivers(&self, op: &mut dyn FnMut(&Arc<RtpParticipant>));

    /// Run `op` on every member under the read lock
    fn do_with_participants(&self, op: &mut dyn FnMut(&Arc<RtpParticipant>));

    fn add_receiver(&self, participant: Arc<RtpParticipant>) -> bool;

    fn remove_receiver(&self, participant: &Arc<RtpParticipant>) -> bool;

    fn participant(&self, ssrc: u32) -> Option<Arc<RtpParticipant>>;

    fn get_or_create_from_data_packet(
        &self,
        origin: SocketAddr,
        packet: &DataPacket,
    ) -> Option<Arc<RtpParticipant>>;

    fn get_or_create_from_sdes_chunk(
        &self,
        origin: SocketAddr,
        chunk: &SdesChunk,
    ) -> Option<Arc<RtpParticipant>>;

    fn receiver_count(&self) -> usize;

    fn participant_count(&self) -> usize;

    /// Evict participants that went quiet
    fn cleanup(&self);
}

#[derive(Default)]
struct Members {
    receivers: Vec<Arc<RtpParticipant>>,
    by_ssrc: HashMap<u32, Arc<RtpParticipant>>,
}

/// Dynamic multi-participant database with timeout eviction
pub struct DefaultParticipantDatabase {
    id: String,

    listener: Arc<dyn ParticipantEventListener>,

    timeout_after_no_packets: Duration,

    timeout_after_bye: Duration,

    inner: RwLock<Members>,
}

impl DefaultParticipantDatabase {
    pub fn new(id: impl Into<String>, listener: Arc<dyn ParticipantEventListener>) -> Self {
        Self {
            id: id.into(),
            listener,
            timeout_after_no_packets: Duration::from_secs(DEFAULT_TIMEOUT_NO_PACKETS_SECS),
            timeout_after_bye: Duration::from_secs(DEFAULT_TIMEOUT_AFTER_BYE_SECS),
            inner: RwLock::new(Members::default()),
        }
    }

    pub fn with_timeouts(mut self, after_no_packets: Duration, after_bye: Duration) -> Self {
        self.timeout_after_no_packets = after_no_packets;
        self.timeout_after_bye = after_bye;
        self
    }

    /// Evict as if the current time were `now`
    pub fn cleanup_at(&self, now: Instant) {
        let mut removed = Vec::new();
        {
            let mut inner = self.inner.write();
            let Members { receivers, by_ssrc } = &mut *inner;
            by_ssrc.retain(|_, participant| {
                let silent = participant.silent_for(now);
                let after_bye = participant.has_received_bye() && silent > self.timeout_after_bye;
                let timed_out = silent > self.timeout_after_no_packets;
                if !(after_bye || timed_out) {
                    return true;
                }

                if after_bye {
                    tracing::trace!(
                        "Removed {} from session with id '{}' after reception of BYE and {}s of inactivity.",
                        participant,
                        self.id,
                        self.timeout_after_bye.as_secs()
                    );
                } else {
                    tracing::trace!(
                        "Removed {} from session with id '{}' after {}s of inactivity.",
                        participant,
                        self.id,
                        self.timeout_after_no_packets.as_secs()
                    );
                }
                if participant.is_receiver() {
                    receivers.retain(|r| !Arc::ptr_eq(r, participant));
                }
                // the same participant may sit under several SSRCs
                if !removed.iter().any(|r: &Arc<RtpParticipant>| Arc::ptr_eq(r, participant)) {
                    removed.push(Arc::clone(participant));
                }
                false
            });
        }

        for participant in &removed {
            self.listener.participant_deleted(participant);
        }
    }
}

fn same_cname(a: &RtpParticipant, b: &RtpParticipant) -> bool {
    match (a.cname(), b.cname()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

impl ParticipantDatabase for DefaultParticipantDatabase {
    fn id(&self) -> &str {
        &self.id
    }

    fn receivers(&self) -> Vec<Arc<RtpParticipant>> {
        self.inner.read().receivers.clone()
    }

    fn members(&self) -> HashMap<u32, Arc<RtpParticipant>> {
        self.inner.read().by_ssrc.clone()
    }

    fn do_with_receivers(&self, op: &mut dyn FnMut(&Arc<RtpParticipant>)) {
        let inner = self.inner.read();
        for receiver in &inner.receivers {
            op(receiver);
        }
    }

    fn do_with_participants(&self, op: &mut dyn FnMut(&Arc<RtpParticipant>)) {
        let inner = self.inner.read();
        for member in inner.by_ssrc.values() {
            op(member);
        }
    }

    fn add_receiver(&self, participant: Arc<RtpParticipant>) -> bool {
        if !participant.is_receiver() {
            return false;
        }

        let mut inner = self.inner.write();
        let existing = inner.by_ssrc.values().find(|member| {
            let same_destinations = member.data_destination() == participant.data_destination()
                && member.control_destination() == participant.control_destination();
            same_destinations || same_cname(member, &participant)
        });

        match existing.cloned() {
            Some(member) => inner.receivers.push(member),
            None => inner.receivers.push(participant),
        }
        true
    }

    fn remove_receiver(&self, participant: &Arc<RtpParticipant>) -> bool {
        let mut inner = self.inner.write();
        match inner.receivers.iter().position(|r| Arc::ptr_eq(r, participant)) {
            Some(index) => {
                inner.receivers.remove(index);
                true
            }
            None => false,
        }
    }

    fn participant(&self, ssrc: u32) -> Option<Arc<RtpParticipant>> {
        self.inner.read().by_ssrc.get(&ssrc).cloned()
    }

    fn get_or_create_from_data_packet(
        &self,
        origin: SocketAddr,
        packet: &DataPacket,
    ) -> Option<Arc<RtpParticipant>> {
        let ssrc = packet.ssrc();
        let (participant, created) = {
            let mut inner = self.inner.write();
            if let Some(existing) = inner.by_ssrc.get(&ssrc) {
                return Some(Arc::clone(existing));
            }

            let receiver = inner
                .receivers
                .iter()
                .find(|r| r.data_destination() == Some(origin))
                .cloned();
            let (participant, created) = match receiver {
                Some(receiver) => {
                    receiver.set_ssrc(ssrc);
                    receiver.set_last_data_origin(origin);
                    (receiver, false)
                }
                None => (Arc::new(RtpParticipant::from_data_packet(origin, packet)), true),
            };
            inner.by_ssrc.insert(ssrc, Arc::clone(&participant));
            (participant, created)
        };

        if created {
            self.listener.participant_created_from_data_packet(&participant);
        }
        Some(participant)
    }

    fn get_or_create_from_sdes_chunk(
        &self,
        origin: SocketAddr,
        chunk: &SdesChunk,
    ) -> Option<Arc<RtpParticipant>> {
        let (participant, created) = {
            let mut inner = self.inner.write();
            if let Some(existing) = inner.by_ssrc.get(&chunk.ssrc) {
                return Some(Arc::clone(existing));
            }

            let chunk_cname = chunk.cname();
            let receiver = inner
                .receivers
                .iter()
                .find(|r| {
                    let same_cname =
                        chunk_cname.is_some() && r.cname().as_deref() == chunk_cname;
                    r.control_destination() == Some(origin) || same_cname
                })
                .cloned();
            let (participant, created) = match receiver {
                Some(receiver) => {
                    receiver.set_ssrc(chunk.ssrc);
                    receiver.set_last_control_origin(origin);
                    receiver.mark_received_sdes();
                    receiver.update_from_sdes_chunk(chunk);
                    (receiver, false)
                }
                None => (Arc::new(RtpParticipant::from_sdes_chunk(origin, chunk)), true),
            };
            inner.by_ssrc.insert(chunk.ssrc, Arc::clone(&participant));
            (participant, created)
        };

        if created {
            self.listener.participant_created_from_sdes_chunk(&participant);
        }
        Some(participant)
    }

    fn receiver_count(&self) -> usize {
        self.inner.read().receivers.len()
    }

    fn participant_count(&self) -> usize {
        self.inner.read().by_ssrc.len()
    }

    fn cleanup(&self) {
        self.cleanup_at(Instant::now());
    }
}

/// Database holding exactly one fixed remote peer
pub struct SingleParticipantDatabase {
    id: String,
    participant: Arc<RtpParticipant>,
}

impl SingleParticipantDatabase {
    pub fn new(id: impl Into<String>, participant: Arc<RtpParticipant>) -> Self {
        Self {
            id: id.into(),
            participant,
        }
    }

    pub fn remote(&self) -> &Arc<RtpParticipant> {
        &self.participant
    }

    fn matching(&self, ssrc: u32) -> Option<Arc<RtpParticipant>> {
        (self.participant.ssrc() == ssrc).then(|| Arc::clone(&self.participant))
    }
}

impl ParticipantDatabase for SingleParticipantDatabase {
    fn id(&self) -> &str {
        &self.id
    }

    fn receivers(&self) -> Vec<Arc<RtpParticipant>> {
        vec![Arc::clone(&self.participant)]
    }

    fn members(&self) -> HashMap<u32, Arc<RtpParticipant>> {
        HashMap::from([(self.participant.ssrc(), Arc::clone(&self.participant))])
    }

    fn do_with_receivers(&self, op: &mut dyn FnMut(&Arc<RtpParticipant>)) {
        op(&self.participant);
    }

    fn do_with_participants(&self, op: &mut dyn FnMut(&Arc<RtpParticipant>)) {
        op(&self.participant);
    }

    fn add_receiver(&self, participant: Arc<RtpParticipant>) -> bool {
        Arc::ptr_eq(&participant, &self.participant)
    }

    fn remove_receiver(&self, _participant: &Arc<RtpParticipant>) -> bool {
        false
    }

    fn participant(&self, ssrc: u32) -> Option<Arc<RtpParticipant>> {
        self.matching(ssrc)
    }

    fn get_or_create_from_data_packet(
        &self,
        _origin: SocketAddr,
        packet: &DataPacket,
    ) -> Option<Arc<RtpParticipant>> {
        self.matching(packet.ssrc())
    }

    fn get_or_create_from_sdes_chunk(
        &self,
        _origin: SocketAddr,
        chunk: &SdesChunk,
    ) -> Option<Arc<RtpParticipant>> {
        self.matching(chunk.ssrc)
    }

    fn receiver_count(&self) -> usize {
        1
    }

    fn participant_count(&self) -> usize {
        1
    }

    fn cleanup(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::SdesItem;
    use crate::participant::ParticipantInfo;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(&'static str, u32)>>,
    }

    impl ParticipantEventListener for Recorder {
        fn participant_created_from_sdes_chunk(&self, p: &Arc<RtpParticipant>) {
            self.events.lock().push(("sdes", p.ssrc()));
        }

        fn participant_created_from_data_packet(&self, p: &Arc<RtpParticipant>) {
            self.events.lock().push(("data", p.ssrc()));
        }

        fn participant_deleted(&self, p: &Arc<RtpParticipant>) {
            self.events.lock().push(("deleted", p.ssrc()));
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn data_packet(ssrc: u32) -> DataPacket {
        let mut packet = DataPacket::new(vec![0u8; 4]);
        packet.set_ssrc(ssrc);
        packet
    }

    fn database() -> (Arc<Recorder>, DefaultParticipantDatabase) {
        let recorder = Arc::new(Recorder::default());
        let db = DefaultParticipantDatabase::new("test", recorder.clone());
        (recorder, db)
    }

    #[test]
    fn test_add_receiver_requires_destinations() {
        let (_, db) = database();
        let member = Arc::new(RtpParticipant::from_data_packet(addr(1), &data_packet(1)));
        assert!(!db.add_receiver(member));

        let receiver = Arc::new(RtpParticipant::receiver(
            ParticipantInfo::new(2),
            addr(5000),
            addr(5001),
        ));
        assert!(db.add_receiver(receiver.clone()));
        assert_eq!(db.receiver_count(), 1);
        assert!(db.remove_receiver(&receiver));
        assert!(!db.remove_receiver(&receiver));
    }

    #[test]
    fn test_data_from_receiver_address_promotes_receiver() {
        let (recorder, db) = database();
        let receiver = Arc::new(RtpParticipant::receiver(
            ParticipantInfo::new(0),
            addr(5000),
            addr(5001),
        ));
        db.add_receiver(receiver.clone());

        let found = db
            .get_or_create_from_data_packet(addr(5000), &data_packet(1234))
            .unwrap();
        assert!(Arc::ptr_eq(&found, &receiver));
        assert_eq!(receiver.ssrc(), 1234);
        assert_eq!(db.participant_count(), 1);
        assert!(recorder.events.lock().is_empty());
    }

    #[test]
    fn test_unknown_data_creates_member() {
        let (recorder, db) = database();
        let created = db
            .get_or_create_from_data_packet(addr(7000), &data_packet(55))
            .unwrap();
        assert!(!created.is_receiver());
        assert_eq!(db.receiver_count(), 0);

        let again = db
            .get_or_create_from_data_packet(addr(7000), &data_packet(55))
            .unwrap();
        assert!(Arc::ptr_eq(&created, &again));
        assert_eq!(*recorder.events.lock(), vec![("data", 55)]);
    }

    #[test]
    fn test_sdes_matches_receiver_by_cname() {
        let (recorder, db) = database();
        let receiver = Arc::new(RtpParticipant::receiver(
            ParticipantInfo::new(0).with_cname("cam@lab"),
            addr(5000),
            addr(5001),
        ));
        db.add_receiver(receiver.clone());

        let mut chunk = SdesChunk::new(99);
        chunk.add_item(SdesItem::Cname("cam@lab".into())).unwrap();
        chunk.add_item(SdesItem::Name("Camera".into())).unwrap();
        let found = db.get_or_create_from_sdes_chunk(addr(9999), &chunk).unwrap();

        assert!(Arc::ptr_eq(&found, &receiver));
        assert_eq!(receiver.ssrc(), 99);
        assert!(receiver.has_received_sdes());
        assert_eq!(receiver.info().name.as_deref(), Some("Camera"));
        assert_eq!(receiver.last_control_origin(), Some(addr(9999)));
        assert!(recorder.events.lock().is_empty());
    }

    #[test]
    fn test_unknown_sdes_creates_member() {
        let (recorder, db) = database();
        let mut chunk = SdesChunk::new(31);
        chunk.add_item(SdesItem::Cname("other".into())).unwrap();
        let created = db.get_or_create_from_sdes_chunk(addr(1), &chunk).unwrap();
        assert!(created.has_received_sdes());
        assert_eq!(*recorder.events.lock(), vec![("sdes", 31)]);
    }

    #[test]
    fn test_add_receiver_reuses_known_member() {
        let (_, db) = database();
        let mut chunk = SdesChunk::new(8);
        chunk.add_item(SdesItem::Cname("peer".into())).unwrap();
        let member = db.get_or_create_from_sdes_chunk(addr(1), &chunk).unwrap();

        let receiver = Arc::new(RtpParticipant::receiver(
            ParticipantInfo::new(0).with_cname("peer"),
            addr(5000),
            addr(5001),
        ));
        assert!(db.add_receiver(receiver));
        assert!(Arc::ptr_eq(&db.receivers()[0], &member));
    }

    #[test]
    fn test_cleanup_after_bye() {
        let (recorder, db) = database();
        let quiet = db.get_or_create_from_data_packet(addr(1), &data_packet(1)).unwrap();
        let talking = db.get_or_create_from_data_packet(addr(2), &data_packet(2)).unwrap();
        quiet.packet_received();
        talking.packet_received();
        quiet.bye_received();

        db.cleanup_at(Instant::now() + Duration::from_secs(6));
        assert!(db.participant(1).is_none());
        assert!(db.participant(2).is_some());
        assert!(recorder.events.lock().contains(&("deleted", 1)));
    }

    #[test]
    fn test_cleanup_after_silence() {
        let (recorder, db) = database();
        let receiver = Arc::new(RtpParticipant::receiver(
            ParticipantInfo::new(0),
            addr(5000),
            addr(5001),
        ));
        db.add_receiver(receiver);
        db.get_or_create_from_data_packet(addr(5000), &data_packet(3)).unwrap();

        db.cleanup_at(Instant::now() + Duration::from_secs(30));
        assert_eq!(db.participant_count(), 1);

        db.cleanup_at(Instant::now() + Duration::from_secs(61));
        assert_eq!(db.participant_count(), 0);
        assert_eq!(db.receiver_count(), 0);
        assert_eq!(
            recorder
                .events
                .lock()
                .iter()
                .filter(|(kind, _)| *kind == "deleted")
                .count(),
            1
        );
    }

    #[test]
    fn test_do_with_helpers() {
        let (_, db) = database();
        db.get_or_create_from_data_packet(addr(1), &data_packet(1)).unwrap();
        db.get_or_create_from_data_packet(addr(2), &data_packet(2)).unwrap();

        let mut seen = Vec::new();
        db.do_with_participants(&mut |p| seen.push(p.ssrc()));
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2]);

        let mut count = 0;
        db.do_with_receivers(&mut |_| count += 1);
        assert_eq!(count, 0);
    }

    #[test]
    fn test_single_database() {
        let peer = Arc::new(RtpParticipant::receiver(
            ParticipantInfo::new(40),
            addr(5000),
            addr(5001),
        ));
        let db = SingleParticipantDatabase::new("single", peer.clone());

        assert!(db.participant(40).is_some());
        assert!(db.participant(41).is_none());
        assert!(db
            .get_or_create_from_data_packet(addr(1), &data_packet(41))
            .is_none());
        assert!(db.add_receiver(peer.clone()));
        assert!(!db.add_receiver(Arc::new(RtpParticipant::receiver(
            ParticipantInfo::new(40),
            addr(5000),
            addr(5001),
        ))));
        assert!(!db.remove_receiver(&peer));
        assert_eq!(db.members().len(), 1);
        assert_eq!(db.receiver_count(), 1);
    }
}
