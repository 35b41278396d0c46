//! RTP session state machine
//!
//! A session owns one data and one control transport, a participant
//! database, and the periodic cleanup and RTCP tasks. It goes from
//! uninitialized to running on `init()` and from running to terminated on
//! `terminate()`; a terminated session cannot be restarted.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;
use tokio::sync::broadcast;

use super::clock::{ntp_timestamp, rtp_timestamp};
use super::events::EventBus;
use super::timer::PeriodicTask;
use super::{ControlListener, DataListener, SessionEvent, SessionEventListener};
use crate::config::SessionConfig;
use crate::constants::{DEFAULT_CLOCK_RATE, MAX_PAYLOAD_TYPE};
use crate::error::{CodecError, Error, NetworkError, Result};
use crate::network::{DatagramHandler, Transport, TransportFactory};
use crate::packet::{
    Bye, CompoundControlPacket, ControlPacket, DataPacket, ReceiverReport, SdesChunk, SdesItem,
    SenderReport, SourceDescription,
};
use crate::participant::{
    DefaultParticipantDatabase, ParticipantDatabase, RtpParticipant, SingleParticipantDatabase,
};

const UNINITIALIZED: u8 = 0;
const RUNNING: u8 = 1;
const TERMINATED: u8 = 2;

/// Fixed-peer bookkeeping
struct SinglePeer {
    remote: Arc<RtpParticipant>,
    received_first_packet: AtomicBool,
    unknown_ssrc_count: AtomicU32,
}

enum Mode {
    Multi,
    Single(SinglePeer),
}

struct SessionInner {
    id: String,
    payload_types: Vec<u8>,
    config: SessionConfig,
    mode: Mode,

    local: Arc<RtpParticipant>,
    database: Arc<dyn ParticipantDatabase>,
    transports: Arc<dyn TransportFactory>,

    data_transport: RwLock<Option<Arc<dyn Transport>>>,
    control_transport: RwLock<Option<Arc<dyn Transport>>>,

    state: Mutex<u8>,
    running: AtomicBool,

    sequence: AtomicU16,
    clock_rate: AtomicU32,
    sent_or_received: AtomicBool,
    collisions: AtomicU32,

    /// Data packets sent
    sent_packets: AtomicU64,

    /// Payload octets sent
    sent_bytes: AtomicU64,

    data_listeners: RwLock<Vec<Arc<dyn DataListener>>>,
    control_listeners: RwLock<Vec<Arc<dyn ControlListener>>>,
    events: Arc<EventBus>,

    tasks: Mutex<Vec<PeriodicTask>>,
}

/// An RTP session
pub struct RtpSession {
    inner: Arc<SessionInner>,
}

fn validate_payload_types(payload_types: &[u8]) -> Result<Vec<u8>> {
    if payload_types.is_empty() {
        return Err(Error::InvalidArgument("at least one payload type is required".into()));
    }
    if let Some(pt) = payload_types.iter().find(|pt| **pt > MAX_PAYLOAD_TYPE) {
        return Err(Error::InvalidArgument(format!(
            "payload type {} outside [0, {}]",
            pt, MAX_PAYLOAD_TYPE
        )));
    }
    Ok(payload_types.to_vec())
}

impl RtpSession {
    /// Session with a dynamic participant database
    pub fn multi(
        id: impl Into<String>,
        payload_types: &[u8],
        local: RtpParticipant,
        config: SessionConfig,
        transports: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        let id = id.into();
        let events = Arc::new(EventBus::new(id.clone()));
        let database = DefaultParticipantDatabase::new(id.clone(), events.clone()).with_timeouts(
            std::time::Duration::from_secs(config.timeout_after_no_packets_secs),
            std::time::Duration::from_secs(config.timeout_after_bye_secs),
        );
        Self::build(id, payload_types, local, config, transports, Arc::new(database), Mode::Multi, events)
    }

    /// Session with one fixed remote peer
    pub fn single(
        id: impl Into<String>,
        payload_types: &[u8],
        local: RtpParticipant,
        remote: RtpParticipant,
        config: SessionConfig,
        transports: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        if !remote.is_receiver() {
            return Err(Error::InvalidArgument(
                "remote participant must have data and control addresses".into(),
            ));
        }
        let id = id.into();
        let events = Arc::new(EventBus::new(id.clone()));
        let remote = Arc::new(remote);
        let database = SingleParticipantDatabase::new(id.clone(), remote.clone());
        let mode = Mode::Single(SinglePeer {
            remote,
            received_first_packet: AtomicBool::new(false),
            unknown_ssrc_count: AtomicU32::new(0),
        });
        Self::build(id, payload_types, local, config, transports, Arc::new(database), mode, events)
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        id: String,
        payload_types: &[u8],
        local: RtpParticipant,
        config: SessionConfig,
        transports: Arc<dyn TransportFactory>,
        database: Arc<dyn ParticipantDatabase>,
        mode: Mode,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        let payload_types = validate_payload_types(payload_types)?;
        if !local.is_receiver() {
            return Err(Error::InvalidArgument(
                "local participant must have data and control addresses".into(),
            ));
        }

        Ok(Self {
            inner: Arc::new(SessionInner {
                id,
                payload_types,
                config,
                mode,
                local: Arc::new(local),
                database,
                transports,
                data_transport: RwLock::new(None),
                control_transport: RwLock::new(None),
                state: Mutex::new(UNINITIALIZED),
                running: AtomicBool::new(false),
                sequence: AtomicU16::new(0),
                clock_rate: AtomicU32::new(DEFAULT_CLOCK_RATE),
                sent_or_received: AtomicBool::new(false),
                collisions: AtomicU32::new(0),
                sent_packets: AtomicU64::new(0),
                sent_bytes: AtomicU64::new(0),
                data_listeners: RwLock::new(Vec::new()),
                control_listeners: RwLock::new(Vec::new()),
                events,
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Bind both transports, announce ourselves and start the periodic
    /// tasks. Calling it on a running session does nothing.
    pub fn init(&self) -> Result<()> {
        SessionInner::init(&self.inner)
    }

    /// Leave the session. Only the first call has any effect.
    pub fn terminate(&self) {
        self.inner.terminate(None);
    }

    /// Send a payload as a data packet to every receiver. Returns the
    /// number of receivers the packet was written to.
    pub fn send_data(&self, payload: impl Into<Bytes>, timestamp: u32, marker: bool) -> Result<usize> {
        let mut packet = DataPacket::new(payload);
        packet.set_timestamp(timestamp);
        packet.set_marker(marker);
        self.send_data_packet(packet)
    }

    /// Stamp SSRC and sequence number, then send to every receiver
    pub fn send_data_packet(&self, packet: DataPacket) -> Result<usize> {
        self.inner.send_data_packet(packet)
    }

    /// Send a single RTCP packet. Only APP packets are accepted while the
    /// session generates its own reports.
    pub fn send_control_packet(&self, packet: ControlPacket) -> Result<()> {
        self.inner.ensure_running()?;
        let is_app = matches!(packet, ControlPacket::AppData(_));
        if !is_app && self.inner.config.automated_rtcp_handling {
            return Err(Error::InvalidArgument(
                "automated RTCP handling is on; only APP packets may be sent".into(),
            ));
        }
        self.inner.send_control_to_receivers(&packet.encode());
        Ok(())
    }

    /// Send a compound RTCP packet. Rejected while the session generates its
    /// own reports.
    pub fn send_compound_control_packet(&self, packet: &CompoundControlPacket) -> Result<()> {
        self.inner.ensure_running()?;
        if self.inner.config.automated_rtcp_handling {
            return Err(Error::InvalidArgument(
                "automated RTCP handling is on; compound packets are generated internally".into(),
            ));
        }
        self.inner.send_control_to_receivers(&packet.encode());
        Ok(())
    }

    pub fn add_receiver(&self, participant: Arc<RtpParticipant>) -> bool {
        participant.ssrc() != self.inner.local.ssrc() && self.inner.database.add_receiver(participant)
    }

    pub fn remove_receiver(&self, participant: &Arc<RtpParticipant>) -> bool {
        self.inner.database.remove_receiver(participant)
    }

    pub fn remote_participant(&self, ssrc: u32) -> Option<Arc<RtpParticipant>> {
        self.inner.database.participant(ssrc)
    }

    pub fn remote_participants(&self) -> HashMap<u32, Arc<RtpParticipant>> {
        self.inner.database.members()
    }

    pub fn participant_database(&self) -> &Arc<dyn ParticipantDatabase> {
        &self.inner.database
    }

    pub fn add_data_listener(&self, listener: Arc<dyn DataListener>) {
        self.inner.data_listeners.write().push(listener);
    }

    pub fn remove_data_listener(&self, listener: &Arc<dyn DataListener>) {
        self.inner.data_listeners.write().retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn add_control_listener(&self, listener: Arc<dyn ControlListener>) {
        self.inner.control_listeners.write().push(listener);
    }

    pub fn remove_control_listener(&self, listener: &Arc<dyn ControlListener>) {
        self.inner.control_listeners.write().retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn add_event_listener(&self, listener: Arc<dyn SessionEventListener>) {
        self.inner.events.add_listener(listener);
    }

    pub fn remove_event_listener(&self, listener: &Arc<dyn SessionEventListener>) {
        self.inner.events.remove_listener(listener);
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn payload_types(&self) -> &[u8] {
        &self.inner.payload_types
    }

    pub fn local_participant(&self) -> &Arc<RtpParticipant> {
        &self.inner.local
    }

    pub fn local_ssrc(&self) -> u32 {
        self.inner.local.ssrc()
    }

    /// Bound data address, or the configured one before `init()`
    pub fn local_data_address(&self) -> Option<SocketAddr> {
        self.inner.local_data_address()
    }

    pub fn local_control_address(&self) -> Option<SocketAddr> {
        match self.inner.control_transport.read().as_ref() {
            Some(transport) => Some(transport.local_addr()),
            None => self.inner.local.control_destination(),
        }
    }

    /// The fixed peer of a single-peer session
    pub fn remote(&self) -> Option<&Arc<RtpParticipant>> {
        match &self.inner.mode {
            Mode::Single(peer) => Some(&peer.remote),
            Mode::Multi => None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Get data packets sent count
    pub fn sent_packets(&self) -> u64 {
        self.inner.sent_packets.load(Ordering::Relaxed)
    }

    /// Get payload bytes sent count
    pub fn sent_bytes(&self) -> u64 {
        self.inner.sent_bytes.load(Ordering::Relaxed)
    }

    /// Media clock used for jitter and sender report timestamps
    pub fn set_clock_rate(&self, clock_rate: u32) {
        self.inner.clock_rate.store(clock_rate.max(1), Ordering::Relaxed);
    }
}

impl Drop for RtpSession {
    fn drop(&mut self) {
        self.inner.terminate(None);
    }
}

struct DataChannelHandler(Weak<SessionInner>);

impl DatagramHandler for DataChannelHandler {
    fn datagram_received(&self, origin: SocketAddr, data: Bytes) {
        let Some(session) = self.0.upgrade() else {
            return;
        };
        match DataPacket::decode(data) {
            Ok(packet) => session.data_packet_received(origin, packet),
            Err(e) => tracing::debug!("Dropped malformed RTP packet from {}: {}", origin, e),
        }
    }
}

struct ControlChannelHandler(Weak<SessionInner>);

impl DatagramHandler for ControlChannelHandler {
    fn datagram_received(&self, origin: SocketAddr, data: Bytes) {
        let Some(session) = self.0.upgrade() else {
            return;
        };
        if let Some(packet) = CompoundControlPacket::decode(data) {
            session.control_packet_received(origin, packet);
        }
    }
}

impl SessionInner {
    fn init(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            RUNNING => return Ok(()),
            TERMINATED => {
                return Err(Error::InvalidArgument(format!(
                    "session with id '{}' was terminated",
                    self.id
                )))
            }
            _ => {}
        }

        let (Some(data_addr), Some(control_addr)) =
            (self.local.data_destination(), self.local.control_destination())
        else {
            return Err(NetworkError::NotBound.into());
        };

        let data = self
            .transports
            .bind(data_addr, Arc::new(DataChannelHandler(Arc::downgrade(self))))
            .map_err(|e| {
                tracing::error!("Failed to bind data channel for session with id {}: {}", self.id, e);
                e
            })?;
        let control = match self
            .transports
            .bind(control_addr, Arc::new(ControlChannelHandler(Arc::downgrade(self))))
        {
            Ok(control) => control,
            Err(e) => {
                tracing::error!("Failed to bind control channel for session with id {}: {}", self.id, e);
                data.close();
                return Err(e.into());
            }
        };
        tracing::debug!(
            "Data & Control channels bound for session with id {} ({}, {})",
            self.id,
            data.local_addr(),
            control.local_addr()
        );
        *self.data_transport.write() = Some(data);
        *self.control_transport.write() = Some(control);

        self.join_session(self.local.ssrc());
        self.running.store(true, Ordering::SeqCst);
        *state = RUNNING;
        drop(state);

        if let Err(e) = self.start_tasks() {
            tracing::error!("Failed to start periodic tasks for session with id {}: {}", self.id, e);
            self.terminate(Some(format!("Failed to start periodic tasks: {}", e)));
            return Err(e);
        }

        tracing::info!("Session with id '{}' initialized", self.id);
        Ok(())
    }

    fn start_tasks(self: &Arc<Self>) -> Result<()> {
        let mut tasks = Vec::new();

        let weak = Arc::downgrade(self);
        tasks.push(PeriodicTask::spawn(
            "rtp-db-cleanup",
            self.config.cleanup_interval(),
            move || match weak.upgrade() {
                Some(session) if session.running.load(Ordering::SeqCst) => {
                    session.database.cleanup();
                    true
                }
                _ => false,
            },
        )?);

        if self.config.automated_rtcp_handling {
            let weak = Arc::downgrade(self);
            tasks.push(PeriodicTask::spawn(
                "rtp-rtcp-reports",
                self.config.rtcp_interval(),
                move || match weak.upgrade() {
                    Some(session) if session.running.load(Ordering::SeqCst) => {
                        session.send_periodic_reports();
                        session.running.load(Ordering::SeqCst)
                    }
                    _ => false,
                },
            )?);
        }

        self.tasks.lock().extend(tasks);
        Ok(())
    }

    fn terminate(&self, cause: Option<String>) {
        {
            let mut state = self.state.lock();
            if *state == TERMINATED {
                return;
            }
            let was_running = *state == RUNNING;
            *state = TERMINATED;
            self.running.store(false, Ordering::SeqCst);
            if !was_running {
                return;
            }
        }

        let tasks: Vec<PeriodicTask> = std::mem::take(&mut *self.tasks.lock());
        for mut task in tasks {
            task.stop();
        }

        self.data_listeners.write().clear();
        self.control_listeners.write().clear();

        // close() joins the receive thread, which may itself read the slot
        let data = self.data_transport.write().take();
        if let Some(data) = data {
            data.close();
        }
        self.leave_session(self.local.ssrc(), "Session terminated.");
        let control = self.control_transport.write().take();
        if let Some(control) = control {
            control.close();
        }

        match &cause {
            Some(cause) => tracing::warn!("Session with id '{}' terminated: {}", self.id, cause),
            None => tracing::info!("Session with id '{}' terminated", self.id),
        }

        self.events.emit(SessionEvent::Terminated { cause });
        self.events.clear();
    }

    fn ensure_running(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(NetworkError::NotBound.into())
        }
    }

    fn local_data_address(&self) -> Option<SocketAddr> {
        match self.data_transport.read().as_ref() {
            Some(transport) => Some(transport.local_addr()),
            None => self.local.data_destination(),
        }
    }

    fn clock_rate(&self) -> u32 {
        self.clock_rate.load(Ordering::Relaxed)
    }

    fn is_single(&self) -> bool {
        matches!(self.mode, Mode::Single(_))
    }

    fn data_destination_for(&self, participant: &RtpParticipant) -> Option<SocketAddr> {
        if self.is_single() && self.config.send_to_last_origin {
            if let Some(origin) = participant.last_data_origin() {
                return Some(origin);
            }
        }
        participant.data_destination()
    }

    fn control_destination_for(&self, participant: &RtpParticipant) -> Option<SocketAddr> {
        if self.is_single() && self.config.send_to_last_origin {
            if let Some(origin) = participant.last_control_origin() {
                return Some(origin);
            }
        }
        participant.control_destination()
    }

    // outbound

    fn send_data_packet(&self, mut packet: DataPacket) -> Result<usize> {
        self.ensure_running()?;
        if !self.payload_types.contains(&packet.payload_type()) && self.payload_types.len() == 1 {
            packet.set_payload_type(self.payload_types[0])?;
        }
        packet.set_ssrc(self.local.ssrc());
        packet.set_sequence_number(self.sequence.fetch_add(1, Ordering::SeqCst).wrapping_add(1));

        let transport = self.data_transport.read().clone().ok_or(NetworkError::NotBound)?;
        let bytes = packet.encode();

        let mut delivered = 0;
        for receiver in self.database.receivers() {
            if receiver.has_received_bye() {
                continue;
            }
            let Some(destination) = self.data_destination_for(&receiver) else {
                continue;
            };
            match transport.send_to(&bytes, destination) {
                Ok(_) => delivered += 1,
                Err(e) => tracing::error!(
                    "Failed to send RTP packet to {} in session with id {}: {}",
                    receiver,
                    self.id,
                    e
                ),
            }
        }

        self.sent_packets.fetch_add(1, Ordering::Relaxed);
        self.sent_bytes.fetch_add(packet.payload_len() as u64, Ordering::Relaxed);
        self.sent_or_received.store(true, Ordering::SeqCst);
        Ok(delivered)
    }

    fn send_control_to_receivers(&self, bytes: &[u8]) {
        let Some(transport) = self.control_transport.read().clone() else {
            return;
        };
        for receiver in self.database.receivers() {
            self.send_control_to(&*transport, &receiver, bytes);
        }
    }

    fn send_control_to(&self, transport: &dyn Transport, receiver: &RtpParticipant, bytes: &[u8]) {
        if receiver.has_received_bye() {
            return;
        }
        let Some(destination) = self.control_destination_for(receiver) else {
            return;
        };
        if let Err(e) = transport.send_to(bytes, destination) {
            tracing::error!(
                "Failed to send RTCP packet to {} in session with id {}: {}",
                receiver,
                self.id,
                e
            );
        }
    }

    fn join_session(&self, ssrc: u32) {
        if !self.config.automated_rtcp_handling {
            return;
        }
        let sdes = match self.build_sdes_packet(ssrc) {
            Ok(sdes) => sdes,
            Err(e) => {
                tracing::error!("Failed to build SDES for session with id {}: {}", self.id, e);
                return;
            }
        };
        let compound = CompoundControlPacket::pair(ReceiverReport::new(ssrc), sdes);
        self.send_control_to_receivers(&compound.encode());
    }

    fn leave_session(&self, ssrc: u32, motive: &str) {
        if !self.config.automated_rtcp_handling {
            return;
        }
        let packet = self.build_sdes_packet(ssrc).and_then(|sdes| {
            let bye = Bye::new(vec![ssrc])?.with_reason(motive)?;
            Ok(CompoundControlPacket::pair(sdes, bye))
        });
        match packet {
            Ok(compound) => self.send_control_to_receivers(&compound.encode()),
            Err(e) => tracing::error!("Failed to build BYE for session with id {}: {}", self.id, e),
        }
    }

    /// One report + SDES compound per receiver
    fn send_periodic_reports(&self) {
        let Some(transport) = self.control_transport.read().clone() else {
            return;
        };
        let ssrc = self.local.ssrc();
        let sdes = match self.build_sdes_packet(ssrc) {
            Ok(sdes) => sdes,
            Err(e) => {
                tracing::error!("Failed to build SDES for session with id {}: {}", self.id, e);
                return;
            }
        };

        for receiver in self.database.receivers() {
            match self.build_report_packet(ssrc, &receiver) {
                Ok(report) => {
                    let compound = CompoundControlPacket::pair(report, sdes.clone());
                    self.send_control_to(&*transport, &receiver, &compound.encode());
                }
                Err(e) => tracing::error!("Failed to build report for {}: {}", receiver, e),
            }
        }
    }

    /// RR while nothing was sent, SR otherwise; at most one block about `context`
    fn build_report_packet(&self, ssrc: u32, context: &RtpParticipant) -> std::result::Result<ControlPacket, CodecError> {
        let block = context.build_reception_report();
        let sent_packets = self.sent_packets.load(Ordering::Relaxed);

        if sent_packets == 0 {
            let mut report = ReceiverReport::new(ssrc);
            if let Some(block) = block {
                report.add_report(block)?;
            }
            return Ok(report.into());
        }

        let now = SystemTime::now();
        let mut report = SenderReport::new(ssrc);
        report.ntp_timestamp = ntp_timestamp(now);
        report.rtp_timestamp = rtp_timestamp(now, self.clock_rate());
        report.packet_count = sent_packets as u32;
        report.octet_count = self.sent_bytes.load(Ordering::Relaxed) as u32;
        if let Some(block) = block {
            report.add_report(block)?;
        }
        Ok(report.into())
    }

    fn local_cname(&self) -> String {
        if let Some(cname) = self.config.sdes.cname.clone().or_else(|| self.local.cname()) {
            return cname;
        }
        match self.local_data_address() {
            Some(addr) => format!("{}/{}@{}", env!("CARGO_PKG_NAME"), self.id, addr),
            None => format!("{}/{}", env!("CARGO_PKG_NAME"), self.id),
        }
    }

    fn build_sdes_packet(&self, ssrc: u32) -> std::result::Result<SourceDescription, CodecError> {
        let sdes = &self.config.sdes;
        let mut chunk = SdesChunk::new(ssrc);
        chunk.add_item(SdesItem::Cname(self.local_cname()))?;
        if let Some(name) = &sdes.name {
            chunk.add_item(SdesItem::Name(name.clone()))?;
        }
        if let Some(email) = &sdes.email {
            chunk.add_item(SdesItem::Email(email.clone()))?;
        }
        if let Some(phone) = &sdes.phone {
            chunk.add_item(SdesItem::Phone(phone.clone()))?;
        }
        if let Some(location) = &sdes.location {
            chunk.add_item(SdesItem::Location(location.clone()))?;
        }
        chunk.add_item(SdesItem::Tool(sdes.tool.clone()))?;
        if let Some(note) = &sdes.note {
            chunk.add_item(SdesItem::Note(note.clone()))?;
        }

        let mut packet = SourceDescription::new();
        packet.add_chunk(chunk)?;
        Ok(packet)
    }

    // inbound

    fn data_packet_received(&self, origin: SocketAddr, packet: DataPacket) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        if let Mode::Single(peer) = &self.mode {
            if !peer.received_first_packet.swap(true, Ordering::SeqCst) {
                peer.remote.set_ssrc(packet.ssrc());
                tracing::warn!("First packet received from remote source, updated SSRC to {}", packet.ssrc());
            } else if self.config.ignore_from_unknown_ssrc && packet.ssrc() != peer.remote.ssrc() {
                tracing::warn!(
                    "Discarded packet from unexpected SSRC: {} (expected was {})",
                    packet.ssrc(),
                    peer.remote.ssrc()
                );
                let count = peer.unknown_ssrc_count.fetch_add(1, Ordering::SeqCst) + 1;
                if count > self.config.unknown_ssrc_threshold {
                    peer.unknown_ssrc_count.store(0, Ordering::SeqCst);
                    self.events.emit(SessionEvent::SsrcChanged);
                }
                return;
            }
            peer.unknown_ssrc_count.store(0, Ordering::SeqCst);
        }

        if !self.payload_types.contains(&packet.payload_type()) {
            tracing::trace!("Discarded packet with payload type {}", packet.payload_type());
            return;
        }

        if packet.ssrc() == self.local.ssrc() && !self.resolve_collision(origin, packet.ssrc()) {
            return;
        }

        let Some(participant) = self.database.get_or_create_from_data_packet(origin, &packet) else {
            return;
        };

        if self.config.discard_out_of_order {
            if let Some(last) = participant.last_sequence_number() {
                // Newer means ahead by less than half the sequence space
                let ahead = packet.sequence_number().wrapping_sub(last);
                if ahead == 0 || ahead >= 0x8000 {
                    tracing::debug!(
                        "Discarded out of order packet from {} in session with id {} (last SN was {}, packet SN was {})",
                        participant,
                        self.id,
                        last,
                        packet.sequence_number()
                    );
                    return;
                }
            }
        }

        participant.data_packet_accepted(origin, &packet, self.clock_rate());
        self.sent_or_received.store(true, Ordering::SeqCst);

        let info = participant.info();
        let listeners = self.data_listeners.read().clone();
        for listener in &listeners {
            listener.data_packet_received(&info, &packet);
        }
    }

    /// Handle a packet carrying our own SSRC. Returns whether processing of
    /// the packet continues.
    fn resolve_collision(&self, origin: SocketAddr, remote_ssrc: u32) -> bool {
        if Some(origin) == self.local_data_address() {
            self.terminate(Some(
                "Loop detected: session is directly receiving its own packets".to_string(),
            ));
            return false;
        }

        let collisions = self.collisions.fetch_add(1, Ordering::SeqCst) + 1;
        if collisions > self.config.max_collisions_before_considering_loop {
            self.terminate(Some(format!("Loop detected after {} SSRC collisions", collisions)));
            return false;
        }

        let old_ssrc = self.local.ssrc();
        let new_ssrc = self.local.resolve_ssrc_conflict(remote_ssrc);

        // Nothing was sent or received yet: switching silently is enough
        if self.sent_or_received.swap(true, Ordering::SeqCst) {
            self.leave_session(old_ssrc, "SSRC collision detected; rejoining with new SSRC.");
            self.join_session(new_ssrc);
        }

        tracing::warn!(
            "SSRC collision with remote end detected on session with id {}; updating SSRC from {} to {}",
            self.id,
            old_ssrc,
            new_ssrc
        );
        self.events.emit(SessionEvent::ResolvedSsrcConflict {
            old: old_ssrc,
            new: new_ssrc,
        });
        true
    }

    fn control_packet_received(&self, origin: SocketAddr, packet: CompoundControlPacket) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        let listeners = self.control_listeners.read().clone();
        if !self.config.automated_rtcp_handling {
            for listener in &listeners {
                listener.control_packet_received(&packet);
            }
            return;
        }

        for control in packet.packets() {
            match control {
                ControlPacket::SenderReport(report) => {
                    if let Some(participant) = self.database.participant(report.sender_ssrc) {
                        participant.sender_report_received(report.ntp_timestamp);
                    }
                    self.handle_report_blocks(report.sender_ssrc, report.reports());
                }
                ControlPacket::ReceiverReport(report) => {
                    self.handle_report_blocks(report.sender_ssrc, report.reports());
                }
                ControlPacket::SourceDescription(sdes) => self.handle_sdes(origin, sdes),
                ControlPacket::Bye(bye) => self.handle_bye(bye),
                ControlPacket::AppData(app) => {
                    for listener in &listeners {
                        listener.app_data_received(app);
                    }
                }
            }
        }
    }

    fn handle_report_blocks(&self, sender_ssrc: u32, reports: &[crate::packet::ReceptionReport]) {
        if reports.is_empty() {
            return;
        }
        // RTCP SDES or RTP must arrive first
        let Some(participant) = self.database.participant(sender_ssrc) else {
            return;
        };
        let local_ssrc = self.local.ssrc();
        for report in reports.iter().filter(|r| r.ssrc == local_ssrc) {
            participant.set_last_report_about_us(*report);
        }
    }

    fn handle_sdes(&self, origin: SocketAddr, packet: &SourceDescription) {
        for chunk in packet.chunks() {
            let Some(participant) = self.database.get_or_create_from_sdes_chunk(origin, chunk) else {
                return;
            };
            participant.packet_received();
            participant.set_last_control_origin(origin);
            if !participant.has_received_sdes() || self.config.try_to_update_on_every_sdes {
                participant.mark_received_sdes();
                if participant.update_from_sdes_chunk(chunk) {
                    self.events.emit(SessionEvent::ParticipantDataUpdated(participant));
                }
            }
        }
    }

    fn handle_bye(&self, packet: &Bye) {
        for ssrc in packet.ssrcs() {
            if let Some(participant) = self.database.participant(*ssrc) {
                participant.bye_received();
                self.events.emit(SessionEvent::ParticipantLeft(participant));
            }
        }
        tracing::trace!(
            "Received BYE for participants with SSRCs {:?} in session with id '{}' (reason: '{}')",
            packet.ssrcs(),
            self.id,
            packet.reason().unwrap_or_default()
        );
    }
}
