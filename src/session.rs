//! RTP session engine
//!
//! The long-lived orchestrator that binds the data and control
//! transports, keeps the participant registry, performs automated RTCP
//! membership handling and fans inbound traffic out to observers.
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::collision::{CollisionAssessment, CollisionDetector};
use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::observer::{ControlListener, DataListener, ListenerSet, SessionEventListener};
use crate::participant::{ParticipantContext, RtpParticipant};
use crate::registry::{AdmissionPolicy, AdmitAll, ParticipantDecision, ParticipantRegistry};
use crate::reports;
use crate::rtcp::{
    CompoundControlPacket, ControlPacket, Goodbye, ReceptionReport, SourceDescription,
};
use crate::rtp::DataPacket;
use crate::transport::{DatagramSink, PacketTransport, TransportFactory, UdpTransportFactory};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, RwLockReadGuard, Weak};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// Monotonic 16-bit-wrapping counter for outgoing data packets. The first
// assigned sequence number is 1.
#[derive(Debug, Default)]
struct SequenceCounter(AtomicU16);

impl SequenceCounter {
    fn next(&self) -> u16 {
        self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Failed,
    Terminated,
}

/// The RTP session engine.
///
/// Lifecycle is `new` → [`init`](Self::init) → running →
/// [`terminate`](Self::terminate); the terminated state is absorbing.
/// All operations may be driven concurrently from transport delivery
/// tasks and application tasks.
pub struct RtpSession {
    id: String,
    payload_type: u8,
    local: StdRwLock<RtpParticipant>,
    registry: ParticipantRegistry,
    sequence: SequenceCounter,
    collisions: CollisionDetector,
    sent_or_received: AtomicBool,
    running: AtomicBool,
    config: StdRwLock<SessionConfig>,
    factory: StdRwLock<Arc<dyn TransportFactory>>,
    admission: StdRwLock<Arc<dyn AdmissionPolicy>>,
    // Serializes init against terminate
    lifecycle: AsyncMutex<Lifecycle>,
    data_transport: StdRwLock<Option<Arc<dyn PacketTransport>>>,
    control_transport: StdRwLock<Option<Arc<dyn PacketTransport>>>,
    bound_data_address: StdRwLock<Option<SocketAddr>>,
    report_task: StdMutex<Option<JoinHandle<()>>>,
    data_listeners: ListenerSet<dyn DataListener>,
    control_listeners: ListenerSet<dyn ControlListener>,
    event_listeners: ListenerSet<dyn SessionEventListener>,
    self_ref: Weak<RtpSession>,
}

impl RtpSession {
    /// Create a session identified by `id`, accepting and emitting RTP
    /// with the given payload type on behalf of `local_participant`.
    ///
    /// Fails when `payload_type` is outside `0..=127`.
    pub fn new(
        id: impl Into<String>,
        payload_type: u8,
        local_participant: RtpParticipant,
    ) -> SessionResult<Arc<Self>> {
        if payload_type > 127 {
            return Err(SessionError::InvalidPayloadType(payload_type));
        }

        Ok(Arc::new_cyclic(|weak| RtpSession {
            id: id.into(),
            payload_type,
            local: StdRwLock::new(local_participant),
            registry: ParticipantRegistry::new(),
            sequence: SequenceCounter::default(),
            collisions: CollisionDetector::new(),
            sent_or_received: AtomicBool::new(false),
            running: AtomicBool::new(false),
            config: StdRwLock::new(SessionConfig::default()),
            factory: StdRwLock::new(Arc::new(UdpTransportFactory)),
            admission: StdRwLock::new(Arc::new(AdmitAll)),
            lifecycle: AsyncMutex::new(Lifecycle::Created),
            data_transport: StdRwLock::new(None),
            control_transport: StdRwLock::new(None),
            bound_data_address: StdRwLock::new(None),
            report_task: StdMutex::new(None),
            data_listeners: ListenerSet::new(),
            control_listeners: ListenerSet::new(),
            event_listeners: ListenerSet::new(),
            self_ref: weak.clone(),
        }))
    }

    /// Session identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Payload type this session accepts and emits
    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    /// Whether the session is between `init` and `terminate`
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Snapshot of the local participant
    pub fn local_participant(&self) -> RtpParticipant {
        self.local_read().clone()
    }

    /// Current local SSRC
    pub fn local_ssrc(&self) -> u32 {
        self.local_read().ssrc
    }

    /// Foreign-origin SSRC collisions observed so far
    pub fn collision_count(&self) -> u32 {
        self.collisions.count()
    }

    fn local_read(&self) -> RwLockReadGuard<'_, RtpParticipant> {
        self.local.read().unwrap_or_else(|e| e.into_inner())
    }

    fn read_config<R>(&self, f: impl FnOnce(&SessionConfig) -> R) -> R {
        f(&self.config.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn ensure_not_running(&self) -> SessionResult<()> {
        if self.is_running() {
            return Err(SessionError::ConfigurationImmutable);
        }
        Ok(())
    }

    fn update_config(&self, f: impl FnOnce(&mut SessionConfig)) -> SessionResult<()> {
        self.ensure_not_running()?;
        f(&mut self.config.write().unwrap_or_else(|e| e.into_inner()));
        Ok(())
    }

    /// Set whether inbound RTP at or below the last seen sequence number
    /// is discarded
    pub fn set_discard_out_of_order(&self, value: bool) -> SessionResult<()> {
        self.update_config(|c| c.discard_out_of_order = value)
    }

    /// Set the socket send buffer size
    pub fn set_send_buffer_size(&self, value: usize) -> SessionResult<()> {
        self.update_config(|c| c.send_buffer_size = value)
    }

    /// Set the socket receive buffer size
    pub fn set_receive_buffer_size(&self, value: usize) -> SessionResult<()> {
        self.update_config(|c| c.receive_buffer_size = value)
    }

    /// Set the number of foreign collisions tolerated before the session
    /// declares a loop
    pub fn set_max_collisions_before_considering_loop(&self, value: u32) -> SessionResult<()> {
        self.update_config(|c| c.max_collisions_before_considering_loop = value)
    }

    /// Enable or disable automated RTCP handling
    pub fn set_automated_rtcp_handling(&self, value: bool) -> SessionResult<()> {
        self.update_config(|c| c.automated_rtcp_handling = value)
    }

    /// Set the routine report interval
    pub fn set_report_interval(&self, value: Duration) -> SessionResult<()> {
        self.update_config(|c| c.report_interval = value)
    }

    /// Set the informational host name
    pub fn set_host(&self, value: Option<String>) -> SessionResult<()> {
        self.update_config(|c| c.host = value)
    }

    /// Replace the transport factory; only before `init`
    pub fn set_transport_factory(&self, factory: Arc<dyn TransportFactory>) -> SessionResult<()> {
        self.ensure_not_running()?;
        *self.factory.write().unwrap_or_else(|e| e.into_inner()) = factory;
        Ok(())
    }

    /// Replace the admission policy for unknown sources; only before `init`
    pub fn set_admission_policy(&self, policy: Arc<dyn AdmissionPolicy>) -> SessionResult<()> {
        self.ensure_not_running()?;
        *self.admission.write().unwrap_or_else(|e| e.into_inner()) = policy;
        Ok(())
    }

    /// Register a data observer
    pub fn add_data_listener(&self, listener: Arc<dyn DataListener>) {
        self.data_listeners.add(listener);
    }

    /// Unregister a data observer
    pub fn remove_data_listener(&self, listener: &Arc<dyn DataListener>) {
        self.data_listeners.remove(listener);
    }

    /// Register a control observer
    pub fn add_control_listener(&self, listener: Arc<dyn ControlListener>) {
        self.control_listeners.add(listener);
    }

    /// Unregister a control observer
    pub fn remove_control_listener(&self, listener: &Arc<dyn ControlListener>) {
        self.control_listeners.remove(listener);
    }

    /// Register an event observer
    pub fn add_event_listener(&self, listener: Arc<dyn SessionEventListener>) {
        self.event_listeners.add(listener);
    }

    /// Unregister an event observer
    pub fn remove_event_listener(&self, listener: &Arc<dyn SessionEventListener>) {
        self.event_listeners.remove(listener);
    }

    /// Bind the data and control transports and start the session.
    ///
    /// Idempotent: a second call returns the first outcome without
    /// rebinding. On any bind failure both transports are released and
    /// the call returns false. On success the session is running and,
    /// with automated RTCP handling, the join compound is emitted.
    pub async fn init(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Running => return true,
            Lifecycle::Failed | Lifecycle::Terminated => return false,
            Lifecycle::Created => {}
        }

        let (data_addr, control_addr) = {
            let local = self.local_read();
            (local.data_address, local.control_address)
        };
        let (send_buf, recv_buf, automated, interval) = self.read_config(|c| {
            (
                c.send_buffer_size,
                c.receive_buffer_size,
                c.automated_rtcp_handling,
                c.report_interval,
            )
        });
        let factory = self.factory.read().unwrap_or_else(|e| e.into_inner()).clone();

        let data = match factory.bind(data_addr, send_buf, recv_buf).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!(session = %self.id, error = %e, "Failed to bind data transport");
                *lifecycle = Lifecycle::Failed;
                return false;
            }
        };
        let control = match factory.bind(control_addr, send_buf, recv_buf).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!(session = %self.id, error = %e, "Failed to bind control transport");
                data.close().await;
                *lifecycle = Lifecycle::Failed;
                return false;
            }
        };

        data.start(Arc::new(DataPacketSink {
            session: self.self_ref.clone(),
        }))
        .await;
        control
            .start(Arc::new(ControlPacketSink {
                session: self.self_ref.clone(),
            }))
            .await;

        *self.bound_data_address.write().unwrap_or_else(|e| e.into_inner()) =
            Some(data.local_addr());
        *self.data_transport.write().unwrap_or_else(|e| e.into_inner()) = Some(data);
        *self.control_transport.write().unwrap_or_else(|e| e.into_inner()) = Some(control);

        self.running.store(true, Ordering::Release);
        *lifecycle = Lifecycle::Running;

        info!(session = %self.id, data = %data_addr, control = %control_addr, "Session initialized");

        if automated {
            self.emit_join_compound().await;
            *self.report_task.lock().unwrap_or_else(|e| e.into_inner()) =
                Some(self.spawn_report_task(interval));
        }
        true
    }

    /// Terminate the session without a cause
    pub async fn terminate(&self) {
        self.shut_down(None).await;
    }

    /// Terminate the session, reporting `cause` to event observers
    pub async fn terminate_with(&self, cause: impl Into<String>) {
        self.shut_down(Some(cause.into())).await;
    }

    async fn shut_down(&self, cause: Option<String>) {
        let mut lifecycle = self.lifecycle.lock().await;
        if *lifecycle != Lifecycle::Running {
            return;
        }
        *lifecycle = Lifecycle::Terminated;

        info!(
            session = %self.id,
            cause = cause.as_deref().unwrap_or("none"),
            "Terminating session"
        );

        // Traffic observers go first; no data or control callback fires
        // during teardown.
        self.data_listeners.clear();
        self.control_listeners.clear();

        if let Some(task) = self.report_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }

        let data = self.data_transport.write().unwrap_or_else(|e| e.into_inner()).take();
        let control = self.control_transport.write().unwrap_or_else(|e| e.into_inner()).take();

        if let Some(ref data) = data {
            data.close().await;
        }

        if self.read_config(|c| c.automated_rtcp_handling) {
            if let Some(ref control) = control {
                let motive = cause.clone().unwrap_or_else(|| "Session terminated".to_string());
                self.emit_leave_compounds(control.as_ref(), self.local_ssrc(), &motive)
                    .await;
            }
        }
        if let Some(ref control) = control {
            control.close().await;
        }
        drop(data);
        drop(control);

        self.event_listeners
            .notify(|l| l.session_terminated(self, cause.as_deref()));
        self.event_listeners.clear();
        self.running.store(false, Ordering::Release);
    }

    /// Send a data packet carrying `payload`.
    ///
    /// Returns false when the session is not running or any transport
    /// write failed.
    pub async fn send_data(&self, payload: Bytes, timestamp: u32, marker: bool) -> bool {
        self.send_data_packet(DataPacket::new(payload, timestamp, marker))
            .await
    }

    /// Send a caller-constructed data packet.
    ///
    /// The engine overwrites the payload type, SSRC and sequence number.
    pub async fn send_data_packet(&self, mut packet: DataPacket) -> bool {
        if !self.is_running() {
            return false;
        }

        packet.payload_type = self.payload_type;
        packet.ssrc = self.local_ssrc();
        packet.sequence_number = self.sequence.next();
        self.sent_or_received.store(true, Ordering::Release);

        let Some(transport) = self.data_transport() else {
            return false;
        };
        let bytes = packet.serialize();

        // The read lock is held for the whole loop so recipient addresses
        // stay valid across the transport writes.
        let participants = self.registry.read_guard().await;
        let mut delivered = true;
        for context in participants.values() {
            if context.bye_received() {
                continue;
            }
            let peer = context.data_address();
            match transport.send(&bytes, peer).await {
                Ok(()) => context.record_sent(bytes.len()),
                Err(e) => {
                    warn!(session = %self.id, peer = %peer, error = %e, "Failed to send data packet");
                    delivered = false;
                }
            }
        }
        delivered
    }

    /// Send a single control packet to all participants.
    ///
    /// Rejected while automated RTCP handling is on, except for APP
    /// packets, which may always be sent.
    pub async fn send_control_packet(&self, packet: ControlPacket) -> bool {
        if !self.is_running() {
            return false;
        }
        if self.read_config(|c| c.automated_rtcp_handling)
            && !matches!(packet, ControlPacket::AppData(_))
        {
            debug!(session = %self.id, "Rejecting control send while automated RTCP handling is on");
            return false;
        }
        self.fan_out_control(&packet.serialize()).await
    }

    /// Send a compound control packet to all participants.
    ///
    /// Only permitted when automated RTCP handling is off.
    pub async fn send_control_compound(&self, compound: CompoundControlPacket) -> bool {
        if !self.is_running() {
            return false;
        }
        if self.read_config(|c| c.automated_rtcp_handling) {
            debug!(session = %self.id, "Rejecting control send while automated RTCP handling is on");
            return false;
        }
        self.fan_out_control(&compound.serialize()).await
    }

    /// Register a remote participant.
    ///
    /// Rejects the local SSRC; returns true iff a new entry was created.
    pub async fn add_participant(&self, remote: RtpParticipant) -> bool {
        if remote.ssrc == self.local_ssrc() {
            debug!(session = %self.id, ssrc = remote.ssrc, "Refusing to add participant with local SSRC");
            return false;
        }
        self.registry.insert(remote).await
    }

    /// Remove and return the context registered for `ssrc`
    pub async fn remove_participant(&self, ssrc: u32) -> Option<Arc<ParticipantContext>> {
        self.registry.remove(ssrc).await
    }

    /// Look up the context registered for `ssrc`
    pub async fn get_remote_participant(&self, ssrc: u32) -> Option<Arc<ParticipantContext>> {
        self.registry.get(ssrc).await
    }

    /// Snapshot of all registered participant contexts
    pub async fn get_remote_participants(&self) -> Vec<Arc<ParticipantContext>> {
        self.registry.snapshot().await
    }

    /// Inbound RTP entry point, invoked by transport delivery
    pub async fn on_data(&self, origin: SocketAddr, packet: DataPacket) {
        if !self.is_running() {
            return;
        }
        if packet.payload_type != self.payload_type {
            debug!(
                session = %self.id,
                payload_type = packet.payload_type,
                "Discarding data packet with foreign payload type"
            );
            return;
        }

        if packet.ssrc == self.local_ssrc()
            && !self.handle_local_ssrc_packet(origin, &packet).await
        {
            return;
        }

        let admission = self.admission.read().unwrap_or_else(|e| e.into_inner()).clone();
        let resolved = self
            .registry
            .get_or_create(packet.ssrc, || {
                match admission.admit_unknown(origin, &packet) {
                    ParticipantDecision::Create(participant) => Some(participant),
                    ParticipantDecision::Reject => None,
                }
            })
            .await;
        let Some((context, created)) = resolved else {
            debug!(session = %self.id, ssrc = packet.ssrc, "Unknown source rejected by admission policy");
            return;
        };
        if created {
            info!(session = %self.id, ssrc = packet.ssrc, origin = %origin, "New participant discovered from data");
            self.event_listeners
                .notify(|l| l.participant_joined_from_data(self, context.participant(), &packet));
        }

        let discard = self.read_config(|c| c.discard_out_of_order);
        if !context.accept_sequence(packet.sequence_number, discard) {
            debug!(
                session = %self.id,
                ssrc = packet.ssrc,
                sequence = packet.sequence_number,
                "Discarding out-of-order data packet"
            );
            return;
        }
        context.record_received(packet.payload.len());
        self.sent_or_received.store(true, Ordering::Release);

        // NAT rebinding: trust the latest datagram origin over whatever
        // address the participant was created with
        if origin != context.data_address() {
            context.set_data_address(origin);
        }

        let participant = context.participant();
        self.data_listeners
            .notify(|l| l.data_packet_received(self, participant.clone(), packet.clone()));
    }

    // Handles a data packet claiming the local SSRC. Returns true when
    // the packet should continue through normal inbound processing.
    async fn handle_local_ssrc_packet(&self, origin: SocketAddr, packet: &DataPacket) -> bool {
        let local_data_address = self.local_read().data_address;
        let (limit, automated) = self.read_config(|c| {
            (c.max_collisions_before_considering_loop, c.automated_rtcp_handling)
        });

        match self.collisions.assess(origin, local_data_address, limit) {
            CollisionAssessment::SelfLoop => {
                self.terminate_with("Loop detected").await;
                false
            }
            CollisionAssessment::LimitExceeded(count) => {
                self.terminate_with(format!("Loop detected after {} SSRC collisions", count))
                    .await;
                false
            }
            CollisionAssessment::ForeignCollision => {
                let (old_ssrc, new_ssrc) = {
                    let mut local = self.local.write().unwrap_or_else(|e| e.into_inner());
                    let old = local.ssrc;
                    let new = local.resolve_ssrc_conflict(packet.ssrc);
                    (old, new)
                };
                warn!(session = %self.id, old_ssrc, new_ssrc, origin = %origin, "Resolved SSRC collision");

                // Announce the change only if anyone could have seen the
                // old SSRC on the wire
                if self.sent_or_received.swap(true, Ordering::AcqRel) && automated {
                    if let Some(control) = self.control_transport() {
                        self.emit_leave_compounds(control.as_ref(), old_ssrc, "SSRC collision")
                            .await;
                    }
                    self.emit_join_compound().await;
                }
                self.event_listeners
                    .notify(|l| l.ssrc_conflict_resolved(self, old_ssrc, new_ssrc));
                true
            }
        }
    }

    /// Inbound RTCP entry point, invoked by transport delivery
    pub async fn on_control(&self, origin: SocketAddr, compound: CompoundControlPacket) {
        if !self.is_running() {
            return;
        }
        if !self.read_config(|c| c.automated_rtcp_handling) {
            self.control_listeners
                .notify(|l| l.control_packet_received(self, compound.clone()));
            return;
        }

        for packet in &compound.packets {
            match packet {
                ControlPacket::SenderReport(sr) => {
                    self.handle_report(sr.ssrc, &sr.reception_reports).await;
                }
                ControlPacket::ReceiverReport(rr) => {
                    self.handle_report(rr.ssrc, &rr.reception_reports).await;
                }
                ControlPacket::SourceDescription(sdes) => {
                    self.handle_source_description(origin, sdes).await;
                }
                ControlPacket::Bye(bye) => {
                    self.handle_bye(bye).await;
                }
                ControlPacket::AppData(app) => {
                    self.control_listeners
                        .notify(|l| l.app_data_received(self, app.clone()));
                }
            }
        }
    }

    async fn handle_report(&self, sender_ssrc: u32, blocks: &[ReceptionReport]) {
        // A source must first be seen through data or SDES
        if self.registry.get(sender_ssrc).await.is_none() {
            return;
        }
        let local_ssrc = self.local_ssrc();
        if let Some(block) = blocks.iter().find(|b| b.ssrc == local_ssrc) {
            // Placeholder until a metrics component consumes the block
            debug!(
                session = %self.id,
                reporter = sender_ssrc,
                fraction_lost = block.fraction_lost,
                "Reception report received"
            );
        }
    }

    async fn handle_source_description(&self, origin: SocketAddr, sdes: &SourceDescription) {
        for chunk in &sdes.chunks {
            let Some((context, created)) = self
                .registry
                .get_or_create(chunk.ssrc, || Some(RtpParticipant::from_sdes(origin, chunk)))
                .await
            else {
                continue;
            };

            if created {
                context.mark_sdes();
                info!(session = %self.id, ssrc = chunk.ssrc, origin = %origin, "New participant discovered from control");
                self.event_listeners.notify(|l| {
                    l.participant_joined_from_control(self, context.participant(), chunk)
                });
            } else if context.update_description(chunk) {
                self.event_listeners
                    .notify(|l| l.participant_data_updated(self, context.participant()));
            }

            if origin != context.control_address() {
                context.set_control_address(origin);
            }
        }
    }

    async fn handle_bye(&self, bye: &Goodbye) {
        for &ssrc in &bye.ssrcs {
            if let Some(context) = self.registry.get(ssrc).await {
                if context.mark_bye() {
                    info!(
                        session = %self.id,
                        ssrc,
                        reason = bye.reason.as_deref().unwrap_or(""),
                        "Participant left"
                    );
                    self.event_listeners
                        .notify(|l| l.participant_left(self, context.participant()));
                }
            }
        }
    }

    fn data_transport(&self) -> Option<Arc<dyn PacketTransport>> {
        self.data_transport
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn control_transport(&self) -> Option<Arc<dyn PacketTransport>> {
        self.control_transport
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn bound_data_address(&self) -> SocketAddr {
        self.bound_data_address
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .unwrap_or_else(|| self.local_read().data_address)
    }

    async fn fan_out_control(&self, bytes: &[u8]) -> bool {
        let Some(transport) = self.control_transport() else {
            return false;
        };
        let participants = self.registry.read_guard().await;
        let mut delivered = true;
        for context in participants.values() {
            if context.bye_received() {
                continue;
            }
            let peer = context.control_address();
            if let Err(e) = transport.send(bytes, peer).await {
                warn!(session = %self.id, peer = %peer, error = %e, "Failed to send control packet");
                delivered = false;
            }
        }
        delivered
    }

    async fn emit_join_compound(&self) {
        let local = self.local_participant();
        let compound = reports::build_join_compound(
            local.ssrc,
            &local,
            &self.id,
            self.bound_data_address(),
        );
        self.fan_out_control(&compound.serialize()).await;
    }

    async fn emit_leave_compounds(
        &self,
        transport: &dyn PacketTransport,
        leaving_ssrc: u32,
        motive: &str,
    ) {
        let local = self.local_participant();
        let bound = self.bound_data_address();
        let participants = self.registry.read_guard().await;
        for context in participants.values() {
            if context.bye_received() {
                continue;
            }
            let compound = reports::build_leave_compound(
                leaving_ssrc,
                &local,
                &self.id,
                bound,
                context,
                motive,
            );
            let peer = context.control_address();
            if let Err(e) = transport.send(&compound.serialize(), peer).await {
                warn!(session = %self.id, peer = %peer, error = %e, "Failed to send leave compound");
            }
        }
    }

    async fn emit_routine_reports(&self) {
        let Some(transport) = self.control_transport() else {
            return;
        };
        let local = self.local_participant();
        let bound = self.bound_data_address();
        let participants = self.registry.read_guard().await;
        for context in participants.values() {
            if context.bye_received() {
                continue;
            }
            let compound =
                reports::build_routine_compound(local.ssrc, &local, &self.id, bound, context);
            let peer = context.control_address();
            if let Err(e) = transport.send(&compound.serialize(), peer).await {
                debug!(session = %self.id, peer = %peer, error = %e, "Failed to send routine report");
            }
        }
    }

    fn spawn_report_task(&self, interval: Duration) -> JoinHandle<()> {
        let weak = self.self_ref.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                ticker.tick().await;
                let Some(session) = weak.upgrade() else { break };
                if !session.is_running() {
                    break;
                }
                session.emit_routine_reports().await;
            }
        })
    }
}

// Decodes inbound data datagrams and feeds them to the session. Broken
// packets poison only themselves.
struct DataPacketSink {
    session: Weak<RtpSession>,
}

#[async_trait]
impl DatagramSink for DataPacketSink {
    async fn deliver(&self, origin: SocketAddr, data: Bytes) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        match DataPacket::parse(&data) {
            Ok(packet) => session.on_data(origin, packet).await,
            Err(e) => {
                debug!(session = %session.id, origin = %origin, error = %e, "Dropping undecodable data packet");
            }
        }
    }
}

struct ControlPacketSink {
    session: Weak<RtpSession>,
}

#[async_trait]
impl DatagramSink for ControlPacketSink {
    async fn deliver(&self, origin: SocketAddr, data: Bytes) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        match CompoundControlPacket::parse(&data) {
            Ok(compound) => session.on_control(origin, compound).await,
            Err(e) => {
                debug!(session = %session.id, origin = %origin, error = %e, "Dropping undecodable control packet");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtcp::{AppData, ReceiverReport, SdesChunk, SdesItem, SdesItemType};
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(host: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(host, 0, 0, host)), port)
    }

    fn local_addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    struct MemoryTransport {
        local_addr: SocketAddr,
        sent: StdMutex<Vec<(Vec<u8>, SocketAddr)>>,
        closed: AtomicBool,
    }

    impl MemoryTransport {
        fn sent(&self) -> Vec<(Vec<u8>, SocketAddr)> {
            self.sent.lock().unwrap().clone()
        }

        fn clear(&self) {
            self.sent.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl PacketTransport for MemoryTransport {
        async fn send(&self, data: &[u8], peer: SocketAddr) -> SessionResult<()> {
            if self.closed.load(Ordering::Acquire) {
                return Err(SessionError::TransportClosed);
            }
            self.sent.lock().unwrap().push((data.to_vec(), peer));
            Ok(())
        }

        fn local_addr(&self) -> SocketAddr {
            self.local_addr
        }

        async fn start(&self, _sink: Arc<dyn DatagramSink>) {}

        async fn close(&self) {
            self.closed.store(true, Ordering::Release);
        }
    }

    #[derive(Default)]
    struct MemoryFactory {
        transports: StdMutex<Vec<Arc<MemoryTransport>>>,
        fail_after: StdMutex<Option<usize>>,
    }

    impl MemoryFactory {
        fn bound(&self) -> Vec<Arc<MemoryTransport>> {
            self.transports.lock().unwrap().clone()
        }

        // Transports are created data-first
        fn data(&self) -> Arc<MemoryTransport> {
            self.bound()[0].clone()
        }

        fn control(&self) -> Arc<MemoryTransport> {
            self.bound()[1].clone()
        }
    }

    #[async_trait]
    impl TransportFactory for MemoryFactory {
        async fn bind(
            &self,
            addr: SocketAddr,
            _send_buffer_size: usize,
            _receive_buffer_size: usize,
        ) -> SessionResult<Arc<dyn PacketTransport>> {
            let mut transports = self.transports.lock().unwrap();
            if let Some(limit) = *self.fail_after.lock().unwrap() {
                if transports.len() >= limit {
                    return Err(SessionError::BindFailure(format!("No capacity for {}", addr)));
                }
            }
            let transport = Arc::new(MemoryTransport {
                local_addr: addr,
                sent: StdMutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            });
            transports.push(transport.clone());
            Ok(transport)
        }
    }

    #[derive(Default)]
    struct RecordingEvents {
        conflicts: StdMutex<Vec<(u32, u32)>>,
        joined_from_data: StdMutex<Vec<u32>>,
        joined_from_control: StdMutex<Vec<u32>>,
        updated: StdMutex<Vec<u32>>,
        left: StdMutex<Vec<u32>>,
        terminated: StdMutex<Vec<Option<String>>>,
    }

    impl SessionEventListener for RecordingEvents {
        fn ssrc_conflict_resolved(&self, _session: &RtpSession, old_ssrc: u32, new_ssrc: u32) {
            self.conflicts.lock().unwrap().push((old_ssrc, new_ssrc));
        }

        fn participant_joined_from_data(
            &self,
            _session: &RtpSession,
            participant: RtpParticipant,
            _packet: &DataPacket,
        ) {
            self.joined_from_data.lock().unwrap().push(participant.ssrc);
        }

        fn participant_joined_from_control(
            &self,
            _session: &RtpSession,
            participant: RtpParticipant,
            _chunk: &SdesChunk,
        ) {
            self.joined_from_control.lock().unwrap().push(participant.ssrc);
        }

        fn participant_data_updated(&self, _session: &RtpSession, participant: RtpParticipant) {
            self.updated.lock().unwrap().push(participant.ssrc);
        }

        fn participant_left(&self, _session: &RtpSession, participant: RtpParticipant) {
            self.left.lock().unwrap().push(participant.ssrc);
        }

        fn session_terminated(&self, _session: &RtpSession, cause: Option<&str>) {
            self.terminated.lock().unwrap().push(cause.map(str::to_string));
        }
    }

    #[derive(Default)]
    struct RecordingData {
        packets: StdMutex<Vec<(u32, u16)>>,
    }

    impl DataListener for RecordingData {
        fn data_packet_received(
            &self,
            _session: &RtpSession,
            participant: RtpParticipant,
            packet: DataPacket,
        ) {
            self.packets
                .lock()
                .unwrap()
                .push((participant.ssrc, packet.sequence_number));
        }
    }

    #[derive(Default)]
    struct RecordingControl {
        compounds: StdMutex<Vec<CompoundControlPacket>>,
        app_packets: StdMutex<Vec<AppData>>,
    }

    impl ControlListener for RecordingControl {
        fn control_packet_received(&self, _session: &RtpSession, compound: CompoundControlPacket) {
            self.compounds.lock().unwrap().push(compound);
        }

        fn app_data_received(&self, _session: &RtpSession, packet: AppData) {
            self.app_packets.lock().unwrap().push(packet);
        }
    }

    fn create_test_session() -> (Arc<RtpSession>, Arc<MemoryFactory>) {
        let local = RtpParticipant::new(0xA1, local_addr(5000), local_addr(5001));
        let session = RtpSession::new("test-session", 96, local).unwrap();
        let factory = Arc::new(MemoryFactory::default());
        session.set_transport_factory(factory.clone()).unwrap();
        (session, factory)
    }

    fn remote_participant(ssrc: u32, host: u8) -> RtpParticipant {
        RtpParticipant::new(ssrc, addr(host, 6000), addr(host, 6001))
    }

    fn data_packet(ssrc: u32, sequence: u16) -> DataPacket {
        DataPacket {
            marker: false,
            payload_type: 96,
            sequence_number: sequence,
            timestamp: 1000,
            ssrc,
            csrc: vec![],
            extension: None,
            payload: Bytes::from_static(b"payload"),
        }
    }

    fn sdes_compound(ssrc: u32, cname: &str) -> CompoundControlPacket {
        CompoundControlPacket::new(vec![ControlPacket::SourceDescription(SourceDescription {
            chunks: vec![SdesChunk {
                ssrc,
                items: vec![SdesItem::new(SdesItemType::Cname, cname)],
            }],
        })])
    }

    fn bye_compound(ssrc: u32) -> CompoundControlPacket {
        CompoundControlPacket::new(vec![ControlPacket::Bye(Goodbye {
            ssrcs: vec![ssrc],
            reason: None,
        })])
    }

    #[test]
    fn test_payload_type_bounds() {
        let local = remote_participant(1, 9);
        assert!(matches!(
            RtpSession::new("s", 128, local.clone()).err(),
            Some(SessionError::InvalidPayloadType(128))
        ));
        assert!(RtpSession::new("s", 0, local.clone()).is_ok());
        assert!(RtpSession::new("s", 127, local).is_ok());
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let (session, factory) = create_test_session();

        assert!(session.init().await);
        assert!(session.init().await);

        // The second call did not rebind
        assert_eq!(factory.bound().len(), 2);
        assert!(session.is_running());
    }

    #[tokio::test]
    async fn test_bind_failure_releases_transports() {
        let (session, factory) = create_test_session();
        *factory.fail_after.lock().unwrap() = Some(1);

        assert!(!session.init().await);
        assert!(!session.is_running());
        assert!(factory.data().closed.load(Ordering::Acquire));

        // A failed init is absorbing
        *factory.fail_after.lock().unwrap() = None;
        assert!(!session.init().await);
    }

    #[tokio::test]
    async fn test_send_before_init_fails() {
        let (session, _factory) = create_test_session();
        assert!(!session.send_data(Bytes::from_static(b"x"), 1000, false).await);
    }

    #[tokio::test]
    async fn test_configuration_immutable_while_running() {
        let (session, _factory) = create_test_session();
        session.set_discard_out_of_order(false).unwrap();

        session.init().await;

        assert!(matches!(
            session.set_discard_out_of_order(true),
            Err(SessionError::ConfigurationImmutable)
        ));
        assert!(matches!(
            session.set_automated_rtcp_handling(false),
            Err(SessionError::ConfigurationImmutable)
        ));
    }

    #[tokio::test]
    async fn test_sequence_numbers_are_assigned_in_order() {
        let (session, factory) = create_test_session();
        session.add_participant(remote_participant(1, 10)).await;
        session.add_participant(remote_participant(2, 11)).await;
        session.init().await;

        assert!(session.send_data(Bytes::from_static(b"x"), 1000, false).await);
        assert!(session.send_data(Bytes::from_static(b"y"), 2000, true).await);

        let sent = factory.data().sent();
        assert_eq!(sent.len(), 4); // two packets, two recipients each

        let mut sequences: Vec<u16> = sent
            .iter()
            .map(|(bytes, _)| DataPacket::parse(bytes).unwrap())
            .inspect(|packet| {
                assert_eq!(packet.payload_type, 96);
                assert_eq!(packet.ssrc, 0xA1);
            })
            .map(|packet| packet.sequence_number)
            .collect();
        sequences.sort_unstable();
        sequences.dedup();
        assert_eq!(sequences, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_self_loop_terminates_session() {
        let (session, _factory) = create_test_session();
        let events = Arc::new(RecordingEvents::default());
        let data = Arc::new(RecordingData::default());
        session.add_event_listener(events.clone());
        session.add_data_listener(data.clone());
        session.init().await;

        session.on_data(local_addr(5000), data_packet(0xA1, 1)).await;

        let terminated = events.terminated.lock().unwrap().clone();
        assert_eq!(terminated.len(), 1);
        assert!(terminated[0].as_deref().unwrap().starts_with("Loop detected"));
        assert!(!session.is_running());
        assert!(data.packets.lock().unwrap().is_empty());
        assert!(!session.send_data(Bytes::from_static(b"x"), 1, false).await);
    }

    #[tokio::test]
    async fn test_silent_ssrc_rotation_before_any_traffic() {
        let (session, factory) = create_test_session();
        let events = Arc::new(RecordingEvents::default());
        session.add_event_listener(events.clone());
        session.init().await;
        factory.control().clear();

        session.on_data(addr(10, 5000), data_packet(0xA1, 1)).await;

        let conflicts = events.conflicts.lock().unwrap().clone();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].0, 0xA1);
        assert_ne!(conflicts[0].1, 0xA1);
        assert_eq!(session.local_ssrc(), conflicts[0].1);

        // Rotation was silent: no one had seen the old SSRC
        assert!(factory.control().sent().is_empty());

        // The packet itself was processed against a fresh context
        let context = session.get_remote_participant(0xA1).await.unwrap();
        assert_eq!(context.received_packets(), 1);
        assert!(session.is_running());
    }

    #[tokio::test]
    async fn test_announced_ssrc_rotation_after_traffic() {
        let (session, factory) = create_test_session();
        session.add_participant(remote_participant(7, 12)).await;
        session.init().await;

        assert!(session.send_data(Bytes::from_static(b"x"), 1, false).await);
        factory.control().clear();

        session.on_data(addr(10, 5000), data_packet(0xA1, 1)).await;

        // One leave compound for the old SSRC and one join for the new,
        // both addressed to the registered participant
        let sent = factory.control().sent();
        assert_eq!(sent.len(), 2);

        let leave = CompoundControlPacket::parse(&sent[0].0).unwrap();
        assert!(leave.packets.iter().any(|p| matches!(
            p,
            ControlPacket::Bye(bye) if bye.ssrcs == vec![0xA1]
        )));

        let join = CompoundControlPacket::parse(&sent[1].0).unwrap();
        let new_ssrc = session.local_ssrc();
        assert!(matches!(
            &join.packets[0],
            ControlPacket::ReceiverReport(rr) if rr.ssrc == new_ssrc
        ));
    }

    #[tokio::test]
    async fn test_collision_limit_terminates_session() {
        let (session, _factory) = create_test_session();
        let events = Arc::new(RecordingEvents::default());
        session.add_event_listener(events.clone());
        session.init().await;

        // Every rotation is undone so the local SSRC keeps colliding
        for _ in 0..3 {
            let ssrc = session.local_ssrc();
            session.on_data(addr(10, 5000), data_packet(ssrc, 1)).await;
            assert!(session.is_running());
        }
        let ssrc = session.local_ssrc();
        session.on_data(addr(10, 5000), data_packet(ssrc, 1)).await;

        assert!(!session.is_running());
        let terminated = events.terminated.lock().unwrap().clone();
        assert_eq!(
            terminated[0].as_deref(),
            Some("Loop detected after 4 SSRC collisions")
        );
    }

    #[tokio::test]
    async fn test_foreign_payload_type_is_ignored() {
        let (session, _factory) = create_test_session();
        let data = Arc::new(RecordingData::default());
        session.add_data_listener(data.clone());
        session.init().await;

        let mut packet = data_packet(7, 1);
        packet.payload_type = 97;
        session.on_data(addr(10, 5000), packet).await;

        assert!(data.packets.lock().unwrap().is_empty());
        assert!(session.get_remote_participant(7).await.is_none());
    }

    #[tokio::test]
    async fn test_out_of_order_packets_are_dropped() {
        let (session, _factory) = create_test_session();
        let data = Arc::new(RecordingData::default());
        session.add_data_listener(data.clone());
        session.init().await;

        for sequence in [10, 11, 9] {
            session.on_data(addr(10, 5000), data_packet(7, sequence)).await;
        }

        assert_eq!(*data.packets.lock().unwrap(), vec![(7, 10), (7, 11)]);
        let context = session.get_remote_participant(7).await.unwrap();
        assert_eq!(context.last_sequence_number(), Some(11));
    }

    #[tokio::test]
    async fn test_out_of_order_packets_kept_when_policy_off() {
        let (session, _factory) = create_test_session();
        session.set_discard_out_of_order(false).unwrap();
        let data = Arc::new(RecordingData::default());
        session.add_data_listener(data.clone());
        session.init().await;

        for sequence in [10, 9] {
            session.on_data(addr(10, 5000), data_packet(7, sequence)).await;
        }

        assert_eq!(*data.packets.lock().unwrap(), vec![(7, 10), (7, 9)]);
    }

    #[tokio::test]
    async fn test_data_address_repair() {
        let (session, _factory) = create_test_session();
        session.init().await;

        session.on_data(addr(10, 5000), data_packet(7, 1)).await;
        session.on_data(addr(11, 5000), data_packet(7, 2)).await;

        let context = session.get_remote_participant(7).await.unwrap();
        assert_eq!(context.data_address(), addr(11, 5000));
    }

    #[tokio::test]
    async fn test_bye_excludes_participant_from_fanout() {
        let (session, factory) = create_test_session();
        let events = Arc::new(RecordingEvents::default());
        session.add_event_listener(events.clone());
        session.add_participant(remote_participant(1, 10)).await;
        session.add_participant(remote_participant(2, 11)).await;
        session.init().await;

        session.on_control(addr(10, 6001), bye_compound(1)).await;
        assert_eq!(*events.left.lock().unwrap(), vec![1]);

        factory.data().clear();
        assert!(session.send_data(Bytes::from_static(b"x"), 1000, false).await);

        let sent = factory.data().sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, addr(11, 6000));
    }

    #[tokio::test]
    async fn test_sdes_first_join_then_data() {
        let (session, _factory) = create_test_session();
        let events = Arc::new(RecordingEvents::default());
        let data = Arc::new(RecordingData::default());
        session.add_event_listener(events.clone());
        session.add_data_listener(data.clone());
        session.init().await;

        session.on_control(addr(10, 6001), sdes_compound(7, "alice")).await;
        session.on_data(addr(10, 6000), data_packet(7, 1)).await;

        assert_eq!(*events.joined_from_control.lock().unwrap(), vec![7]);
        assert!(events.joined_from_data.lock().unwrap().is_empty());
        assert_eq!(*data.packets.lock().unwrap(), vec![(7, 1)]);

        let context = session.get_remote_participant(7).await.unwrap();
        assert_eq!(context.participant().cname.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_sdes_updates_only_once() {
        let (session, _factory) = create_test_session();
        let events = Arc::new(RecordingEvents::default());
        session.add_event_listener(events.clone());
        session.init().await;

        // Discovered through data, described twice through control
        session.on_data(addr(10, 6000), data_packet(7, 1)).await;
        session.on_control(addr(10, 6001), sdes_compound(7, "alice")).await;
        session.on_control(addr(10, 6001), sdes_compound(7, "mallory")).await;

        assert_eq!(*events.updated.lock().unwrap(), vec![7]);
        let context = session.get_remote_participant(7).await.unwrap();
        assert_eq!(context.participant().cname.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_reports_from_unknown_sources_are_ignored() {
        let (session, _factory) = create_test_session();
        session.init().await;

        let compound = CompoundControlPacket::new(vec![ControlPacket::ReceiverReport(
            ReceiverReport {
                ssrc: 42,
                reception_reports: vec![ReceptionReport::zeroed(0xA1)],
            },
        )]);
        session.on_control(addr(10, 6001), compound).await;

        assert!(session.get_remote_participant(42).await.is_none());
    }

    #[tokio::test]
    async fn test_app_data_is_dispatched_under_automation() {
        let (session, _factory) = create_test_session();
        let control = Arc::new(RecordingControl::default());
        session.add_control_listener(control.clone());
        session.init().await;

        let app = AppData {
            subtype: 1,
            ssrc: 42,
            name: *b"chat",
            data: Bytes::from_static(&[0, 0, 0, 1]),
        };
        let compound = CompoundControlPacket::new(vec![ControlPacket::AppData(app.clone())]);
        session.on_control(addr(10, 6001), compound).await;

        assert_eq!(*control.app_packets.lock().unwrap(), vec![app]);
        assert!(control.compounds.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_raw_compound_forwarded_when_automation_off() {
        let (session, _factory) = create_test_session();
        session.set_automated_rtcp_handling(false).unwrap();
        let events = Arc::new(RecordingEvents::default());
        let control = Arc::new(RecordingControl::default());
        session.add_event_listener(events.clone());
        session.add_control_listener(control.clone());
        session.init().await;

        session.on_control(addr(10, 6001), bye_compound(1)).await;

        // No automated bookkeeping happened, only raw forwarding
        assert_eq!(control.compounds.lock().unwrap().len(), 1);
        assert!(events.left.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_control_send_guard() {
        let (session, _factory) = create_test_session();
        session.add_participant(remote_participant(1, 10)).await;
        session.init().await;

        let report = ControlPacket::ReceiverReport(ReceiverReport {
            ssrc: 0xA1,
            reception_reports: vec![],
        });
        assert!(!session.send_control_packet(report).await);

        // APP packets bypass the automation guard
        let app = ControlPacket::AppData(AppData {
            subtype: 0,
            ssrc: 0xA1,
            name: *b"chat",
            data: Bytes::new(),
        });
        assert!(session.send_control_packet(app).await);
    }

    #[tokio::test]
    async fn test_control_send_allowed_without_automation() {
        let (session, factory) = create_test_session();
        session.set_automated_rtcp_handling(false).unwrap();
        session.add_participant(remote_participant(1, 10)).await;
        session.init().await;

        let report = ControlPacket::ReceiverReport(ReceiverReport {
            ssrc: 0xA1,
            reception_reports: vec![],
        });
        assert!(session.send_control_packet(report).await);

        let sent = factory.control().sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, addr(10, 6001));
    }

    #[tokio::test]
    async fn test_join_compound_emitted_at_init() {
        let (session, factory) = create_test_session();
        session.add_participant(remote_participant(1, 10)).await;
        session.init().await;

        let sent = factory.control().sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, addr(10, 6001));

        let compound = CompoundControlPacket::parse(&sent[0].0).unwrap();
        assert_eq!(compound.packets.len(), 2);
        match &compound.packets[0] {
            ControlPacket::ReceiverReport(rr) => {
                assert_eq!(rr.ssrc, 0xA1);
                assert!(rr.reception_reports.is_empty());
            }
            other => panic!("expected receiver report, got {:?}", other),
        }
        match &compound.packets[1] {
            ControlPacket::SourceDescription(sdes) => {
                assert_eq!(
                    sdes.chunks[0].item(SdesItemType::Cname),
                    Some("efflux/test-session@127.0.0.1:5000")
                );
            }
            other => panic!("expected source description, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_terminate_emits_leave_compounds() {
        let (session, factory) = create_test_session();
        let events = Arc::new(RecordingEvents::default());
        session.add_event_listener(events.clone());
        session.add_participant(remote_participant(1, 10)).await;
        session.init().await;

        assert!(session.send_data(Bytes::from_static(b"x"), 1, false).await);
        factory.control().clear();

        session.terminate().await;

        let sent = factory.control().sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, addr(10, 6001));

        let compound = CompoundControlPacket::parse(&sent[0].0).unwrap();
        assert_eq!(compound.packets.len(), 3);
        // Data was sent to this participant, so the report is a sender
        // report with the captured counters
        match &compound.packets[0] {
            ControlPacket::SenderReport(sr) => {
                assert_eq!(sr.ssrc, 0xA1);
                assert_eq!(sr.sender_packet_count, 1);
            }
            other => panic!("expected sender report, got {:?}", other),
        }
        match &compound.packets[2] {
            ControlPacket::Bye(bye) => {
                assert_eq!(bye.ssrcs, vec![0xA1]);
                assert_eq!(bye.reason.as_deref(), Some("Session terminated"));
            }
            other => panic!("expected BYE, got {:?}", other),
        }

        assert_eq!(events.terminated.lock().unwrap().len(), 1);
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let (session, _factory) = create_test_session();
        let events = Arc::new(RecordingEvents::default());
        session.add_event_listener(events.clone());
        session.init().await;

        session.terminate().await;
        session.terminate().await;
        session.terminate_with("again").await;

        assert_eq!(events.terminated.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_no_traffic_after_terminate() {
        let (session, factory) = create_test_session();
        let data = Arc::new(RecordingData::default());
        session.add_data_listener(data.clone());
        session.add_participant(remote_participant(1, 10)).await;
        session.init().await;
        session.terminate().await;
        factory.data().clear();

        assert!(!session.send_data(Bytes::from_static(b"x"), 1, false).await);
        session.on_data(addr(10, 6000), data_packet(7, 1)).await;

        assert!(factory.data().sent().is_empty());
        assert!(data.packets.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_participant_rejects_local_ssrc() {
        let (session, _factory) = create_test_session();
        assert!(!session.add_participant(remote_participant(0xA1, 10)).await);
        assert!(session.get_remote_participants().await.is_empty());
    }

    #[tokio::test]
    async fn test_add_participant_is_idempotent() {
        let (session, _factory) = create_test_session();
        assert!(session.add_participant(remote_participant(1, 10)).await);
        assert!(!session.add_participant(remote_participant(1, 10)).await);
        assert_eq!(session.get_remote_participants().await.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_participant_returns_context() {
        let (session, _factory) = create_test_session();
        session.add_participant(remote_participant(1, 10)).await;

        let removed = session.remove_participant(1).await.unwrap();
        assert_eq!(removed.ssrc(), 1);
        assert!(session.remove_participant(1).await.is_none());
    }

    struct RejectAll;

    impl AdmissionPolicy for RejectAll {
        fn admit_unknown(
            &self,
            _origin: SocketAddr,
            _first_packet: &DataPacket,
        ) -> ParticipantDecision {
            ParticipantDecision::Reject
        }
    }

    #[tokio::test]
    async fn test_admission_policy_can_reject_unknown_sources() {
        let (session, _factory) = create_test_session();
        session.set_admission_policy(Arc::new(RejectAll)).unwrap();
        let data = Arc::new(RecordingData::default());
        session.add_data_listener(data.clone());
        session.init().await;

        session.on_data(addr(10, 5000), data_packet(7, 1)).await;

        assert!(session.get_remote_participant(7).await.is_none());
        assert!(data.packets.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_routine_reports_are_emitted_periodically() {
        let (session, factory) = create_test_session();
        session.set_report_interval(Duration::from_secs(5)).unwrap();
        session.add_participant(remote_participant(1, 10)).await;
        session.init().await;
        factory.control().clear();

        tokio::time::sleep(Duration::from_millis(5100)).await;
        tokio::task::yield_now().await;

        let sent = factory.control().sent();
        assert!(!sent.is_empty());
        let compound = CompoundControlPacket::parse(&sent[0].0).unwrap();
        assert_eq!(compound.packets.len(), 2);
        assert!(matches!(compound.packets[0], ControlPacket::ReceiverReport(_)));
        assert!(matches!(compound.packets[1], ControlPacket::SourceDescription(_)));

        session.terminate().await;
    }
}
