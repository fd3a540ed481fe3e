//! Participant identity and per-session participant state
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


use crate::rtp::DataPacket;
use crate::rtcp::{SdesChunk, SdesItemType};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Stable identity of a local or remote media source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpParticipant {
    /// SSRC identifying this source
    pub ssrc: u32,
    /// UDP endpoint for RTP data
    pub data_address: SocketAddr,
    /// UDP endpoint for RTCP control traffic
    pub control_address: SocketAddr,
    /// Canonical name (SDES CNAME)
    pub cname: Option<String>,
    /// User name (SDES NAME)
    pub name: Option<String>,
    /// Electronic mail address (SDES EMAIL)
    pub email: Option<String>,
    /// Phone number (SDES PHONE)
    pub phone: Option<String>,
    /// Geographic location (SDES LOC)
    pub location: Option<String>,
    /// Application or tool name (SDES TOOL)
    pub tool: Option<String>,
    /// Notice/status (SDES NOTE)
    pub note: Option<String>,
    // SSRCs this participant has already collided with; never reused.
    known_collisions: Vec<u32>,
}

impl RtpParticipant {
    /// Create a participant with the given SSRC and endpoints
    pub fn new(ssrc: u32, data_address: SocketAddr, control_address: SocketAddr) -> Self {
        RtpParticipant {
            ssrc,
            data_address,
            control_address,
            cname: None,
            name: None,
            email: None,
            phone: None,
            location: None,
            tool: None,
            note: None,
            known_collisions: Vec::new(),
        }
    }

    /// Create a participant with a randomly generated SSRC
    pub fn with_random_ssrc(data_address: SocketAddr, control_address: SocketAddr) -> Self {
        Self::new(rand::random::<u32>(), data_address, control_address)
    }

    /// Build a participant for a source first seen through RTP data.
    ///
    /// Both endpoints start at the datagram origin until SDES or address
    /// repair says otherwise.
    pub fn from_data(origin: SocketAddr, packet: &DataPacket) -> Self {
        Self::new(packet.ssrc, origin, origin)
    }

    /// Build a participant for a source first seen through an SDES chunk
    pub fn from_sdes(origin: SocketAddr, chunk: &SdesChunk) -> Self {
        let mut participant = Self::new(chunk.ssrc, origin, origin);
        participant.apply_sdes(chunk);
        participant
    }

    /// Apply the descriptive items of an SDES chunk
    pub fn apply_sdes(&mut self, chunk: &SdesChunk) {
        for item in &chunk.items {
            let value = Some(item.value.clone());
            match item.item_type {
                SdesItemType::Cname => self.cname = value,
                SdesItemType::Name => self.name = value,
                SdesItemType::Email => self.email = value,
                SdesItemType::Phone => self.phone = value,
                SdesItemType::Loc => self.location = value,
                SdesItemType::Tool => self.tool = value,
                SdesItemType::Note => self.note = value,
                SdesItemType::Priv => {}
            }
        }
    }

    /// Resolve an SSRC collision with `observed`.
    ///
    /// Records the colliding value, adopts a fresh SSRC distinct from the
    /// current one and from every previously observed collision, and
    /// returns it.
    pub fn resolve_ssrc_conflict(&mut self, observed: u32) -> u32 {
        if !self.known_collisions.contains(&observed) {
            self.known_collisions.push(observed);
        }

        let mut candidate = rand::random::<u32>();
        while candidate == self.ssrc || self.known_collisions.contains(&candidate) {
            candidate = rand::random::<u32>();
        }
        self.ssrc = candidate;
        candidate
    }
}

// Sentinel for "no sequence number seen yet"; any first packet is accepted.
const NO_SEQUENCE: i32 = -1;

/// Per-session state attached to a participant.
///
/// Traffic counters are atomic so outbound fanout can record sends while
/// holding only the registry read lock; identity fields sit behind their
/// own lock for address repair and SDES updates. The BYE and SDES flags
/// are latches: once set they are never cleared.
#[derive(Debug)]
pub struct ParticipantContext {
    participant: RwLock<RtpParticipant>,
    last_sequence_number: AtomicI32,
    sent_packets: AtomicU64,
    sent_bytes: AtomicU64,
    received_packets: AtomicU64,
    received_bytes: AtomicU64,
    bye_received: AtomicBool,
    sdes_received: AtomicBool,
}

impl ParticipantContext {
    /// Wrap a participant in fresh session state
    pub fn new(participant: RtpParticipant) -> Self {
        ParticipantContext {
            participant: RwLock::new(participant),
            last_sequence_number: AtomicI32::new(NO_SEQUENCE),
            sent_packets: AtomicU64::new(0),
            sent_bytes: AtomicU64::new(0),
            received_packets: AtomicU64::new(0),
            received_bytes: AtomicU64::new(0),
            bye_received: AtomicBool::new(false),
            sdes_received: AtomicBool::new(false),
        }
    }

    fn read_participant(&self) -> RwLockReadGuard<'_, RtpParticipant> {
        self.participant.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_participant(&self) -> RwLockWriteGuard<'_, RtpParticipant> {
        self.participant.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of the participant identity
    pub fn participant(&self) -> RtpParticipant {
        self.read_participant().clone()
    }

    /// SSRC of this participant
    pub fn ssrc(&self) -> u32 {
        self.read_participant().ssrc
    }

    /// Current RTP data endpoint
    pub fn data_address(&self) -> SocketAddr {
        self.read_participant().data_address
    }

    /// Current RTCP control endpoint
    pub fn control_address(&self) -> SocketAddr {
        self.read_participant().control_address
    }

    /// Rebind the RTP data endpoint
    pub fn set_data_address(&self, address: SocketAddr) {
        self.write_participant().data_address = address;
    }

    /// Rebind the RTCP control endpoint
    pub fn set_control_address(&self, address: SocketAddr) {
        self.write_participant().control_address = address;
    }

    /// Check an incoming sequence number against the last one seen and
    /// record it.
    ///
    /// With `discard_out_of_order`, a sequence number at or below the last
    /// seen is rejected. The comparison is a raw integer compare, so a
    /// stream wrapping past 65535 has its first wrapped packet rejected.
    pub fn accept_sequence(&self, sequence: u16, discard_out_of_order: bool) -> bool {
        let last = self.last_sequence_number.load(Ordering::Acquire);
        if discard_out_of_order && last >= sequence as i32 {
            return false;
        }
        self.last_sequence_number.store(sequence as i32, Ordering::Release);
        true
    }

    /// Highest sequence number seen, if any packet arrived yet
    pub fn last_sequence_number(&self) -> Option<u16> {
        match self.last_sequence_number.load(Ordering::Acquire) {
            NO_SEQUENCE => None,
            value => Some(value as u16),
        }
    }

    /// Record an inbound packet from this participant
    pub fn record_received(&self, bytes: usize) {
        self.received_packets.fetch_add(1, Ordering::Relaxed);
        self.received_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record an outbound packet addressed to this participant
    pub fn record_sent(&self, bytes: usize) {
        self.sent_packets.fetch_add(1, Ordering::Relaxed);
        self.sent_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Packets sent to this participant since the last report
    pub fn sent_packets(&self) -> u64 {
        self.sent_packets.load(Ordering::Relaxed)
    }

    /// Bytes sent to this participant since the last report
    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes.load(Ordering::Relaxed)
    }

    /// Packets received from this participant
    pub fn received_packets(&self) -> u64 {
        self.received_packets.load(Ordering::Relaxed)
    }

    /// Bytes received from this participant
    pub fn received_bytes(&self) -> u64 {
        self.received_bytes.load(Ordering::Relaxed)
    }

    /// Capture and reset the send counters, for sender report assembly
    pub fn take_send_stats(&self) -> (u64, u64) {
        (
            self.sent_packets.swap(0, Ordering::Relaxed),
            self.sent_bytes.swap(0, Ordering::Relaxed),
        )
    }

    /// Latch the BYE flag; returns true only on the first call
    pub fn mark_bye(&self) -> bool {
        !self.bye_received.swap(true, Ordering::AcqRel)
    }

    /// Whether a BYE was received from this participant
    pub fn bye_received(&self) -> bool {
        self.bye_received.load(Ordering::Acquire)
    }

    /// Latch the SDES flag without touching descriptive fields, for
    /// contexts whose participant was created from an SDES chunk
    pub fn mark_sdes(&self) {
        self.sdes_received.store(true, Ordering::Release);
    }

    /// Whether a source description has been applied
    pub fn sdes_received(&self) -> bool {
        self.sdes_received.load(Ordering::Acquire)
    }

    /// Apply an SDES chunk to the participant's descriptive fields.
    ///
    /// Only the first description is applied; returns false once latched.
    pub fn update_description(&self, chunk: &SdesChunk) -> bool {
        if self.sdes_received.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.write_participant().apply_sdes(chunk);
        true
    }
}
