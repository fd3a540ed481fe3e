//! Concurrent participant registry keyed by SSRC
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


use crate::participant::{ParticipantContext, RtpParticipant};
use crate::rtp::DataPacket;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard};

/// Decision taken for a source not yet present in the registry
#[derive(Debug, Clone)]
pub enum ParticipantDecision {
    /// Admit the source with this participant identity
    Create(RtpParticipant),
    /// Drop the packet and keep the source out of the registry
    Reject,
}

/// Policy consulted when RTP data arrives from an unknown SSRC
pub trait AdmissionPolicy: Send + Sync {
    /// Decide whether a participant is created for the source of
    /// `first_packet`
    fn admit_unknown(&self, origin: SocketAddr, first_packet: &DataPacket) -> ParticipantDecision;
}

/// Default policy: every unknown source is admitted, with both endpoints
/// set to the datagram origin
#[derive(Debug, Default)]
pub struct AdmitAll;

impl AdmissionPolicy for AdmitAll {
    fn admit_unknown(&self, origin: SocketAddr, first_packet: &DataPacket) -> ParticipantDecision {
        ParticipantDecision::Create(RtpParticipant::from_data(origin, first_packet))
    }
}

/// SSRC → context map with reader/writer discipline.
///
/// Lookups and fanout iteration take the read lock; insert, remove and
/// get-or-create take the write lock. The read guard is exposed so that
/// outbound fanout can keep recipient addresses valid for the duration of
/// its loop, transport writes included.
#[derive(Debug, Default)]
pub struct ParticipantRegistry {
    participants: RwLock<HashMap<u32, Arc<ParticipantContext>>>,
}

impl ParticipantRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        ParticipantRegistry {
            participants: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a participant; returns true iff a new entry was created
    pub async fn insert(&self, participant: RtpParticipant) -> bool {
        let mut map = self.participants.write().await;
        if map.contains_key(&participant.ssrc) {
            return false;
        }
        let ssrc = participant.ssrc;
        map.insert(ssrc, Arc::new(ParticipantContext::new(participant)));
        true
    }

    /// Remove and return the context for `ssrc`
    pub async fn remove(&self, ssrc: u32) -> Option<Arc<ParticipantContext>> {
        self.participants.write().await.remove(&ssrc)
    }

    /// Look up the context for `ssrc`
    pub async fn get(&self, ssrc: u32) -> Option<Arc<ParticipantContext>> {
        self.participants.read().await.get(&ssrc).cloned()
    }

    /// Look up `ssrc`, creating a context from `make` when absent.
    ///
    /// Returns the context and whether it was created by this call, or
    /// None when `make` declined creation.
    pub async fn get_or_create(
        &self,
        ssrc: u32,
        make: impl FnOnce() -> Option<RtpParticipant>,
    ) -> Option<(Arc<ParticipantContext>, bool)> {
        if let Some(context) = self.participants.read().await.get(&ssrc) {
            return Some((context.clone(), false));
        }

        let mut map = self.participants.write().await;
        // Re-check: another writer may have won the race
        if let Some(context) = map.get(&ssrc) {
            return Some((context.clone(), false));
        }
        let context = Arc::new(ParticipantContext::new(make()?));
        map.insert(ssrc, context.clone());
        Some((context, true))
    }

    /// Snapshot of all contexts
    pub async fn snapshot(&self) -> Vec<Arc<ParticipantContext>> {
        self.participants.read().await.values().cloned().collect()
    }

    /// Number of registered participants
    pub async fn len(&self) -> usize {
        self.participants.read().await.len()
    }

    /// Whether the registry is empty
    pub async fn is_empty(&self) -> bool {
        self.participants.read().await.is_empty()
    }

    // Shared view over the map for fanout iteration. Held across the
    // transport writes so the addresses being written to cannot be
    // removed mid-loop.
    pub(crate) async fn read_guard(
        &self,
    ) -> RwLockReadGuard<'_, HashMap<u32, Arc<ParticipantContext>>> {
        self.participants.read().await
    }
}
