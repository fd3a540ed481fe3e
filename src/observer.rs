//! Observer registration and snapshot-iterated fanout
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


use crate::participant::RtpParticipant;
use crate::rtcp::{AppData, CompoundControlPacket, SdesChunk};
use crate::rtp::DataPacket;
use crate::session::RtpSession;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tracing::warn;

/// Observer for inbound RTP data packets
pub trait DataListener: Send + Sync {
    /// Called for every accepted inbound data packet
    fn data_packet_received(
        &self,
        session: &RtpSession,
        participant: RtpParticipant,
        packet: DataPacket,
    );
}

/// Observer for inbound RTCP traffic
pub trait ControlListener: Send + Sync {
    /// Called with the raw compound when automated RTCP handling is off
    fn control_packet_received(&self, _session: &RtpSession, _compound: CompoundControlPacket) {}

    /// Called for every APP packet, regardless of the automation setting
    fn app_data_received(&self, _session: &RtpSession, _packet: AppData) {}
}

/// Observer for session membership and lifecycle events
pub trait SessionEventListener: Send + Sync {
    /// The local SSRC was rotated after a collision
    fn ssrc_conflict_resolved(&self, _session: &RtpSession, _old_ssrc: u32, _new_ssrc: u32) {}

    /// A participant was discovered through RTP data
    fn participant_joined_from_data(
        &self,
        _session: &RtpSession,
        _participant: RtpParticipant,
        _packet: &DataPacket,
    ) {
    }

    /// A participant was discovered through an SDES chunk
    fn participant_joined_from_control(
        &self,
        _session: &RtpSession,
        _participant: RtpParticipant,
        _chunk: &SdesChunk,
    ) {
    }

    /// A known participant's descriptive fields were updated
    fn participant_data_updated(&self, _session: &RtpSession, _participant: RtpParticipant) {}

    /// A participant announced its departure with a BYE
    fn participant_left(&self, _session: &RtpSession, _participant: RtpParticipant) {}

    /// The session terminated, with the cause when one was given
    fn session_terminated(&self, _session: &RtpSession, _cause: Option<&str>) {}
}

/// Append-only listener list with snapshot iteration.
///
/// A registration concurrent with a fanout may or may not be visible to
/// that fanout, but never corrupts it. A listener that panics is logged
/// and skipped; the remaining listeners still run.
#[derive(Debug)]
pub(crate) struct ListenerSet<L: ?Sized> {
    listeners: RwLock<Vec<Arc<L>>>,
}

impl<L: ?Sized> ListenerSet<L> {
    pub(crate) fn new() -> Self {
        ListenerSet {
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, listener: Arc<L>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    pub(crate) fn remove(&self, listener: &Arc<L>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    pub(crate) fn clear(&self) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<L>> {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn notify(&self, f: impl Fn(&L)) {
        for listener in self.snapshot() {
            if catch_unwind(AssertUnwindSafe(|| f(&listener))).is_err() {
                warn!("Listener panicked during notification; continuing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    trait Counter: Send + Sync {
        fn bump(&self);
    }

    struct Counting(AtomicUsize);

    impl Counter for Counting {
        fn bump(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicking;

    impl Counter for Panicking {
        fn bump(&self) {
            panic!("boom");
        }
    }

    #[test]
    fn test_notify_reaches_all_listeners() {
        let set: ListenerSet<dyn Counter> = ListenerSet::new();
        let a = Arc::new(Counting(AtomicUsize::new(0)));
        let b = Arc::new(Counting(AtomicUsize::new(0)));
        set.add(a.clone());
        set.add(b.clone());

        set.notify(|l| l.bump());

        assert_eq!(a.0.load(Ordering::SeqCst), 1);
        assert_eq!(b.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_unregisters_single_listener() {
        let set: ListenerSet<dyn Counter> = ListenerSet::new();
        let a = Arc::new(Counting(AtomicUsize::new(0)));
        let keep: Arc<dyn Counter> = Arc::new(Counting(AtomicUsize::new(0)));
        let removable: Arc<dyn Counter> = a.clone();
        set.add(keep.clone());
        set.add(removable.clone());

        set.remove(&removable);
        set.notify(|l| l.bump());

        assert_eq!(a.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_fanout() {
        let set: ListenerSet<dyn Counter> = ListenerSet::new();
        let after = Arc::new(Counting(AtomicUsize::new(0)));
        set.add(Arc::new(Panicking) as Arc<dyn Counter>);
        set.add(after.clone());

        set.notify(|l| l.bump());

        assert_eq!(after.0.load(Ordering::SeqCst), 1);
    }
}
