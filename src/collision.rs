//! SSRC collision and loop detection (RFC 3550 Section 8)
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


use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};

/// Classification of inbound traffic claiming the local SSRC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionAssessment {
    /// The traffic originates from our own data endpoint
    SelfLoop,
    /// Too many distinct-origin collisions; the network is looping our
    /// traffic back (carries the observed collision count)
    LimitExceeded(u32),
    /// A genuine third party collided with our SSRC; rotate it
    ForeignCollision,
}

/// Tracks foreign-origin collisions against the local SSRC
#[derive(Debug, Default)]
pub struct CollisionDetector {
    collisions: AtomicU32,
}

impl CollisionDetector {
    /// Create a detector with a zero collision count
    pub fn new() -> Self {
        CollisionDetector {
            collisions: AtomicU32::new(0),
        }
    }

    /// Classify a packet that carries the local SSRC.
    ///
    /// A foreign origin counts as one collision; past `limit` collisions
    /// the traffic is declared a loop.
    pub fn assess(
        &self,
        origin: SocketAddr,
        local_data_address: SocketAddr,
        limit: u32,
    ) -> CollisionAssessment {
        if origin == local_data_address {
            return CollisionAssessment::SelfLoop;
        }

        let seen = self.collisions.fetch_add(1, Ordering::AcqRel) + 1;
        if seen > limit {
            CollisionAssessment::LimitExceeded(seen)
        } else {
            CollisionAssessment::ForeignCollision
        }
    }

    /// Number of foreign-origin collisions observed so far
    pub fn count(&self) -> u32 {
        self.collisions.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn create_test_addr(host: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, host)), port)
    }

    #[test]
    fn test_own_origin_is_a_self_loop() {
        let detector = CollisionDetector::new();
        let local = create_test_addr(1, 5000);

        assert_eq!(detector.assess(local, local, 3), CollisionAssessment::SelfLoop);
        assert_eq!(detector.count(), 0);
    }

    #[test]
    fn test_foreign_collisions_until_limit() {
        let detector = CollisionDetector::new();
        let local = create_test_addr(1, 5000);
        let foreign = create_test_addr(2, 5000);

        for _ in 0..3 {
            assert_eq!(
                detector.assess(foreign, local, 3),
                CollisionAssessment::ForeignCollision
            );
        }
        assert_eq!(
            detector.assess(foreign, local, 3),
            CollisionAssessment::LimitExceeded(4)
        );
    }
}
