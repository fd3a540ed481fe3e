//! RTP session engine with automated RTCP membership handling
//!
//! This crate provides the session layer for real-time media transport
//! over UDP, including:
//! - RTP and RTCP packet parsing and construction (RFC 3550)
//! - A concurrent participant registry keyed by SSRC
//! - Automated RTCP bookkeeping: join, routine and leave compounds
//! - SSRC collision detection and resolution (RFC 3550 Section 8)
//! - Observer fanout for data, control and membership events
//!
//! A session is created with [`RtpSession::new`], configured, initialized
//! with [`RtpSession::init`] and torn down with [`RtpSession::terminate`].
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


pub mod collision;
pub mod config;
pub mod error;
pub mod observer;
pub mod participant;
pub mod registry;
pub mod reports;
pub mod rtcp;
pub mod rtp;
pub mod session;
pub mod transport;

// Re-export main types
pub use collision::{CollisionAssessment, CollisionDetector};
pub use config::SessionConfig;
pub use error::{SessionError, SessionResult};
pub use observer::{ControlListener, DataListener, SessionEventListener};
pub use participant::{ParticipantContext, RtpParticipant};
pub use registry::{AdmissionPolicy, AdmitAll, ParticipantDecision, ParticipantRegistry};
pub use rtcp::{
    AppData, CompoundControlPacket, ControlPacket, Goodbye, ReceiverReport, ReceptionReport,
    RtcpPacketType, SdesChunk, SdesItem, SdesItemType, SenderReport, SourceDescription,
};
pub use rtp::{DataPacket, RtpExtension};
pub use session::RtpSession;
pub use transport::{
    DatagramSink, PacketTransport, TransportFactory, UdpTransport, UdpTransportFactory,
};
