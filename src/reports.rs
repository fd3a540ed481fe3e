//! Automated RTCP compound assembly
//!
//! Builds the join, leave and routine report compounds the engine emits
//! at lifecycle boundaries, and the SDES packet describing the local
//! participant. Statistic slots in the reports are zero-filled until a
//! metrics component supplies real values.
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
use crate::rtcp::{
    CompoundControlPacket, ControlPacket, Goodbye, ReceiverReport, ReceptionReport, SdesChunk,
    SdesItem, SdesItemType, SenderReport, SourceDescription,
};
use std::net::SocketAddr;

/// TOOL value advertised when the local participant does not set one
pub const TOOL: &str = concat!("efflux/", env!("CARGO_PKG_VERSION"));

/// Build the SDES packet describing the local participant as `ssrc`.
///
/// CNAME and TOOL are always present, synthesized when unset; NAME,
/// EMAIL, PHONE, LOCATION and NOTE appear only when set, in that order.
pub fn build_sdes(
    ssrc: u32,
    local: &RtpParticipant,
    session_id: &str,
    bound_data_address: SocketAddr,
) -> SourceDescription {
    let cname = local
        .cname
        .clone()
        .unwrap_or_else(|| format!("efflux/{}@{}", session_id, bound_data_address));
    let tool = local.tool.clone().unwrap_or_else(|| TOOL.to_string());

    let mut items = vec![
        SdesItem::new(SdesItemType::Cname, cname),
        SdesItem::new(SdesItemType::Tool, tool),
    ];
    if let Some(ref name) = local.name {
        items.push(SdesItem::new(SdesItemType::Name, name.clone()));
    }
    if let Some(ref email) = local.email {
        items.push(SdesItem::new(SdesItemType::Email, email.clone()));
    }
    if let Some(ref phone) = local.phone {
        items.push(SdesItem::new(SdesItemType::Phone, phone.clone()));
    }
    if let Some(ref location) = local.location {
        items.push(SdesItem::new(SdesItemType::Loc, location.clone()));
    }
    if let Some(ref note) = local.note {
        items.push(SdesItem::new(SdesItemType::Note, note.clone()));
    }

    SourceDescription {
        chunks: vec![SdesChunk { ssrc, items }],
    }
}

/// Build the compound announcing the local source: an empty receiver
/// report followed by the local source description
pub fn build_join_compound(
    ssrc: u32,
    local: &RtpParticipant,
    session_id: &str,
    bound_data_address: SocketAddr,
) -> CompoundControlPacket {
    CompoundControlPacket::new(vec![
        ControlPacket::ReceiverReport(ReceiverReport {
            ssrc,
            reception_reports: Vec::new(),
        }),
        ControlPacket::SourceDescription(build_sdes(ssrc, local, session_id, bound_data_address)),
    ])
}

/// Build the report addressed to one participant.
///
/// A sender report when data was sent to the participant since the last
/// report (capturing and resetting the context's send counters), a
/// receiver report otherwise. Carries one zero-filled reception block
/// when traffic from the participant was received.
pub fn build_participant_report(
    reporting_ssrc: u32,
    context: &ParticipantContext,
) -> ControlPacket {
    let reception_reports = if context.received_packets() > 0 {
        vec![ReceptionReport::zeroed(context.ssrc())]
    } else {
        Vec::new()
    };

    if context.sent_packets() > 0 {
        let (packets, bytes) = context.take_send_stats();
        ControlPacket::SenderReport(SenderReport {
            ssrc: reporting_ssrc,
            ntp_timestamp_msw: 0,
            ntp_timestamp_lsw: 0,
            rtp_timestamp: 0,
            sender_packet_count: packets as u32,
            sender_octet_count: bytes as u32,
            reception_reports,
        })
    } else {
        ControlPacket::ReceiverReport(ReceiverReport {
            ssrc: reporting_ssrc,
            reception_reports,
        })
    }
}

/// Build the leave compound addressed to one participant: report, local
/// source description, and a BYE naming `reporting_ssrc` with `motive`
pub fn build_leave_compound(
    reporting_ssrc: u32,
    local: &RtpParticipant,
    session_id: &str,
    bound_data_address: SocketAddr,
    context: &ParticipantContext,
    motive: &str,
) -> CompoundControlPacket {
    CompoundControlPacket::new(vec![
        build_participant_report(reporting_ssrc, context),
        ControlPacket::SourceDescription(build_sdes(
            reporting_ssrc,
            local,
            session_id,
            bound_data_address,
        )),
        ControlPacket::Bye(Goodbye {
            ssrcs: vec![reporting_ssrc],
            reason: Some(motive.to_string()),
        }),
    ])
}

/// Build the routine report compound addressed to one participant:
/// the leave shape without the BYE
pub fn build_routine_compound(
    reporting_ssrc: u32,
    local: &RtpParticipant,
    session_id: &str,
    bound_data_address: SocketAddr,
    context: &ParticipantContext,
) -> CompoundControlPacket {
    CompoundControlPacket::new(vec![
        build_participant_report(reporting_ssrc, context),
        ControlPacket::SourceDescription(build_sdes(
            reporting_ssrc,
            local,
            session_id,
            bound_data_address,
        )),
    ])
}
