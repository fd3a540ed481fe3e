//! RTCP (RTP Control Protocol) packet handling
//!
//! Implements the RFC 3550 control packet types the session engine
//! exchanges: sender/receiver reports, source descriptions, BYE and APP,
//! plus the compound packet framing that shares a single datagram.
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


use crate::error::{SessionError, SessionResult};
use bytes::{BufMut, Bytes, BytesMut};

/// RTCP packet types (RFC 3550 Section 6)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpPacketType {
    /// Sender Report (SR) - 200
    SenderReport = 200,
    /// Receiver Report (RR) - 201
    ReceiverReport = 201,
    /// Source Description (SDES) - 202
    SourceDescription = 202,
    /// Goodbye (BYE) - 203
    Goodbye = 203,
    /// Application Defined (APP) - 204
    ApplicationDefined = 204,
}

impl RtcpPacketType {
    /// Map a wire type octet to a known packet type
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            200 => Some(RtcpPacketType::SenderReport),
            201 => Some(RtcpPacketType::ReceiverReport),
            202 => Some(RtcpPacketType::SourceDescription),
            203 => Some(RtcpPacketType::Goodbye),
            204 => Some(RtcpPacketType::ApplicationDefined),
            _ => None,
        }
    }
}

/// RTCP packet header (RFC 3550 Section 6.1)
///
/// The type octet is kept raw so that compound parsing can step over
/// packet types it does not recognize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpHeader {
    /// Padding flag
    pub padding: bool,
    /// Reception report count (for SR/RR) or source count (for SDES/BYE)
    /// or subtype (for APP)
    pub count: u8,
    /// Packet type octet
    pub packet_type: u8,
    /// Length in 32-bit words minus 1
    pub length: u16,
}

impl RtcpHeader {
    /// Parse an RTCP header from bytes
    pub fn parse(data: &[u8]) -> SessionResult<Self> {
        if data.len() < 4 {
            return Err(SessionError::PacketParse(
                "RTCP header too short".to_string()
            ));
        }

        let first_byte = data[0];
        let version = (first_byte >> 6) & 0x03;
        if version != 2 {
            return Err(SessionError::PacketParse(
                format!("Invalid RTCP version: {}", version)
            ));
        }

        Ok(RtcpHeader {
            padding: (first_byte & 0x20) != 0,
            count: first_byte & 0x1F,
            packet_type: data[1],
            length: u16::from_be_bytes([data[2], data[3]]),
        })
    }
}

// Writes a header with a zero length and returns the offset at which the
// length must be patched once the packet body is complete.
fn put_header(buf: &mut BytesMut, count: u8, packet_type: RtcpPacketType) -> usize {
    let start = buf.len();
    buf.put_u8((2u8 << 6) | (count & 0x1F));
    buf.put_u8(packet_type as u8);
    buf.put_u16(0);
    start
}

// Patch the length field (in 32-bit words minus 1) of a packet that
// started at `start`.
fn patch_length(buf: &mut BytesMut, start: usize) {
    let words = ((buf.len() - start) / 4) - 1;
    buf[start + 2..start + 4].copy_from_slice(&(words as u16).to_be_bytes());
}

fn pad_to_word(buf: &mut BytesMut) {
    while buf.len() % 4 != 0 {
        buf.put_u8(0);
    }
}

/// Reception report block (RFC 3550 Section 6.4.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceptionReport {
    /// SSRC of source
    pub ssrc: u32,
    /// Fraction lost (8 bits)
    pub fraction_lost: u8,
    /// Cumulative number of packets lost (24 bits, signed)
    pub cumulative_packets_lost: i32,
    /// Extended highest sequence number received
    pub extended_sequence_number: u32,
    /// Interarrival jitter
    pub jitter: u32,
    /// Last SR timestamp (LSR)
    pub last_sr_timestamp: u32,
    /// Delay since last SR (DLSR)
    pub delay_since_last_sr: u32,
}

impl ReceptionReport {
    /// Size of a reception report block in bytes
    pub const SIZE: usize = 24;

    /// A block naming `ssrc` with every statistic slot zeroed.
    ///
    /// Used until a metrics component fills the slots.
    pub fn zeroed(ssrc: u32) -> Self {
        ReceptionReport {
            ssrc,
            fraction_lost: 0,
            cumulative_packets_lost: 0,
            extended_sequence_number: 0,
            jitter: 0,
            last_sr_timestamp: 0,
            delay_since_last_sr: 0,
        }
    }

    fn parse(data: &[u8]) -> SessionResult<Self> {
        if data.len() < Self::SIZE {
            return Err(SessionError::PacketParse(
                "Incomplete reception report block".to_string()
            ));
        }

        // Cumulative packets lost is a signed 24-bit quantity
        let raw = ((data[5] as u32) << 16) | ((data[6] as u32) << 8) | (data[7] as u32);
        let cumulative_packets_lost = if raw & 0x0080_0000 != 0 {
            (raw | 0xFF00_0000) as i32
        } else {
            raw as i32
        };

        Ok(ReceptionReport {
            ssrc: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            fraction_lost: data[4],
            cumulative_packets_lost,
            extended_sequence_number: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            jitter: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
            last_sr_timestamp: u32::from_be_bytes([data[16], data[17], data[18], data[19]]),
            delay_since_last_sr: u32::from_be_bytes([data[20], data[21], data[22], data[23]]),
        })
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32(self.ssrc);
        buf.put_u8(self.fraction_lost);
        let lost_bytes = self.cumulative_packets_lost.to_be_bytes();
        buf.put_u8(lost_bytes[1]);
        buf.put_u8(lost_bytes[2]);
        buf.put_u8(lost_bytes[3]);
        buf.put_u32(self.extended_sequence_number);
        buf.put_u32(self.jitter);
        buf.put_u32(self.last_sr_timestamp);
        buf.put_u32(self.delay_since_last_sr);
    }
}

fn parse_report_blocks(count: u8, data: &[u8]) -> SessionResult<Vec<ReceptionReport>> {
    let mut blocks = Vec::with_capacity(count as usize);
    let mut rest = data;
    for _ in 0..count {
        blocks.push(ReceptionReport::parse(rest)?);
        rest = &rest[ReceptionReport::SIZE..];
    }
    Ok(blocks)
}

/// RTCP Sender Report (RFC 3550 Section 6.4.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderReport {
    /// SSRC of sender
    pub ssrc: u32,
    /// NTP timestamp (most significant word)
    pub ntp_timestamp_msw: u32,
    /// NTP timestamp (least significant word)
    pub ntp_timestamp_lsw: u32,
    /// RTP timestamp
    pub rtp_timestamp: u32,
    /// Sender's packet count
    pub sender_packet_count: u32,
    /// Sender's octet count
    pub sender_octet_count: u32,
    /// Reception report blocks (0-31)
    pub reception_reports: Vec<ReceptionReport>,
}

impl SenderReport {
    fn parse_body(count: u8, body: &[u8]) -> SessionResult<Self> {
        let needed = 24 + count as usize * ReceptionReport::SIZE;
        if body.len() < needed {
            return Err(SessionError::PacketParse(
                format!("Sender report too short: {} bytes", body.len())
            ));
        }

        Ok(SenderReport {
            ssrc: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
            ntp_timestamp_msw: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
            ntp_timestamp_lsw: u32::from_be_bytes([body[8], body[9], body[10], body[11]]),
            rtp_timestamp: u32::from_be_bytes([body[12], body[13], body[14], body[15]]),
            sender_packet_count: u32::from_be_bytes([body[16], body[17], body[18], body[19]]),
            sender_octet_count: u32::from_be_bytes([body[20], body[21], body[22], body[23]]),
            reception_reports: parse_report_blocks(count, &body[24..])?,
        })
    }

    fn write(&self, buf: &mut BytesMut) {
        let count = self.reception_reports.len().min(31) as u8;
        let start = put_header(buf, count, RtcpPacketType::SenderReport);
        buf.put_u32(self.ssrc);
        buf.put_u32(self.ntp_timestamp_msw);
        buf.put_u32(self.ntp_timestamp_lsw);
        buf.put_u32(self.rtp_timestamp);
        buf.put_u32(self.sender_packet_count);
        buf.put_u32(self.sender_octet_count);
        for report in self.reception_reports.iter().take(31) {
            report.write(buf);
        }
        patch_length(buf, start);
    }
}

/// RTCP Receiver Report (RFC 3550 Section 6.4.2)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverReport {
    /// SSRC of receiver
    pub ssrc: u32,
    /// Reception report blocks (0-31)
    pub reception_reports: Vec<ReceptionReport>,
}

impl ReceiverReport {
    fn parse_body(count: u8, body: &[u8]) -> SessionResult<Self> {
        let needed = 4 + count as usize * ReceptionReport::SIZE;
        if body.len() < needed {
            return Err(SessionError::PacketParse(
                format!("Receiver report too short: {} bytes", body.len())
            ));
        }

        Ok(ReceiverReport {
            ssrc: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
            reception_reports: parse_report_blocks(count, &body[4..])?,
        })
    }

    fn write(&self, buf: &mut BytesMut) {
        let count = self.reception_reports.len().min(31) as u8;
        let start = put_header(buf, count, RtcpPacketType::ReceiverReport);
        buf.put_u32(self.ssrc);
        for report in self.reception_reports.iter().take(31) {
            report.write(buf);
        }
        patch_length(buf, start);
    }
}

/// SDES item types (RFC 3550 Section 6.5.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdesItemType {
    /// CNAME (Canonical End-Point Identifier) - required
    Cname = 1,
    /// NAME (User Name)
    Name = 2,
    /// EMAIL (Electronic Mail Address)
    Email = 3,
    /// PHONE (Phone Number)
    Phone = 4,
    /// LOC (Geographic User Location)
    Loc = 5,
    /// TOOL (Application or Tool Name)
    Tool = 6,
    /// NOTE (Notice/Status)
    Note = 7,
    /// PRIV (Private Extensions)
    Priv = 8,
}

impl SdesItemType {
    /// Map a wire item type to a known item type
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(SdesItemType::Cname),
            2 => Some(SdesItemType::Name),
            3 => Some(SdesItemType::Email),
            4 => Some(SdesItemType::Phone),
            5 => Some(SdesItemType::Loc),
            6 => Some(SdesItemType::Tool),
            7 => Some(SdesItemType::Note),
            8 => Some(SdesItemType::Priv),
            _ => None,
        }
    }
}

/// SDES item (RFC 3550 Section 6.5)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesItem {
    /// Item type
    pub item_type: SdesItemType,
    /// Item value
    pub value: String,
}

impl SdesItem {
    /// Convenience constructor
    pub fn new(item_type: SdesItemType, value: impl Into<String>) -> Self {
        SdesItem { item_type, value: value.into() }
    }
}

/// SDES chunk (RFC 3550 Section 6.5)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesChunk {
    /// SSRC or CSRC being described
    pub ssrc: u32,
    /// SDES items
    pub items: Vec<SdesItem>,
}

impl SdesChunk {
    /// First item of the given type, if present
    pub fn item(&self, item_type: SdesItemType) -> Option<&str> {
        self.items.iter()
            .find(|i| i.item_type == item_type)
            .map(|i| i.value.as_str())
    }

    // Parses one chunk and returns it with the number of bytes consumed,
    // terminator and alignment padding included.
    fn parse(data: &[u8]) -> SessionResult<(Self, usize)> {
        if data.len() < 4 {
            return Err(SessionError::PacketParse(
                "SDES chunk too short".to_string()
            ));
        }

        let ssrc = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let mut offset = 4;
        let mut items = Vec::new();

        loop {
            if offset >= data.len() {
                return Err(SessionError::PacketParse(
                    "Unterminated SDES chunk".to_string()
                ));
            }
            let item_type = data[offset];
            if item_type == 0 {
                // Null terminator; chunks are padded to the next 32-bit
                // boundary with further null octets.
                offset += 1;
                while offset % 4 != 0 && offset < data.len() {
                    offset += 1;
                }
                break;
            }
            if offset + 2 > data.len() {
                return Err(SessionError::PacketParse(
                    "Truncated SDES item".to_string()
                ));
            }
            let len = data[offset + 1] as usize;
            if offset + 2 + len > data.len() {
                return Err(SessionError::PacketParse(
                    "Truncated SDES item value".to_string()
                ));
            }
            let value = String::from_utf8_lossy(&data[offset + 2..offset + 2 + len]).into_owned();
            if let Some(known) = SdesItemType::from_u8(item_type) {
                items.push(SdesItem { item_type: known, value });
            }
            offset += 2 + len;
        }

        Ok((SdesChunk { ssrc, items }, offset))
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32(self.ssrc);
        for item in &self.items {
            let value = item.value.as_bytes();
            let len = value.len().min(255);
            buf.put_u8(item.item_type as u8);
            buf.put_u8(len as u8);
            buf.put_slice(&value[..len]);
        }
        buf.put_u8(0);
        pad_to_word(buf);
    }
}

/// RTCP Source Description (SDES) (RFC 3550 Section 6.5)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescription {
    /// SDES chunks
    pub chunks: Vec<SdesChunk>,
}

impl SourceDescription {
    fn parse_body(count: u8, body: &[u8]) -> SessionResult<Self> {
        let mut chunks = Vec::with_capacity(count as usize);
        let mut rest = body;
        for _ in 0..count {
            let (chunk, consumed) = SdesChunk::parse(rest)?;
            chunks.push(chunk);
            rest = &rest[consumed.min(rest.len())..];
        }
        Ok(SourceDescription { chunks })
    }

    fn write(&self, buf: &mut BytesMut) {
        let count = self.chunks.len().min(31) as u8;
        let start = put_header(buf, count, RtcpPacketType::SourceDescription);
        for chunk in self.chunks.iter().take(31) {
            chunk.write(buf);
        }
        patch_length(buf, start);
    }
}

/// RTCP Goodbye (BYE) (RFC 3550 Section 6.6)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Goodbye {
    /// SSRCs/CSRCs leaving
    pub ssrcs: Vec<u32>,
    /// Optional reason for leaving
    pub reason: Option<String>,
}

impl Goodbye {
    fn parse_body(count: u8, body: &[u8]) -> SessionResult<Self> {
        let ssrc_len = count as usize * 4;
        if body.len() < ssrc_len {
            return Err(SessionError::PacketParse(
                "BYE packet too short".to_string()
            ));
        }

        let mut ssrcs = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let at = i * 4;
            ssrcs.push(u32::from_be_bytes([body[at], body[at + 1], body[at + 2], body[at + 3]]));
        }

        let reason = if body.len() > ssrc_len {
            let len = body[ssrc_len] as usize;
            if ssrc_len + 1 + len > body.len() {
                return Err(SessionError::PacketParse(
                    "Truncated BYE reason".to_string()
                ));
            }
            Some(String::from_utf8_lossy(&body[ssrc_len + 1..ssrc_len + 1 + len]).into_owned())
        } else {
            None
        };

        Ok(Goodbye { ssrcs, reason })
    }

    fn write(&self, buf: &mut BytesMut) {
        let count = self.ssrcs.len().min(31) as u8;
        let start = put_header(buf, count, RtcpPacketType::Goodbye);
        for &ssrc in self.ssrcs.iter().take(31) {
            buf.put_u32(ssrc);
        }
        if let Some(ref reason) = self.reason {
            let text = reason.as_bytes();
            let len = text.len().min(255);
            buf.put_u8(len as u8);
            buf.put_slice(&text[..len]);
            pad_to_word(buf);
        }
        patch_length(buf, start);
    }
}

/// RTCP Application-Defined packet (APP) (RFC 3550 Section 6.7)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppData {
    /// Application subtype (5 bits)
    pub subtype: u8,
    /// SSRC of sender
    pub ssrc: u32,
    /// Four-character name identifying the application
    pub name: [u8; 4],
    /// Application-dependent data (multiple of 4 bytes on the wire)
    pub data: Bytes,
}

impl AppData {
    fn parse_body(subtype: u8, body: &[u8]) -> SessionResult<Self> {
        if body.len() < 8 {
            return Err(SessionError::PacketParse(
                "APP packet too short".to_string()
            ));
        }

        Ok(AppData {
            subtype,
            ssrc: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
            name: [body[4], body[5], body[6], body[7]],
            data: Bytes::copy_from_slice(&body[8..]),
        })
    }

    fn write(&self, buf: &mut BytesMut) {
        let start = put_header(buf, self.subtype, RtcpPacketType::ApplicationDefined);
        buf.put_u32(self.ssrc);
        buf.put_slice(&self.name);
        buf.put_slice(&self.data);
        pad_to_word(buf);
        patch_length(buf, start);
    }
}

/// A single RTCP packet, discriminated on the type field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPacket {
    /// Sender Report
    SenderReport(SenderReport),
    /// Receiver Report
    ReceiverReport(ReceiverReport),
    /// Source Description
    SourceDescription(SourceDescription),
    /// Goodbye
    Bye(Goodbye),
    /// Application-defined data
    AppData(AppData),
}

impl ControlPacket {
    /// The wire packet type of this packet
    pub fn packet_type(&self) -> RtcpPacketType {
        match self {
            ControlPacket::SenderReport(_) => RtcpPacketType::SenderReport,
            ControlPacket::ReceiverReport(_) => RtcpPacketType::ReceiverReport,
            ControlPacket::SourceDescription(_) => RtcpPacketType::SourceDescription,
            ControlPacket::Bye(_) => RtcpPacketType::Goodbye,
            ControlPacket::AppData(_) => RtcpPacketType::ApplicationDefined,
        }
    }

    /// Serialize this packet alone (including its header)
    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.write(&mut buf);
        buf
    }

    fn write(&self, buf: &mut BytesMut) {
        match self {
            ControlPacket::SenderReport(sr) => sr.write(buf),
            ControlPacket::ReceiverReport(rr) => rr.write(buf),
            ControlPacket::SourceDescription(sdes) => sdes.write(buf),
            ControlPacket::Bye(bye) => bye.write(buf),
            ControlPacket::AppData(app) => app.write(buf),
        }
    }

    // Parses the body of a packet whose header was already read. Returns
    // None for packet types the engine does not recognize.
    fn parse_body(header: &RtcpHeader, body: &[u8]) -> SessionResult<Option<Self>> {
        let Some(kind) = RtcpPacketType::from_u8(header.packet_type) else {
            return Ok(None);
        };

        let packet = match kind {
            RtcpPacketType::SenderReport => {
                ControlPacket::SenderReport(SenderReport::parse_body(header.count, body)?)
            }
            RtcpPacketType::ReceiverReport => {
                ControlPacket::ReceiverReport(ReceiverReport::parse_body(header.count, body)?)
            }
            RtcpPacketType::SourceDescription => {
                ControlPacket::SourceDescription(SourceDescription::parse_body(header.count, body)?)
            }
            RtcpPacketType::Goodbye => {
                ControlPacket::Bye(Goodbye::parse_body(header.count, body)?)
            }
            RtcpPacketType::ApplicationDefined => {
                ControlPacket::AppData(AppData::parse_body(header.count, body)?)
            }
        };
        Ok(Some(packet))
    }
}

/// Concatenation of control packets sharing a single datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompoundControlPacket {
    /// The packets, in datagram order
    pub packets: Vec<ControlPacket>,
}

impl CompoundControlPacket {
    /// Wrap a list of packets into a compound
    pub fn new(packets: Vec<ControlPacket>) -> Self {
        CompoundControlPacket { packets }
    }

    /// Parse a compound from a datagram.
    ///
    /// Packets of unrecognized types are stepped over using the header
    /// length field; a structurally broken packet fails the whole datagram.
    pub fn parse(data: &[u8]) -> SessionResult<Self> {
        if data.is_empty() {
            return Err(SessionError::PacketParse(
                "Empty RTCP datagram".to_string()
            ));
        }

        let mut packets = Vec::new();
        let mut rest = data;
        while rest.len() >= 4 {
            let header = RtcpHeader::parse(rest)?;
            let packet_len = (header.length as usize + 1) * 4;
            if packet_len > rest.len() {
                return Err(SessionError::PacketParse(
                    format!("Truncated RTCP packet: {} of {} bytes", rest.len(), packet_len)
                ));
            }
            if let Some(packet) = ControlPacket::parse_body(&header, &rest[4..packet_len])? {
                packets.push(packet);
            }
            rest = &rest[packet_len..];
        }

        if packets.is_empty() {
            return Err(SessionError::PacketParse(
                "No recognized packets in RTCP datagram".to_string()
            ));
        }
        Ok(CompoundControlPacket { packets })
    }

    /// Serialize all packets into one datagram
    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        for packet in &self.packets {
            packet.write(&mut buf);
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_sdes() -> SourceDescription {
        SourceDescription {
            chunks: vec![SdesChunk {
                ssrc: 0xCAFE,
                items: vec![
                    SdesItem::new(SdesItemType::Cname, "alice@example.com"),
                    SdesItem::new(SdesItemType::Tool, "efflux/0.1.0"),
                ],
            }],
        }
    }

    #[test]
    fn test_header_parse() {
        let data = [
            0x81, 0xC8, // V=2, P=0, RC=1, PT=200 (SR)
            0x00, 0x06, // Length = 6 words
        ];

        let header = RtcpHeader::parse(&data).unwrap();
        assert_eq!(header.padding, false);
        assert_eq!(header.count, 1);
        assert_eq!(header.packet_type, 200);
        assert_eq!(header.length, 6);
    }

    #[test]
    fn test_sender_report_round_trip() {
        let report = SenderReport {
            ssrc: 12345,
            ntp_timestamp_msw: 0,
            ntp_timestamp_lsw: 0,
            rtp_timestamp: 1000,
            sender_packet_count: 100,
            sender_octet_count: 10000,
            reception_reports: vec![ReceptionReport::zeroed(777)],
        };

        let packet = ControlPacket::SenderReport(report.clone());
        let parsed = CompoundControlPacket::parse(&packet.serialize()).unwrap();
        assert_eq!(parsed.packets, vec![ControlPacket::SenderReport(report)]);
    }

    #[test]
    fn test_negative_cumulative_loss_round_trip() {
        let mut block = ReceptionReport::zeroed(1);
        block.cumulative_packets_lost = -5;

        let report = ReceiverReport {
            ssrc: 2,
            reception_reports: vec![block],
        };
        let parsed = CompoundControlPacket::parse(
            &ControlPacket::ReceiverReport(report.clone()).serialize()
        ).unwrap();
        assert_eq!(parsed.packets, vec![ControlPacket::ReceiverReport(report)]);
    }

    #[test]
    fn test_sdes_round_trip() {
        let sdes = create_test_sdes();
        let parsed = CompoundControlPacket::parse(
            &ControlPacket::SourceDescription(sdes.clone()).serialize()
        ).unwrap();
        assert_eq!(parsed.packets, vec![ControlPacket::SourceDescription(sdes)]);
    }

    #[test]
    fn test_bye_round_trip() {
        let bye = Goodbye {
            ssrcs: vec![0xA1, 0xB2],
            reason: Some("Session terminated".to_string()),
        };
        let parsed = CompoundControlPacket::parse(
            &ControlPacket::Bye(bye.clone()).serialize()
        ).unwrap();
        assert_eq!(parsed.packets, vec![ControlPacket::Bye(bye)]);
    }

    #[test]
    fn test_bye_without_reason() {
        let bye = Goodbye { ssrcs: vec![7], reason: None };
        let parsed = CompoundControlPacket::parse(
            &ControlPacket::Bye(bye.clone()).serialize()
        ).unwrap();
        assert_eq!(parsed.packets, vec![ControlPacket::Bye(bye)]);
    }

    #[test]
    fn test_app_round_trip() {
        let app = AppData {
            subtype: 3,
            ssrc: 99,
            name: *b"test",
            data: Bytes::from_static(&[1, 2, 3, 4]),
        };
        let parsed = CompoundControlPacket::parse(
            &ControlPacket::AppData(app.clone()).serialize()
        ).unwrap();
        assert_eq!(parsed.packets, vec![ControlPacket::AppData(app)]);
    }

    #[test]
    fn test_compound_round_trip() {
        let compound = CompoundControlPacket::new(vec![
            ControlPacket::ReceiverReport(ReceiverReport {
                ssrc: 1,
                reception_reports: vec![],
            }),
            ControlPacket::SourceDescription(create_test_sdes()),
            ControlPacket::Bye(Goodbye { ssrcs: vec![1], reason: None }),
        ]);

        let parsed = CompoundControlPacket::parse(&compound.serialize()).unwrap();
        assert_eq!(parsed, compound);
    }

    #[test]
    fn test_unknown_packet_type_is_skipped() {
        let mut data = ControlPacket::ReceiverReport(ReceiverReport {
            ssrc: 1,
            reception_reports: vec![],
        }).serialize().to_vec();

        // Append a 4-byte packet with an unassigned type octet
        data.extend_from_slice(&[0x80, 210, 0x00, 0x00]);

        let parsed = CompoundControlPacket::parse(&data).unwrap();
        assert_eq!(parsed.packets.len(), 1);
    }

    #[test]
    fn test_truncated_compound_fails() {
        let mut data = ControlPacket::ReceiverReport(ReceiverReport {
            ssrc: 1,
            reception_reports: vec![],
        }).serialize().to_vec();
        data[3] = 0x09; // Claim a longer packet than the datagram holds

        assert!(CompoundControlPacket::parse(&data).is_err());
    }

    #[test]
    fn test_sdes_chunk_item_lookup() {
        let sdes = create_test_sdes();
        assert_eq!(sdes.chunks[0].item(SdesItemType::Cname), Some("alice@example.com"));
        assert_eq!(sdes.chunks[0].item(SdesItemType::Email), None);
    }
}
