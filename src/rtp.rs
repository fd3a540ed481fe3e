//! RTP data packet handling
//!
//! Implements RFC 3550 RTP packet parsing and construction.
//! These are the typed values the session engine sends and receives.
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

/// Opaque RTP header extension block.
///
/// Carried through unmodified; the engine never interprets its contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpExtension {
    /// Extension profile identifier
    pub profile: u16,
    /// Extension data (multiple of 4 bytes on the wire)
    pub data: Bytes,
}

/// RTP data packet as defined in RFC 3550
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    /// Marker bit
    pub marker: bool,
    /// Payload type (7 bits)
    pub payload_type: u8,
    /// Sequence number (16 bits)
    pub sequence_number: u16,
    /// Timestamp (32 bits)
    pub timestamp: u32,
    /// SSRC (Synchronization Source) identifier (32 bits)
    pub ssrc: u32,
    /// CSRC (Contributing Source) identifiers
    pub csrc: Vec<u32>,
    /// Header extension (optional, opaque)
    pub extension: Option<RtpExtension>,
    /// Payload data
    pub payload: Bytes,
}

impl DataPacket {
    /// Minimum RTP header size (12 bytes)
    pub const MIN_SIZE: usize = 12;

    /// Create a packet carrying `payload`; the session engine fills in
    /// payload type, sequence number and SSRC before sending.
    pub fn new(payload: Bytes, timestamp: u32, marker: bool) -> Self {
        DataPacket {
            marker,
            payload_type: 0,
            sequence_number: 0,
            timestamp,
            ssrc: 0,
            csrc: Vec::new(),
            extension: None,
            payload,
        }
    }

    /// Parse an RTP data packet from bytes
    pub fn parse(data: &[u8]) -> SessionResult<Self> {
        if data.len() < Self::MIN_SIZE {
            return Err(SessionError::PacketParse(
                format!("RTP packet too short: {} bytes", data.len())
            ));
        }

        // First byte: V(2) P(1) X(1) CC(4)
        let first_byte = data[0];
        let version = (first_byte >> 6) & 0x03;
        if version != 2 {
            return Err(SessionError::PacketParse(
                format!("Invalid RTP version: {}", version)
            ));
        }
        let padding = (first_byte & 0x20) != 0;
        let has_extension = (first_byte & 0x10) != 0;
        let csrc_count = first_byte & 0x0F;

        // Second byte: M(1) PT(7)
        let second_byte = data[1];
        let marker = (second_byte & 0x80) != 0;
        let payload_type = second_byte & 0x7F;

        let sequence_number = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut rest = &data[Self::MIN_SIZE..];

        // CSRC list (4 bytes each)
        let mut csrc = Vec::with_capacity(csrc_count as usize);
        for _ in 0..csrc_count {
            if rest.len() < 4 {
                return Err(SessionError::PacketParse(
                    "Incomplete CSRC list".to_string()
                ));
            }
            csrc.push(u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]));
            rest = &rest[4..];
        }

        // Header extension: skipped over but kept opaque
        let extension = if has_extension {
            if rest.len() < 4 {
                return Err(SessionError::PacketParse(
                    "Incomplete extension header".to_string()
                ));
            }
            let profile = u16::from_be_bytes([rest[0], rest[1]]);
            let length = u16::from_be_bytes([rest[2], rest[3]]) as usize;
            let ext_data_len = length * 4; // Length is in 32-bit words

            if rest.len() < 4 + ext_data_len {
                return Err(SessionError::PacketParse(
                    "Incomplete extension data".to_string()
                ));
            }

            let ext_data = Bytes::copy_from_slice(&rest[4..4 + ext_data_len]);
            rest = &rest[4 + ext_data_len..];

            Some(RtpExtension {
                profile,
                data: ext_data,
            })
        } else {
            None
        };

        // Strip padding if present
        let payload = if padding {
            if rest.is_empty() {
                return Err(SessionError::PacketParse(
                    "Packet has padding flag but no payload".to_string()
                ));
            }
            let padding_len = rest[rest.len() - 1] as usize;
            if padding_len > rest.len() {
                return Err(SessionError::PacketParse(
                    format!("Invalid padding length: {}", padding_len)
                ));
            }
            Bytes::copy_from_slice(&rest[..rest.len() - padding_len])
        } else {
            Bytes::copy_from_slice(rest)
        };

        Ok(DataPacket {
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            extension,
            payload,
        })
    }

    /// Serialize the packet to bytes
    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.size());

        // First byte: V(2) P(1) X(1) CC(4)
        let mut first_byte = 2u8 << 6;
        if self.extension.is_some() {
            first_byte |= 0x10;
        }
        first_byte |= (self.csrc.len() as u8) & 0x0F;
        buf.put_u8(first_byte);

        // Second byte: M(1) PT(7)
        let mut second_byte = self.payload_type & 0x7F;
        if self.marker {
            second_byte |= 0x80;
        }
        buf.put_u8(second_byte);

        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);

        for &csrc_id in &self.csrc {
            buf.put_u32(csrc_id);
        }

        if let Some(ref ext) = self.extension {
            buf.put_u16(ext.profile);
            let length = (ext.data.len() + 3) / 4; // Round up to 32-bit words
            buf.put_u16(length as u16);
            buf.put_slice(&ext.data);
            // Pad to 32-bit boundary if needed
            let padding = (4 - (ext.data.len() % 4)) % 4;
            for _ in 0..padding {
                buf.put_u8(0);
            }
        }

        buf.put_slice(&self.payload);
        buf
    }

    /// Calculate the serialized size in bytes
    pub fn size(&self) -> usize {
        let mut size = Self::MIN_SIZE;
        size += self.csrc.len() * 4;
        if let Some(ref ext) = self.extension {
            size += 4;
            size += ext.data.len();
            size += (4 - (ext.data.len() % 4)) % 4;
        }
        size + self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_packet() -> DataPacket {
        DataPacket {
            marker: false,
            payload_type: 96,
            sequence_number: 1,
            timestamp: 1000,
            ssrc: 0xCAFE,
            csrc: vec![],
            extension: None,
            payload: Bytes::from("test payload"),
        }
    }

    #[test]
    fn test_parse_minimal() {
        let data = [
            0x80, 0x60, // V=2, P=0, X=0, CC=0, M=0, PT=96
            0x00, 0x01, // Sequence number = 1
            0x00, 0x00, 0x00, 0x01, // Timestamp = 1
            0x00, 0x00, 0x00, 0x01, // SSRC = 1
        ];

        let packet = DataPacket::parse(&data).unwrap();
        assert_eq!(packet.payload_type, 96);
        assert_eq!(packet.marker, false);
        assert_eq!(packet.sequence_number, 1);
        assert_eq!(packet.timestamp, 1);
        assert_eq!(packet.ssrc, 1);
        assert!(packet.csrc.is_empty());
        assert!(packet.extension.is_none());
        assert!(packet.payload.is_empty());
    }

    #[test]
    fn test_rejects_wrong_version() {
        let data = [
            0x40, 0x60, // V=1
            0x00, 0x01,
            0x00, 0x00, 0x00, 0x01,
            0x00, 0x00, 0x00, 0x01,
        ];
        assert!(DataPacket::parse(&data).is_err());
    }

    #[test]
    fn test_serialize_parse_round_trip() {
        let packet = create_test_packet();
        let serialized = packet.serialize();
        let parsed = DataPacket::parse(&serialized).unwrap();
        assert_eq!(packet, parsed);
    }

    #[test]
    fn test_extension_is_carried_opaquely() {
        let mut packet = create_test_packet();
        packet.extension = Some(RtpExtension {
            profile: 0xBEDE,
            data: Bytes::from_static(&[1, 2, 3, 4]),
        });

        let parsed = DataPacket::parse(&packet.serialize()).unwrap();
        assert_eq!(parsed.extension, packet.extension);
        assert_eq!(parsed.payload, packet.payload);
    }

    #[test]
    fn test_csrc_list() {
        let mut packet = create_test_packet();
        packet.csrc = vec![10, 20, 30];

        let parsed = DataPacket::parse(&packet.serialize()).unwrap();
        assert_eq!(parsed.csrc, vec![10, 20, 30]);
    }

    #[test]
    fn test_padding_is_stripped() {
        let mut data = create_test_packet().serialize().to_vec();
        data[0] |= 0x20; // Set padding flag
        data.extend_from_slice(&[0, 0, 3]); // 3 octets of padding

        let parsed = DataPacket::parse(&data).unwrap();
        assert_eq!(parsed.payload, Bytes::from("test payload"));
    }

    #[test]
    fn test_truncated_packet() {
        let data = [0x80, 0x60, 0x00];
        assert!(DataPacket::parse(&data).is_err());
    }
}
