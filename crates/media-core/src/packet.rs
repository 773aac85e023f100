//! RTP packet codec
//!
//! An [`RtpPacket`] keeps the datagram exactly as it came off the wire; header
//! fields are read and written in network byte order by the accessors, so a
//! parsed packet serializes back to the identical bytes.
//!
//! The header size is `12 + 4 * CC`. Header extensions are not interpreted and
//! travel as the leading part of the payload.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{MediaError, Result};

/// Fixed part of the RTP header
pub const RTP_HEADER_SIZE: usize = 12;
/// Largest datagram the relay will handle
pub const RTP_PACKET_BUFFER_SIZE: usize = 8192;
/// RTP protocol version accepted as well formed
pub const RTP_VERSION: u8 = 2;

/// Returns true if the buffer looks like clear RTP (version 2).
///
/// The relay uses this to tell obfuscated streams from plain ones.
pub fn validate_buffer(buf: &[u8]) -> bool {
    buf.first().map(|b| b >> 6 == RTP_VERSION).unwrap_or(false)
}

/// Header size implied by a CSRC count
pub fn header_size(csrc_count: u8) -> usize {
    RTP_HEADER_SIZE + 4 * (csrc_count as usize & 0x0f)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    data: BytesMut,
}

impl RtpPacket {
    /// Parse a datagram.
    ///
    /// Fails when the buffer is shorter than the header its CSRC count
    /// announces, longer than [`RTP_PACKET_BUFFER_SIZE`], or not version 2.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < RTP_HEADER_SIZE {
            return Err(MediaError::protocol(format!(
                "RTP packet too short: {} bytes",
                buf.len()
            )));
        }
        if buf.len() > RTP_PACKET_BUFFER_SIZE {
            return Err(MediaError::protocol(format!(
                "RTP packet too large: {} bytes",
                buf.len()
            )));
        }
        let needed = header_size(buf[0] & 0x0f);
        if buf.len() < needed {
            return Err(MediaError::protocol(format!(
                "RTP packet of {} bytes shorter than its {} byte header",
                buf.len(),
                needed
            )));
        }
        if !validate_buffer(buf) {
            return Err(MediaError::protocol(format!(
                "unsupported RTP version {}",
                buf[0] >> 6
            )));
        }
        Ok(Self {
            data: BytesMut::from(buf),
        })
    }

    /// Build a packet with no CSRCs
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32, payload: &[u8]) -> Self {
        let mut data = BytesMut::with_capacity(RTP_HEADER_SIZE + payload.len());
        data.put_u8(RTP_VERSION << 6);
        data.put_u8(payload_type & 0x7f);
        data.put_u16(sequence);
        data.put_u32(timestamp);
        data.put_u32(ssrc);
        data.put_slice(payload);
        Self { data }
    }

    /// The packet as it goes on the wire
    pub fn serialize(&self) -> Bytes {
        self.data.clone().freeze()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn version(&self) -> u8 {
        self.data[0] >> 6
    }

    pub fn padding(&self) -> bool {
        self.data[0] & 0x20 != 0
    }

    pub fn extension(&self) -> bool {
        self.data[0] & 0x10 != 0
    }

    pub fn csrc_count(&self) -> u8 {
        self.data[0] & 0x0f
    }

    pub fn marker(&self) -> bool {
        self.data[1] & 0x80 != 0
    }

    pub fn set_marker(&mut self, marker: bool) {
        if marker {
            self.data[1] |= 0x80;
        } else {
            self.data[1] &= 0x7f;
        }
    }

    pub fn payload_type(&self) -> u8 {
        self.data[1] & 0x7f
    }

    pub fn sequence_number(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    pub fn set_sequence_number(&mut self, seq: u16) {
        self.data[2..4].copy_from_slice(&seq.to_be_bytes());
    }

    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]])
    }

    pub fn set_timestamp(&mut self, ts: u32) {
        self.data[4..8].copy_from_slice(&ts.to_be_bytes());
    }

    pub fn ssrc(&self) -> u32 {
        u32::from_be_bytes([self.data[8], self.data[9], self.data[10], self.data[11]])
    }

    pub fn csrcs(&self) -> Vec<u32> {
        (0..self.csrc_count() as usize)
            .map(|i| {
                let at = RTP_HEADER_SIZE + i * 4;
                u32::from_be_bytes([
                    self.data[at],
                    self.data[at + 1],
                    self.data[at + 2],
                    self.data[at + 3],
                ])
            })
            .collect()
    }

    pub fn header_size(&self) -> usize {
        header_size(self.csrc_count())
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[self.header_size()..]
    }

    pub fn payload_size(&self) -> usize {
        self.data.len() - self.header_size()
    }

    pub fn packet_size(&self) -> usize {
        self.data.len()
    }

    /// Replace the payload, keeping the header intact
    pub fn set_payload(&mut self, payload: &[u8]) {
        let header = self.header_size();
        self.data.truncate(header);
        self.data.extend_from_slice(payload);
    }
}
