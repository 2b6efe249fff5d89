//! Packet buffers.
//!
//! A [`Packet`] owns one fixed-capacity byte buffer holding a single wire
//! unit. In MARS mode the first 16 bytes are reserved for the SMP header and
//! the TDS packet starts at `data_start`; control frames are a bare SMP
//! header with no TDS data at all.

use bytes::Bytes;
use tds_protocol::{PACKET_HEADER_SIZE, PacketHeader, PacketType};

use crate::error::{Result, TransportError};

/// One wire unit: optional SMP header followed by an optional TDS packet.
#[derive(Debug)]
pub struct Packet {
    /// Always fully initialised; `buf.len()` is the capacity.
    buf: Vec<u8>,
    data_start: usize,
    data_len: usize,
    sid: u16,
}

impl Packet {
    /// Allocate a zeroed buffer of exactly `capacity` bytes.
    pub(crate) fn allocate(capacity: usize) -> Result<Self> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(capacity)
            .map_err(|_| TransportError::OutOfMemory {
                requested: capacity,
            })?;
        buf.resize(capacity, 0);
        Ok(Self {
            buf,
            data_start: 0,
            data_len: 0,
            sid: 0,
        })
    }

    /// Total bytes this buffer can hold.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Offset of the TDS header within the buffer.
    #[must_use]
    pub fn data_start(&self) -> usize {
        self.data_start
    }

    /// Length of the TDS packet, header included.
    #[must_use]
    pub fn data_len(&self) -> usize {
        self.data_len
    }

    /// Session this packet belongs to.
    #[must_use]
    pub fn sid(&self) -> u16 {
        self.sid
    }

    /// The TDS packet, header included.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.buf[self.data_start..self.data_start + self.data_len]
    }

    /// Everything that goes on the wire, SMP header included.
    #[must_use]
    pub fn wire(&self) -> &[u8] {
        &self.buf[..self.data_start + self.data_len]
    }

    pub(crate) fn raw(&self) -> &[u8] {
        &self.buf
    }

    pub(crate) fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Position the TDS packet at `data_start` with `data_len` bytes.
    ///
    /// Values are clamped to the capacity.
    pub(crate) fn set_layout(&mut self, data_start: usize, data_len: usize) {
        self.data_start = data_start.min(self.buf.len());
        self.data_len = data_len.min(self.buf.len() - self.data_start);
    }

    pub(crate) fn set_data_len(&mut self, data_len: usize) {
        self.set_layout(self.data_start, data_len);
    }

    pub(crate) fn set_sid(&mut self, sid: u16) {
        self.sid = sid;
    }

    /// Grow to `capacity` bytes, keeping existing contents.
    pub(crate) fn grow(&mut self, capacity: usize) -> Result<()> {
        if capacity <= self.buf.len() {
            return Ok(());
        }
        self.buf
            .try_reserve_exact(capacity - self.buf.len())
            .map_err(|_| TransportError::OutOfMemory {
                requested: capacity,
            })?;
        self.buf.resize(capacity, 0);
        Ok(())
    }

    /// Forget the layout before the buffer is reused.
    pub(crate) fn reset(&mut self) {
        self.data_start = 0;
        self.data_len = 0;
        self.sid = 0;
    }
}

/// A received TDS packet handed to the session that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketView {
    /// Decoded physical header.
    pub header: PacketHeader,
    /// Payload following the 8-byte header.
    pub payload: Bytes,
}

impl PacketView {
    pub(crate) fn from_packet(packet: &Packet) -> Result<Self> {
        let data = packet.data();
        let header = PacketHeader::decode(&mut &data[..])?;
        let payload = Bytes::copy_from_slice(data.get(PACKET_HEADER_SIZE..).unwrap_or_default());
        Ok(Self { header, payload })
    }

    /// Packet type from the header.
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        self.header.packet_type
    }

    /// Whether this packet ends its message.
    #[must_use]
    pub fn is_end_of_message(&self) -> bool {
        self.header.is_end_of_message()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tds_protocol::PacketStatus;

    #[test]
    fn test_allocate_is_zeroed() {
        let packet = Packet::allocate(64).unwrap();
        assert_eq!(packet.capacity(), 64);
        assert!(packet.raw().iter().all(|&b| b == 0));
        assert!(packet.wire().is_empty());
    }

    #[test]
    fn test_layout_and_grow() {
        let mut packet = Packet::allocate(32).unwrap();
        packet.raw_mut()[16..24].copy_from_slice(&[4, 1, 0, 8, 0, 0, 1, 0]);
        packet.set_layout(16, 8);
        assert_eq!(packet.wire().len(), 24);
        assert_eq!(packet.data(), &[4, 1, 0, 8, 0, 0, 1, 0]);

        packet.grow(128).unwrap();
        assert_eq!(packet.capacity(), 128);
        assert_eq!(packet.data(), &[4, 1, 0, 8, 0, 0, 1, 0]);

        packet.set_layout(120, 64);
        assert_eq!(packet.data_len(), 8);
    }

    #[test]
    fn test_view_splits_header() {
        let mut packet = Packet::allocate(16).unwrap();
        let header = PacketHeader::new(PacketType::TabularResult, PacketStatus::END_OF_MESSAGE, 11);
        let mut raw = [0u8; PACKET_HEADER_SIZE];
        header.encode_into(&mut raw);
        packet.raw_mut()[..8].copy_from_slice(&raw);
        packet.raw_mut()[8..11].copy_from_slice(b"abc");
        packet.set_layout(0, 11);

        let view = PacketView::from_packet(&packet).unwrap();
        assert_eq!(view.packet_type(), PacketType::TabularResult);
        assert!(view.is_end_of_message());
        assert_eq!(&view.payload[..], b"abc");
    }
}
