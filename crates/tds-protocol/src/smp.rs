//! SMP (Session Multiplex Protocol) sub-header used by MARS.
//!
//! When Multiple Active Result Sets is negotiated, every unit on the wire is
//! an SMP frame: a 16-byte header optionally followed by one complete TDS
//! packet (DATA frames only).
//!
//! ```text
//! offset  size  field      byte order
//! 0       1     signature  (0x53)
//! 1       1     type       SYN=1 ACK=2 FIN=4 DATA=8
//! 2       2     sid        little-endian
//! 4       4     size       little-endian, includes this header
//! 8       4     seq        little-endian
//! 12      4     wnd        little-endian
//! ```

use bytes::{Buf, BufMut};

use crate::error::ProtocolError;
use crate::packet::{MAX_PACKET_SIZE, PACKET_HEADER_SIZE};

/// First byte of every SMP frame.
pub const SMP_SIGNATURE: u8 = 0x53;

/// SMP header size in bytes.
pub const SMP_HEADER_SIZE: usize = 16;

/// Smallest legal DATA frame: SMP header plus an empty TDS packet.
pub const SMP_MIN_DATA_SIZE: u32 = (SMP_HEADER_SIZE + PACKET_HEADER_SIZE) as u32;

/// Largest legal DATA frame: SMP header plus a maximum-size TDS packet.
pub const SMP_MAX_DATA_SIZE: u32 = (MAX_PACKET_SIZE + SMP_HEADER_SIZE) as u32;

/// SMP frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SmpType {
    /// Open a virtual session.
    Syn = 0x01,
    /// Window update, no payload.
    Ack = 0x02,
    /// Close a virtual session.
    Fin = 0x04,
    /// Carries one TDS packet.
    Data = 0x08,
}

impl SmpType {
    /// Create a frame type from a raw byte value.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(Self::Syn),
            0x02 => Ok(Self::Ack),
            0x04 => Ok(Self::Fin),
            0x08 => Ok(Self::Data),
            _ => Err(ProtocolError::InvalidSmpType(value)),
        }
    }
}

/// SMP frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmpHeader {
    /// Frame type.
    pub smp_type: SmpType,
    /// Session identifier.
    pub sid: u16,
    /// Total frame length including this header.
    pub size: u32,
    /// Sequence number of the last DATA frame sent by the originator.
    pub seq: u32,
    /// Highest sequence number the originator is willing to receive.
    pub wnd: u32,
}

impl SmpHeader {
    /// Create a new SMP header.
    #[must_use]
    pub const fn new(smp_type: SmpType, sid: u16, size: u32, seq: u32, wnd: u32) -> Self {
        Self {
            smp_type,
            sid,
            size,
            seq,
            wnd,
        }
    }

    /// Create a payload-less control frame header (SYN, ACK or FIN).
    #[must_use]
    pub const fn control(smp_type: SmpType, sid: u16, seq: u32, wnd: u32) -> Self {
        Self::new(smp_type, sid, SMP_HEADER_SIZE as u32, seq, wnd)
    }

    /// Parse an SMP header from bytes.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < SMP_HEADER_SIZE {
            return Err(ProtocolError::IncompletePacket {
                expected: SMP_HEADER_SIZE,
                actual: src.remaining(),
            });
        }

        let signature = src.get_u8();
        if signature != SMP_SIGNATURE {
            return Err(ProtocolError::InvalidSmpSignature(signature));
        }
        let smp_type = SmpType::from_u8(src.get_u8())?;
        let sid = src.get_u16_le();
        let size = src.get_u32_le();
        let seq = src.get_u32_le();
        let wnd = src.get_u32_le();

        Ok(Self {
            smp_type,
            sid,
            size,
            seq,
            wnd,
        })
    }

    /// Encode the SMP header to bytes.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(SMP_SIGNATURE);
        dst.put_u8(self.smp_type as u8);
        dst.put_u16_le(self.sid);
        dst.put_u32_le(self.size);
        dst.put_u32_le(self.seq);
        dst.put_u32_le(self.wnd);
    }

    /// Encode the SMP header in place over the first 16 bytes of a frame.
    pub fn encode_into(&self, dst: &mut [u8; SMP_HEADER_SIZE]) {
        let mut cursor = &mut dst[..];
        self.encode(&mut cursor);
    }

    /// Length of the enclosed TDS packet (zero for control frames).
    #[must_use]
    pub const fn payload_length(&self) -> usize {
        (self.size as usize).saturating_sub(SMP_HEADER_SIZE)
    }

    /// Whether `size` is acceptable for this frame type.
    ///
    /// Control frames carry no payload; DATA frames must hold at least a TDS
    /// header and at most a maximum-size TDS packet.
    #[must_use]
    pub const fn has_valid_size(&self) -> bool {
        match self.smp_type {
            SmpType::Data => self.size >= SMP_MIN_DATA_SIZE && self.size <= SMP_MAX_DATA_SIZE,
            SmpType::Syn | SmpType::Ack | SmpType::Fin => self.size == SMP_HEADER_SIZE as u32,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_smp_wire_layout() {
        let header = SmpHeader::new(SmpType::Data, 0x0102, 0x18, 7, 11);
        let mut raw = [0u8; SMP_HEADER_SIZE];
        header.encode_into(&mut raw);
        assert_eq!(
            raw,
            [
                0x53, 0x08, 0x02, 0x01, 0x18, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00, 0x0B,
                0x00, 0x00, 0x00
            ]
        );
        assert_eq!(header.payload_length(), PACKET_HEADER_SIZE);
    }

    #[test]
    fn test_decode_rejects_bad_signature_and_type() {
        let mut raw = [0u8; SMP_HEADER_SIZE];
        SmpHeader::control(SmpType::Ack, 1, 0, 4).encode_into(&mut raw);

        let mut bad_sig = raw;
        bad_sig[0] = 0x04;
        assert_eq!(
            SmpHeader::decode(&mut &bad_sig[..]),
            Err(ProtocolError::InvalidSmpSignature(0x04))
        );

        let mut bad_type = raw;
        bad_type[1] = 0x03;
        assert_eq!(
            SmpHeader::decode(&mut &bad_type[..]),
            Err(ProtocolError::InvalidSmpType(0x03))
        );

        assert!(matches!(
            SmpHeader::decode(&mut &raw[..12]),
            Err(ProtocolError::IncompletePacket { expected: 16, actual: 12 })
        ));
    }

    #[test]
    fn test_size_bounds() {
        assert!(SmpHeader::control(SmpType::Fin, 0, 0, 4).has_valid_size());
        assert!(!SmpHeader::new(SmpType::Ack, 0, 20, 0, 4).has_valid_size());
        assert!(!SmpHeader::new(SmpType::Data, 0, 0x17, 1, 4).has_valid_size());
        assert!(SmpHeader::new(SmpType::Data, 0, 0x18, 1, 4).has_valid_size());
        assert!(SmpHeader::new(SmpType::Data, 0, 0xFFFF + 16, 1, 4).has_valid_size());
        assert!(!SmpHeader::new(SmpType::Data, 0, 0xFFFF + 17, 1, 4).has_valid_size());
    }

    proptest! {
        #[test]
        fn smp_decode_inverts_encode(sid: u16, size: u32, seq: u32, wnd: u32, kind in 0usize..4) {
            let smp_type = [SmpType::Syn, SmpType::Ack, SmpType::Fin, SmpType::Data][kind];
            let header = SmpHeader::new(smp_type, sid, size, seq, wnd);
            let mut raw = [0u8; SMP_HEADER_SIZE];
            header.encode_into(&mut raw);
            prop_assert_eq!(SmpHeader::decode(&mut &raw[..]).unwrap(), header);
        }
    }
}
