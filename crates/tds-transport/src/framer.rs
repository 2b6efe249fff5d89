//! Incremental packet framing.
//!
//! The network owner reads in three steps so the connection lock is never
//! held across a blocking read:
//!
//! 1. [`PacketReader::prepare()`] (locked) makes sure the buffer can hold
//!    the next target length, borrowing from the pool.
//! 2. [`PacketReader::fill()`] (unlocked) reads at most up to that target.
//! 3. [`PacketReader::advance()`] (locked) accounts for the bytes and
//!    parses whatever headers became complete.
//!
//! The target starts at the 8-byte TDS header. In MARS mode a leading SMP
//! signature bumps it to the 16-byte SMP header, and a DATA frame bumps it
//! again to the full frame size.

use std::io;

use tds_protocol::{
    PACKET_HEADER_SIZE, PacketHeader, SMP_HEADER_SIZE, SMP_SIGNATURE, SmpHeader,
    SmpType,
};

use crate::error::{Result, TransportError};
use crate::packet::Packet;
use crate::pool::PacketPool;
use crate::transport::Transport;

/// A complete unit read off the wire.
#[derive(Debug)]
pub(crate) enum Frame {
    /// A bare TDS packet (plain mode, or a non-SMP packet under MARS).
    Packet(Packet),
    /// SMP DATA frame carrying one TDS packet at offset 16.
    Data {
        header: SmpHeader,
        packet: Packet,
    },
    /// SMP SYN, ACK or FIN.
    Control(SmpHeader),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Header,
    SmpHeader,
    Body(Option<SmpHeader>),
}

/// Partially received frame, kept by the connection between owners.
#[derive(Debug)]
pub(crate) struct PacketReader {
    packet: Option<Packet>,
    pos: usize,
    target: usize,
    stage: Stage,
    mars: bool,
    initial_capacity: usize,
}

impl PacketReader {
    pub(crate) fn new(mars: bool, initial_capacity: usize) -> Self {
        Self {
            packet: None,
            pos: 0,
            target: PACKET_HEADER_SIZE,
            stage: Stage::Header,
            mars,
            initial_capacity,
        }
    }

    /// Whether some bytes of a frame have already been consumed.
    pub(crate) fn in_progress(&self) -> bool {
        self.pos > 0
    }

    /// Ensure the buffer can hold the current target.
    pub(crate) fn prepare(&mut self, pool: &mut PacketPool) -> Result<()> {
        match &mut self.packet {
            None => {
                self.packet = Some(pool.acquire(self.target.max(self.initial_capacity))?);
            }
            Some(packet) if packet.capacity() < self.target => {
                pool.grow(packet, self.target)?;
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Read from the transport towards the current target.
    pub(crate) fn fill<T: Transport + ?Sized>(&mut self, transport: &T) -> io::Result<usize> {
        let packet = self
            .packet
            .as_mut()
            .ok_or_else(|| io::Error::other("receive buffer not prepared"))?;
        let dst = packet
            .raw_mut()
            .get_mut(self.pos..self.target)
            .ok_or_else(|| io::Error::other("receive buffer too small"))?;
        transport.read(dst)
    }

    /// Account for `n` freshly read bytes. Returns a frame once complete.
    pub(crate) fn advance(&mut self, n: usize) -> Result<Option<Frame>> {
        self.pos += n;
        while self.pos >= self.target {
            let Some(packet) = self.packet.as_ref() else {
                return Ok(None);
            };
            let buf = packet.raw();

            match self.stage {
                Stage::Header => {
                    if self.mars && buf[0] == SMP_SIGNATURE {
                        self.stage = Stage::SmpHeader;
                        self.target = SMP_HEADER_SIZE;
                        continue;
                    }
                    let length = tds_length(buf, 0)?;
                    self.stage = Stage::Body(None);
                    self.target = length;
                }
                Stage::SmpHeader => {
                    let header = SmpHeader::decode(&mut &buf[..SMP_HEADER_SIZE])
                        .map_err(|e| TransportError::violation(format!("bad SMP header: {e}")))?;
                    if !header.has_valid_size() {
                        return Err(TransportError::violation(format!(
                            "SMP {:?} frame for session {} has invalid size {}",
                            header.smp_type, header.sid, header.size
                        )));
                    }
                    if header.smp_type != SmpType::Data {
                        self.restart();
                        return Ok(Some(Frame::Control(header)));
                    }
                    self.stage = Stage::Body(Some(header));
                    self.target = header.size as usize;
                }
                Stage::Body(smp) => return self.finish(smp).map(Some),
            }
        }
        Ok(None)
    }

    fn finish(&mut self, smp: Option<SmpHeader>) -> Result<Frame> {
        let target = self.target;
        let mut packet = self
            .packet
            .take()
            .ok_or(TransportError::Usage("no packet being received"))?;
        self.restart();

        let frame = match smp {
            None => {
                validate_header(&packet, 0, target)?;
                packet.set_layout(0, target);
                Frame::Packet(packet)
            }
            Some(header) => {
                let inner = packet.raw();
                if inner[SMP_HEADER_SIZE] == SMP_SIGNATURE {
                    return Err(TransportError::violation(format!(
                        "nested SMP frame on session {}",
                        header.sid
                    )));
                }
                let length = tds_length(inner, SMP_HEADER_SIZE)?;
                if length != header.payload_length() {
                    return Err(TransportError::violation(format!(
                        "SMP size {} disagrees with TDS length {length}",
                        header.size
                    )));
                }
                validate_header(&packet, SMP_HEADER_SIZE, length)?;
                packet.set_layout(SMP_HEADER_SIZE, length);
                packet.set_sid(header.sid);
                Frame::Data { header, packet }
            }
        };

        let sid = match &frame {
            Frame::Data { header, .. } => header.sid,
            _ => 0,
        };
        tracing::trace!(sid, length = target, "received packet");
        Ok(frame)
    }

    fn restart(&mut self) {
        self.pos = 0;
        self.target = PACKET_HEADER_SIZE;
        self.stage = Stage::Header;
    }
}

/// Declared length of the TDS header starting at `at`.
fn tds_length(buf: &[u8], at: usize) -> Result<usize> {
    let length = usize::from(
        PacketHeader::peek_length(buf.get(at..).unwrap_or_default()).unwrap_or_default(),
    );
    if length < PACKET_HEADER_SIZE {
        return Err(TransportError::MalformedPacket {
            length,
            reason: "declared length shorter than the header",
        });
    }
    Ok(length)
}

fn validate_header(packet: &Packet, at: usize, length: usize) -> Result<()> {
    let raw = packet.raw();
    PacketHeader::decode(&mut &raw[at..at + PACKET_HEADER_SIZE]).map_err(|_| {
        TransportError::MalformedPacket {
            length,
            reason: "unknown packet type or status",
        }
    })?;
    Ok(())
}
