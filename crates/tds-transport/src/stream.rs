//! Outgoing packet assembly with deferred-length prefixes.
//!
//! Bytes are appended to the current packet until it is full. A full packet
//! is only handed on when another byte has to be written (or on flush), so a
//! message whose last byte exactly fills a packet never produces an empty
//! trailing packet.
//!
//! While a freeze is open, full packets are parked in a chain instead of
//! being sent, so the placeholder written at [`WriteStream::freeze()`] can be
//! patched once the length is known, even if it straddles two packets.

use smallvec::SmallVec;
use tds_protocol::{PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType};

use crate::error::{Result, TransportError};
use crate::packet::Packet;

/// Where finished packets go and where fresh buffers come from.
pub(crate) trait PacketSink {
    /// Borrow an empty buffer of at least `capacity` bytes.
    fn acquire(&mut self, capacity: usize) -> Result<Packet>;

    /// Transmit a sealed packet, blocking until it is on the wire.
    fn send(&mut self, packet: Packet) -> Result<()>;

    /// Give unsent buffers back.
    fn recycle(&mut self, packets: Vec<Packet>);
}

/// An open deferred-length prefix.
///
/// Obtained from `Session::freeze()` and consumed by exactly one of the
/// close or abort calls. Frames nest and must be finished innermost first.
#[must_use = "a freeze frame must be closed or aborted"]
#[derive(Debug)]
pub struct FreezeFrame {
    /// Index of the packet holding the first placeholder byte, counted from
    /// the start of the frozen chain.
    index: usize,
    /// Write offset within that packet, relative to the TDS header.
    pos: usize,
    size_len: usize,
    depth: usize,
}

impl FreezeFrame {
    /// Width of the reserved length prefix in bytes.
    #[must_use]
    pub fn size_len(&self) -> usize {
        self.size_len
    }
}

#[derive(Debug)]
pub(crate) struct WriteStream {
    /// Maximum TDS packet length, header included.
    block_size: usize,
    /// Offset of the TDS header inside each buffer (SMP reserve).
    data_start: usize,
    packet_type: PacketType,
    packet_id: u8,
    current: Option<Packet>,
    /// Write offset within `current`, relative to the TDS header.
    pos: usize,
    frozen: Vec<Packet>,
    depth: usize,
}

impl WriteStream {
    pub(crate) fn new(block_size: usize, data_start: usize) -> Self {
        Self {
            block_size,
            data_start,
            packet_type: PacketType::SqlBatch,
            packet_id: 1,
            current: None,
            pos: PACKET_HEADER_SIZE,
            frozen: Vec::new(),
            depth: 0,
        }
    }

    pub(crate) fn set_packet_type(&mut self, packet_type: PacketType) {
        self.packet_type = packet_type;
    }

    pub(crate) fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub(crate) fn freeze_depth(&self) -> usize {
        self.depth
    }

    pub(crate) fn put_bytes(&mut self, mut data: &[u8], sink: &mut impl PacketSink) -> Result<()> {
        while !data.is_empty() {
            let n = self.reserve(data.len(), sink)?;
            let (chunk, rest) = data.split_at(n);
            self.copy_in(chunk);
            data = rest;
        }
        Ok(())
    }

    pub(crate) fn put_zeros(&mut self, mut len: usize, sink: &mut impl PacketSink) -> Result<()> {
        while len > 0 {
            let n = self.reserve(len, sink)?;
            self.zero_fill(n);
            len -= n;
        }
        Ok(())
    }

    /// Send the current packet, marking it last if `last`.
    pub(crate) fn flush(&mut self, last: bool, sink: &mut impl PacketSink) -> Result<()> {
        if self.depth > 0 {
            return Err(TransportError::Usage("cannot flush while a freeze is open"));
        }
        self.ensure_current(sink)?;
        let Some(mut packet) = self.current.take() else {
            return Ok(());
        };
        packet.set_data_len(self.pos);
        self.pos = PACKET_HEADER_SIZE;
        self.seal(&mut packet, last);
        sink.send(packet)
    }

    pub(crate) fn freeze(
        &mut self,
        size_len: usize,
        sink: &mut impl PacketSink,
    ) -> Result<FreezeFrame> {
        if !matches!(size_len, 0 | 1 | 2 | 4) {
            return Err(TransportError::Usage("length prefix must be 0, 1, 2 or 4 bytes"));
        }
        self.ensure_current(sink)?;
        self.depth += 1;
        let frame = FreezeFrame {
            index: self.frozen.len(),
            pos: self.pos,
            size_len,
            depth: self.depth,
        };
        if let Err(err) = self.put_zeros(size_len, sink) {
            self.rewind(&frame, sink);
            return Err(err);
        }
        Ok(frame)
    }

    /// Bytes written since `frame` was opened, its placeholder included.
    pub(crate) fn bytes_written(&self, frame: &FreezeFrame) -> usize {
        (frame.index..=self.frozen.len())
            .map(|idx| {
                let start = if idx == frame.index {
                    frame.pos
                } else {
                    PACKET_HEADER_SIZE
                };
                let end = self.frozen.get(idx).map_or(self.pos, Packet::data_len);
                end.saturating_sub(start)
            })
            .sum()
    }

    pub(crate) fn close(&mut self, frame: FreezeFrame, sink: &mut impl PacketSink) -> Result<()> {
        let length = self.bytes_written(&frame).saturating_sub(frame.size_len);
        self.close_with_length(frame, length, sink)
    }

    pub(crate) fn close_as_unit_count(
        &mut self,
        frame: FreezeFrame,
        unit_size: usize,
        sink: &mut impl PacketSink,
    ) -> Result<()> {
        if unit_size == 0 {
            self.abort(frame, sink)?;
            return Err(TransportError::Usage("unit size must be non-zero"));
        }
        let length = self.bytes_written(&frame).saturating_sub(frame.size_len);
        self.close_with_length(frame, length / unit_size, sink)
    }

    pub(crate) fn close_with_length(
        &mut self,
        frame: FreezeFrame,
        length: usize,
        sink: &mut impl PacketSink,
    ) -> Result<()> {
        self.check_innermost(&frame)?;
        let fits = frame.size_len == 0
            || u64::try_from(length).is_ok_and(|len| len >> (8 * frame.size_len) == 0);
        if !fits {
            self.rewind(&frame, sink);
            return Err(TransportError::Usage("length does not fit the reserved prefix"));
        }

        let bytes = (length as u64).to_le_bytes();
        for (spot, byte) in self.placeholder(&frame).into_iter().zip(bytes) {
            if let Some(dst) = self.byte_mut(spot) {
                *dst = byte;
            }
        }

        self.depth -= 1;
        if self.depth == 0 {
            self.release_frozen(sink)?;
        }
        Ok(())
    }

    /// Drop everything written since `frame` was opened.
    pub(crate) fn abort(&mut self, frame: FreezeFrame, sink: &mut impl PacketSink) -> Result<()> {
        self.check_innermost(&frame)?;
        self.rewind(&frame, sink);
        Ok(())
    }

    /// Take every buffer the stream holds, leaving it empty.
    pub(crate) fn take_all(&mut self) -> Vec<Packet> {
        let mut packets = std::mem::take(&mut self.frozen);
        packets.extend(self.current.take());
        self.pos = PACKET_HEADER_SIZE;
        self.depth = 0;
        packets
    }

    fn check_innermost(&self, frame: &FreezeFrame) -> Result<()> {
        if frame.depth != self.depth {
            return Err(TransportError::Usage(
                "freeze frames must be finished innermost first",
            ));
        }
        Ok(())
    }

    fn rewind(&mut self, frame: &FreezeFrame, sink: &mut impl PacketSink) {
        if frame.index < self.frozen.len() {
            let tail = self.frozen.split_off(frame.index + 1);
            if let Some(start) = self.frozen.pop() {
                let mut unused = tail;
                unused.extend(self.current.replace(start));
                sink.recycle(unused);
            }
        }
        self.pos = frame.pos;
        self.depth = frame.depth - 1;
    }

    /// Chain positions of the placeholder bytes, skipping packet headers.
    fn placeholder(&self, frame: &FreezeFrame) -> SmallVec<[(usize, usize); 4]> {
        let mut spots = SmallVec::new();
        let (mut idx, mut off) = (frame.index, frame.pos);
        while spots.len() < frame.size_len {
            let end = match self.frozen.get(idx) {
                Some(packet) => packet.data_len(),
                None if idx == self.frozen.len() => self.pos,
                None => break,
            };
            if off < end {
                spots.push((idx, off));
                off += 1;
            } else {
                idx += 1;
                off = PACKET_HEADER_SIZE;
            }
        }
        spots
    }

    fn byte_mut(&mut self, (idx, off): (usize, usize)) -> Option<&mut u8> {
        let at = self.data_start + off;
        let packet = if idx < self.frozen.len() {
            self.frozen.get_mut(idx)
        } else {
            self.current.as_mut()
        };
        packet.and_then(|packet| packet.raw_mut().get_mut(at))
    }

    /// Make room at the write position; returns how many of `want` bytes fit.
    fn reserve(&mut self, want: usize, sink: &mut impl PacketSink) -> Result<usize> {
        if self.pos >= self.block_size {
            self.packet_full(sink)?;
        }
        self.ensure_current(sink)?;
        Ok(want.min(self.block_size - self.pos))
    }

    fn ensure_current(&mut self, sink: &mut impl PacketSink) -> Result<()> {
        if self.current.is_none() {
            let mut packet = sink.acquire(self.data_start + self.block_size)?;
            packet.set_layout(self.data_start, 0);
            self.current = Some(packet);
            self.pos = PACKET_HEADER_SIZE;
        }
        Ok(())
    }

    fn packet_full(&mut self, sink: &mut impl PacketSink) -> Result<()> {
        let Some(mut packet) = self.current.take() else {
            self.pos = PACKET_HEADER_SIZE;
            return Ok(());
        };
        packet.set_data_len(self.pos);
        self.pos = PACKET_HEADER_SIZE;
        if self.depth > 0 {
            self.frozen.push(packet);
            return Ok(());
        }
        self.seal(&mut packet, false);
        sink.send(packet)
    }

    fn release_frozen(&mut self, sink: &mut impl PacketSink) -> Result<()> {
        let mut chain = std::mem::take(&mut self.frozen).into_iter();
        while let Some(mut packet) = chain.next() {
            self.seal(&mut packet, false);
            if let Err(err) = sink.send(packet) {
                sink.recycle(chain.collect());
                return Err(err);
            }
        }
        Ok(())
    }

    fn copy_in(&mut self, src: &[u8]) {
        let at = self.data_start + self.pos;
        if let Some(dst) = self
            .current
            .as_mut()
            .and_then(|packet| packet.raw_mut().get_mut(at..at + src.len()))
        {
            dst.copy_from_slice(src);
        }
        self.pos += src.len();
    }

    fn zero_fill(&mut self, n: usize) {
        let at = self.data_start + self.pos;
        if let Some(dst) = self
            .current
            .as_mut()
            .and_then(|packet| packet.raw_mut().get_mut(at..at + n))
        {
            dst.fill(0);
        }
        self.pos += n;
    }

    /// Write the TDS header and advance the packet id.
    fn seal(&mut self, packet: &mut Packet, last: bool) {
        let status = if last {
            PacketStatus::END_OF_MESSAGE
        } else {
            PacketStatus::NORMAL
        };
        let header = PacketHeader::new(self.packet_type, status, packet.data_len() as u16)
            .with_packet_id(self.packet_id);
        let at = packet.data_start();
        if let Some(dst) = packet
            .raw_mut()
            .get_mut(at..at + PACKET_HEADER_SIZE)
            .and_then(|dst| <&mut [u8; PACKET_HEADER_SIZE]>::try_from(dst).ok())
        {
            header.encode_into(dst);
        }

        self.packet_id = if last {
            1
        } else {
            match self.packet_id.wrapping_add(1) {
                0 => 1,
                id => id,
            }
        };
    }
}
