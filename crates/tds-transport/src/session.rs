//! Per-session handle: write stream, freeze frames and the receive path.

use std::sync::Arc;

use parking_lot::Condvar;
use tds_protocol::PacketType;
use tds_protocol::codec::Endian;

use crate::cancel::CancelHandle;
use crate::connection::Shared;
use crate::error::{Result, TransportError};
use crate::mux::SessionPhase;
use crate::packet::{Packet, PacketView};
use crate::stream::{FreezeFrame, PacketSink, WriteStream};
use crate::transport::Transport;

/// One logical request/response stream over a [`Connection`].
///
/// A session is driven by a single thread. Writes are buffered into packets
/// of the negotiated size; a packet is transmitted once it is full and more
/// data follows, or on [`Session::flush()`].
///
/// Dropping a session closes it without waiting for the FIN to be written.
///
/// [`Connection`]: crate::Connection
pub struct Session<T: Transport> {
    shared: Arc<Shared<T>>,
    sid: u16,
    waker: Arc<Condvar>,
    stream: WriteStream,
    closed: bool,
}

/// Routes the write stream's packets through the connection.
struct Link<'a, T> {
    shared: &'a Shared<T>,
    sid: u16,
    waker: &'a Condvar,
}

impl<T: Transport> PacketSink for Link<'_, T> {
    fn acquire(&mut self, capacity: usize) -> Result<Packet> {
        self.shared.acquire(capacity)
    }

    fn send(&mut self, packet: Packet) -> Result<()> {
        self.shared.put_packet(self.sid, self.waker, packet)
    }

    fn recycle(&mut self, packets: Vec<Packet>) {
        self.shared.recycle(packets);
    }
}

impl<T: Transport> std::fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("sid", &self.sid)
            .field("closed", &self.closed)
            .field("freeze_depth", &self.stream.freeze_depth())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Session<T> {
    pub(crate) fn new(shared: Arc<Shared<T>>, sid: u16, waker: Arc<Condvar>) -> Self {
        let stream = WriteStream::new(
            usize::from(shared.config.packet_size),
            shared.config.frame_offset(),
        );
        Self {
            shared,
            sid,
            waker,
            stream,
            closed: false,
        }
    }

    /// Session identifier (always 0 without MARS).
    #[must_use]
    pub fn sid(&self) -> u16 {
        self.sid
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.shared.state.lock().sessions.phase(self.sid)
    }

    /// Handle another thread can use to cancel this session's request.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle<T> {
        CancelHandle::new(Arc::clone(&self.shared), self.sid, Arc::clone(&self.waker))
    }

    /// Select the packet type stamped on subsequent packets.
    pub fn set_packet_type(&mut self, packet_type: PacketType) {
        self.stream.set_packet_type(packet_type);
    }

    /// Packet type of the message being written.
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        self.stream.packet_type()
    }

    /// Number of freeze frames currently open.
    #[must_use]
    pub fn freeze_depth(&self) -> usize {
        self.stream.freeze_depth()
    }

    fn parts(&mut self) -> Result<(&mut WriteStream, Link<'_, T>)> {
        if self.closed {
            return Err(TransportError::SessionClosed { sid: self.sid });
        }
        let link = Link {
            shared: self.shared.as_ref(),
            sid: self.sid,
            waker: &self.waker,
        };
        Ok((&mut self.stream, link))
    }

    /// Append raw bytes, spilling into new packets as needed.
    pub fn put_bytes(&mut self, data: &[u8]) -> Result<()> {
        let (stream, mut link) = self.parts()?;
        stream.put_bytes(data, &mut link)
    }

    /// Append `len` zero bytes.
    pub fn put_zeros(&mut self, len: usize) -> Result<()> {
        let (stream, mut link) = self.parts()?;
        stream.put_zeros(len, &mut link)
    }

    /// Append one byte.
    pub fn put_u8(&mut self, value: u8) -> Result<()> {
        self.put_bytes(&[value])
    }

    /// Append a `u16` in the given byte order.
    pub fn put_u16(&mut self, value: u16, endian: Endian) -> Result<()> {
        self.put_bytes(&endian.u16_bytes(value))
    }

    /// Append a `u32` in the given byte order.
    pub fn put_u32(&mut self, value: u32, endian: Endian) -> Result<()> {
        self.put_bytes(&endian.u32_bytes(value))
    }

    /// Append a `u64` in the given byte order.
    pub fn put_u64(&mut self, value: u64, endian: Endian) -> Result<()> {
        self.put_bytes(&endian.u64_bytes(value))
    }

    /// Append `text` as UTF-16LE.
    pub fn put_utf16(&mut self, text: &str) -> Result<()> {
        for unit in text.encode_utf16() {
            self.put_bytes(&unit.to_le_bytes())?;
        }
        Ok(())
    }

    /// Transmit the current packet. `last` marks the end of the message.
    ///
    /// Fails with [`TransportError::Usage`] while a freeze is open.
    pub fn flush(&mut self, last: bool) -> Result<()> {
        let (stream, mut link) = self.parts()?;
        stream.flush(last, &mut link)
    }

    /// Reserve a `size_len`-byte little-endian length prefix (0, 1, 2 or 4)
    /// to be filled in when the frame is closed.
    ///
    /// Until the outermost frame closes, full packets are held back rather
    /// than transmitted.
    pub fn freeze(&mut self, size_len: usize) -> Result<FreezeFrame> {
        let (stream, mut link) = self.parts()?;
        stream.freeze(size_len, &mut link)
    }

    /// Bytes written since `frame` was opened, placeholder included.
    #[must_use]
    pub fn freeze_bytes_written(&self, frame: &FreezeFrame) -> u32 {
        u32::try_from(self.stream.bytes_written(frame)).unwrap_or(u32::MAX)
    }

    /// Close `frame`, patching its prefix with the number of bytes written
    /// after the placeholder.
    pub fn freeze_close(&mut self, frame: FreezeFrame) -> Result<()> {
        let (stream, mut link) = self.parts()?;
        stream.close(frame, &mut link)
    }

    /// Close `frame`, patching its prefix with `length`.
    pub fn freeze_close_with_length(&mut self, frame: FreezeFrame, length: u32) -> Result<()> {
        let (stream, mut link) = self.parts()?;
        stream.close_with_length(frame, length as usize, &mut link)
    }

    /// Close `frame`, patching its prefix with the byte count divided by
    /// `unit_size` (2 for UTF-16 character counts).
    pub fn freeze_close_as_unit_count(&mut self, frame: FreezeFrame, unit_size: usize) -> Result<()> {
        let (stream, mut link) = self.parts()?;
        stream.close_as_unit_count(frame, unit_size, &mut link)
    }

    /// Discard everything written since `frame` was opened.
    pub fn freeze_abort(&mut self, frame: FreezeFrame) -> Result<()> {
        let (stream, mut link) = self.parts()?;
        stream.abort(frame, &mut link)
    }

    /// Block until the next packet for this session arrives.
    ///
    /// Returns [`TransportError::SessionClosed`] once the peer has closed the
    /// session and every packet it sent before has been read.
    pub fn read_packet(&mut self) -> Result<PacketView> {
        if self.closed {
            return Err(TransportError::SessionClosed { sid: self.sid });
        }
        self.shared.read_packet(self.sid, &self.waker)
    }

    /// Close the session, waiting until the FIN is on the wire.
    ///
    /// Unsent output is discarded. Later calls on this session fail with
    /// [`TransportError::SessionClosed`].
    pub fn close(&mut self) -> Result<()> {
        self.shutdown(true)
    }

    fn shutdown(&mut self, wait: bool) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.shared.recycle(self.stream.take_all());
        self.shared.close_session(self.sid, &self.waker, wait)
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown(false) {
            tracing::debug!(sid = self.sid, error = %err, "session closed with error");
        }
    }
}
