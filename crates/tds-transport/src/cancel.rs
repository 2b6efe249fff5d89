//! Out-of-band request cancellation.

use std::sync::Arc;

use parking_lot::Condvar;
use tds_protocol::{PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType};

use crate::connection::{ConnState, Shared};
use crate::error::{Result, TransportError};
use crate::hook::Operation;
use crate::mux::SessionPhase;
use crate::transport::{Transport, is_retryable};

/// Sends an attention signal for one session from any thread.
///
/// The server answers with a DONE token carrying the attention flag, which
/// arrives through the session's normal [`read_packet()`] path.
///
/// [`read_packet()`]: crate::Session::read_packet
pub struct CancelHandle<T: Transport> {
    shared: Arc<Shared<T>>,
    sid: u16,
    waker: Arc<Condvar>,
}

impl<T: Transport> Clone for CancelHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            sid: self.sid,
            waker: Arc::clone(&self.waker),
        }
    }
}

impl<T: Transport> std::fmt::Debug for CancelHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("sid", &self.sid)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> CancelHandle<T> {
    pub(crate) fn new(shared: Arc<Shared<T>>, sid: u16, waker: Arc<Condvar>) -> Self {
        Self { shared, sid, waker }
    }

    /// Session this handle cancels.
    #[must_use]
    pub fn sid(&self) -> u16 {
        self.sid
    }

    /// Request cancellation of the session's running request.
    ///
    /// Without MARS the attention packet is written straight to the
    /// transport unless another packet is partially written, in which case
    /// it goes out right after that packet. If the socket cannot take it at
    /// once, the remainder jumps the send queue. Under MARS it is queued as a
    /// DATA frame for the session regardless of the send window.
    pub fn cancel(&self) -> Result<()> {
        self.shared.send_attention(self.sid, &self.waker)
    }
}

/// Header of the 8-byte attention packet.
fn attention_header() -> PacketHeader {
    PacketHeader::new(
        PacketType::Attention,
        PacketStatus::END_OF_MESSAGE,
        PACKET_HEADER_SIZE as u16,
    )
}

impl<T: Transport> Shared<T> {
    pub(crate) fn send_attention(&self, sid: u16, waker: &Condvar) -> Result<()> {
        let mut st = self.state.lock();
        if st.dead {
            return Err(TransportError::ConnectionClosed);
        }

        let offset = self.config.frame_offset();
        let mut packet = st.pool.acquire(offset + PACKET_HEADER_SIZE)?;
        packet.set_layout(offset, PACKET_HEADER_SIZE);
        packet.set_sid(sid);
        let mut raw = [0u8; PACKET_HEADER_SIZE];
        attention_header().encode_into(&mut raw);
        packet.raw_mut()[offset..offset + PACKET_HEADER_SIZE].copy_from_slice(&raw);

        if !self.config.mars {
            if st.outbound.is_writing() {
                tracing::debug!(sid, "queueing attention behind partial write");
                st.outbound.push_urgent(packet);
                if st.net_owner.is_none() {
                    return self.wait_sent(&mut st, sid, waker);
                }
                return Ok(());
            }
            tracing::debug!(sid, "writing attention");
            match self.transport.write(packet.wire()) {
                Ok(n) if n == packet.wire().len() => {
                    st.pool.release(packet);
                    return Ok(());
                }
                Ok(0) => {
                    st.pool.release(packet);
                    let err = std::io::Error::from(std::io::ErrorKind::WriteZero);
                    return Err(self.fail(&mut st, err.into()));
                }
                Ok(n) => st.outbound.push_resumed(packet, n),
                Err(err) if is_retryable(&err) => st.outbound.push_resumed(packet, 0),
                Err(err) => {
                    st.pool.release(packet);
                    return Err(self.fail(&mut st, err.into()));
                }
            }
            // The socket is backed up; the rest goes out like any other
            // packet so the timeout and the hook apply.
            tracing::debug!(sid, "attention write stalled, queued the remainder");
            if st.net_owner.is_none() {
                return self.wait_sent(&mut st, sid, waker);
            }
            return Ok(());
        }

        let state = &mut *st;
        match state.sessions.get_mut(sid) {
            Some(session) if session.phase == SessionPhase::Idle => {
                tracing::debug!(sid, "nothing to cancel on an unused session");
                state.pool.release(packet);
                return Ok(());
            }
            Some(session) if session.phase != SessionPhase::Closed => {
                session.stamp_data(sid, &mut packet);
            }
            _ => {
                state.pool.release(packet);
                return Err(TransportError::SessionClosed { sid });
            }
        }
        tracing::debug!(sid, "queued attention");
        state.outbound.push_back(packet);

        if st.net_owner.is_none() {
            self.drive(&mut st, sid, Operation::Send, |s| !s.outbound.pending_for(sid))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attention_wire_bytes() {
        let mut raw = [0u8; PACKET_HEADER_SIZE];
        attention_header().encode_into(&mut raw);
        assert_eq!(raw, [0x06, 0x01, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00]);
    }
}
