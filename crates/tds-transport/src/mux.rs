//! MARS session bookkeeping and SMP flow control.
//!
//! Sequence numbers count DATA frames per direction. A side may send while
//! its last sequence number is below the window the peer last advertised;
//! comparisons go through [`seq_diff`] so they survive 32-bit wrap.

use std::sync::Arc;

use parking_lot::Condvar;
use tds_protocol::codec::seq_diff;
use tds_protocol::{SMP_HEADER_SIZE, SmpHeader, SmpType};

use crate::error::{Result, TransportError};
use crate::packet::Packet;
use crate::pool::PacketPool;

/// Frames granted to the peer beyond the last one received.
pub(crate) const WINDOW_GRANT: u32 = 4;

/// An ACK is due once the peer is this close to the advertised window.
const ACK_THRESHOLD: u32 = 2;

/// Lifecycle of one logical session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Allocated locally; nothing sent yet.
    Idle,
    /// SYN queued, waiting for the first frame from the peer.
    SynSent,
    /// Open in both directions.
    Active,
    /// FIN queued by us.
    FinSent,
    /// FIN received from the peer.
    Closed,
}

#[derive(Debug)]
pub(crate) struct SessionState {
    pub(crate) phase: SessionPhase,
    pub(crate) send_seq: u32,
    pub(crate) send_wnd: u32,
    pub(crate) recv_seq: u32,
    pub(crate) recv_wnd: u32,
    pub(crate) waker: Arc<Condvar>,
}

impl SessionState {
    pub(crate) fn new(waker: Arc<Condvar>, initial_window: u32) -> Self {
        Self {
            phase: SessionPhase::Idle,
            send_seq: 0,
            send_wnd: initial_window,
            recv_seq: 0,
            recv_wnd: initial_window,
            waker,
        }
    }

    /// Whether another DATA frame fits in the send window.
    pub(crate) fn can_send(&self) -> bool {
        seq_diff(self.send_seq, self.send_wnd) < 0
    }

    /// Whether the peer should be sent a window update.
    pub(crate) fn needs_ack(&self) -> bool {
        seq_diff(self.recv_seq.wrapping_add(ACK_THRESHOLD), self.recv_wnd) >= 0
    }

    /// Stamp the next DATA header into the reserved front of `packet`.
    pub(crate) fn stamp_data(&mut self, sid: u16, packet: &mut Packet) {
        self.send_seq = self.send_seq.wrapping_add(1);
        self.recv_wnd = self.recv_seq.wrapping_add(WINDOW_GRANT);
        let size = (packet.data_start() + packet.data_len()) as u32;
        let header = SmpHeader::new(SmpType::Data, sid, size, self.send_seq, self.recv_wnd);
        write_smp(packet, header);
    }

    pub(crate) fn syn_header(&self, sid: u16) -> SmpHeader {
        SmpHeader::control(SmpType::Syn, sid, 0, self.recv_wnd)
    }

    /// Window update granting [`WINDOW_GRANT`] frames past the last one
    /// received. The caller records `wnd` once the frame is queued.
    pub(crate) fn ack_header(&self, sid: u16) -> SmpHeader {
        let wnd = self.recv_seq.wrapping_add(WINDOW_GRANT);
        SmpHeader::control(SmpType::Ack, sid, self.send_seq, wnd)
    }

    pub(crate) fn fin_header(&self, sid: u16) -> SmpHeader {
        let wnd = self.recv_seq.wrapping_add(WINDOW_GRANT);
        SmpHeader::control(SmpType::Fin, sid, self.send_seq, wnd)
    }
}

fn write_smp(packet: &mut Packet, header: SmpHeader) {
    if let Some(dst) = packet
        .raw_mut()
        .get_mut(..SMP_HEADER_SIZE)
        .and_then(|dst| <&mut [u8; SMP_HEADER_SIZE]>::try_from(dst).ok())
    {
        header.encode_into(dst);
    }
}

/// Build a payload-less control frame.
pub(crate) fn control_packet(pool: &mut PacketPool, header: SmpHeader) -> Result<Packet> {
    let mut packet = pool.acquire(SMP_HEADER_SIZE)?;
    packet.set_layout(SMP_HEADER_SIZE, 0);
    packet.set_sid(header.sid);
    write_smp(&mut packet, header);
    Ok(packet)
}

#[derive(Debug)]
pub(crate) enum SessionSlot {
    Empty,
    Open(SessionState),
    /// Closed locally; the identifier stays reserved until the peer's FIN.
    Tombstoned(Arc<Condvar>),
}

/// What an inbound SMP frame did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatch {
    /// DATA to be queued for the session.
    Deliver,
    /// ACK, or any window change.
    WindowUpdate,
    /// Peer closed an open session.
    PeerClosed,
    /// Peer acknowledged our FIN; the identifier is free again.
    Released,
}

/// Session table indexed by sid.
#[derive(Debug, Default)]
pub(crate) struct SessionRegistry {
    slots: Vec<SessionSlot>,
}

impl SessionRegistry {
    /// Place `state` in the lowest empty slot.
    pub(crate) fn allocate(&mut self, state: SessionState) -> Result<u16> {
        let index = match self
            .slots
            .iter()
            .position(|slot| matches!(slot, SessionSlot::Empty))
        {
            Some(index) => index,
            None => {
                if self.slots.len() > usize::from(u16::MAX) {
                    return Err(TransportError::Usage("no free session identifier"));
                }
                self.slots.push(SessionSlot::Empty);
                self.slots.len() - 1
            }
        };
        self.slots[index] = SessionSlot::Open(state);
        u16::try_from(index).map_err(|_| TransportError::Usage("no free session identifier"))
    }

    pub(crate) fn get(&self, sid: u16) -> Option<&SessionState> {
        match self.slots.get(usize::from(sid)) {
            Some(SessionSlot::Open(state)) => Some(state),
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, sid: u16) -> Option<&mut SessionState> {
        match self.slots.get_mut(usize::from(sid)) {
            Some(SessionSlot::Open(state)) => Some(state),
            _ => None,
        }
    }

    pub(crate) fn is_open(&self, sid: u16) -> bool {
        self.get(sid).is_some()
    }

    /// Keep the identifier reserved until the peer confirms with FIN.
    pub(crate) fn tombstone(&mut self, sid: u16) {
        let Some(state) = self.get(sid) else {
            return;
        };
        let waker = Arc::clone(&state.waker);
        self.slots[usize::from(sid)] = SessionSlot::Tombstoned(waker);
    }

    /// Phase as seen from outside; a tombstone is a FIN still in flight.
    pub(crate) fn phase(&self, sid: u16) -> SessionPhase {
        match self.slots.get(usize::from(sid)) {
            Some(SessionSlot::Open(state)) => state.phase,
            Some(SessionSlot::Tombstoned(_)) => SessionPhase::FinSent,
            _ => SessionPhase::Closed,
        }
    }

    pub(crate) fn free(&mut self, sid: u16) {
        if let Some(slot) = self.slots.get_mut(usize::from(sid)) {
            *slot = SessionSlot::Empty;
        }
    }

    pub(crate) fn notify(&self, sid: u16) {
        match self.slots.get(usize::from(sid)) {
            Some(SessionSlot::Open(state)) => {
                state.waker.notify_all();
            }
            Some(SessionSlot::Tombstoned(waker)) => {
                waker.notify_all();
            }
            _ => {}
        }
    }

    pub(crate) fn notify_all(&self) {
        for sid in 0..self.slots.len() {
            self.notify(sid as u16);
        }
    }

    /// Apply an inbound SMP header to the session table.
    pub(crate) fn handle_inbound(&mut self, header: &SmpHeader) -> Result<Dispatch> {
        let sid = header.sid;
        let slot = self
            .slots
            .get_mut(usize::from(sid))
            .ok_or_else(|| TransportError::violation(format!("frame for unknown session {sid}")))?;

        let state = match slot {
            SessionSlot::Tombstoned(_) if header.smp_type == SmpType::Fin => {
                *slot = SessionSlot::Empty;
                return Ok(Dispatch::Released);
            }
            SessionSlot::Tombstoned(_) => {
                return Err(TransportError::violation(format!(
                    "{:?} frame for closed session {sid}",
                    header.smp_type
                )));
            }
            SessionSlot::Empty => {
                return Err(TransportError::violation(format!(
                    "{:?} frame for unknown session {sid}",
                    header.smp_type
                )));
            }
            SessionSlot::Open(state) => state,
        };

        if header.smp_type == SmpType::Syn {
            return Err(TransportError::violation(format!(
                "peer sent SYN for session {sid}"
            )));
        }

        state.send_wnd = header.wnd;
        if state.phase == SessionPhase::SynSent {
            state.phase = SessionPhase::Active;
        }

        Ok(match header.smp_type {
            SmpType::Data => {
                state.recv_seq = header.seq;
                Dispatch::Deliver
            }
            SmpType::Fin => {
                state.phase = SessionPhase::Closed;
                Dispatch::PeerClosed
            }
            SmpType::Ack | SmpType::Syn => Dispatch::WindowUpdate,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn state() -> SessionState {
        SessionState::new(Arc::new(Condvar::new()), WINDOW_GRANT)
    }

    #[test]
    fn test_window_allows_four_frames() {
        let mut pool = PacketPool::new(0);
        let mut session = state();
        let mut sent = 0;
        while session.can_send() {
            let mut packet = pool.acquire(SMP_HEADER_SIZE + 8).unwrap();
            packet.set_layout(SMP_HEADER_SIZE, 8);
            session.stamp_data(1, &mut packet);
            sent += 1;
            let header = SmpHeader::decode(&mut packet.wire()).unwrap();
            assert_eq!(header.seq, sent);
            assert_eq!(header.size, 24);
            assert_eq!(header.wnd, 4);
        }
        assert_eq!(sent, 4);
    }

    #[test]
    fn test_window_survives_wrap() {
        let mut session = state();
        session.send_seq = u32::MAX - 1;
        session.send_wnd = 2;
        assert!(session.can_send());
        session.send_seq = 2;
        assert!(!session.can_send());
    }

    #[test]
    fn test_ack_threshold() {
        let mut session = state();
        session.recv_seq = 1;
        assert!(!session.needs_ack());
        session.recv_seq = 2;
        assert!(session.needs_ack());
        let ack = session.ack_header(5);
        assert_eq!(ack.smp_type, SmpType::Ack);
        assert_eq!(ack.wnd, 6);
        session.recv_wnd = ack.wnd;
        assert!(!session.needs_ack());
    }

    #[test]
    fn test_control_packet_layout() {
        let mut pool = PacketPool::new(0);
        let packet = control_packet(&mut pool, SmpHeader::control(SmpType::Fin, 7, 3, 9)).unwrap();
        assert_eq!(packet.wire().len(), SMP_HEADER_SIZE);
        assert_eq!(packet.sid(), 7);
        let header = SmpHeader::decode(&mut packet.wire()).unwrap();
        assert_eq!(header, SmpHeader::control(SmpType::Fin, 7, 3, 9));
    }

    #[test]
    fn test_allocate_lowest_free() {
        let mut registry = SessionRegistry::default();
        assert_eq!(registry.allocate(state()).unwrap(), 0);
        assert_eq!(registry.allocate(state()).unwrap(), 1);
        assert_eq!(registry.allocate(state()).unwrap(), 2);
        registry.free(1);
        assert_eq!(registry.allocate(state()).unwrap(), 1);
        registry.tombstone(0);
        assert_eq!(registry.allocate(state()).unwrap(), 3);
    }

    #[test]
    fn test_inbound_transitions() {
        let mut registry = SessionRegistry::default();
        let sid = registry.allocate(state()).unwrap();
        registry.get_mut(sid).unwrap().phase = SessionPhase::SynSent;

        let ack = SmpHeader::control(SmpType::Ack, sid, 0, 9);
        assert_eq!(registry.handle_inbound(&ack).unwrap(), Dispatch::WindowUpdate);
        let session = registry.get(sid).unwrap();
        assert_eq!(session.phase, SessionPhase::Active);
        assert_eq!(session.send_wnd, 9);

        let data = SmpHeader::new(SmpType::Data, sid, 30, 1, 5);
        assert_eq!(registry.handle_inbound(&data).unwrap(), Dispatch::Deliver);
        assert_eq!(registry.get(sid).unwrap().recv_seq, 1);

        let fin = SmpHeader::control(SmpType::Fin, sid, 1, 5);
        assert_eq!(registry.handle_inbound(&fin).unwrap(), Dispatch::PeerClosed);
        assert_eq!(registry.get(sid).unwrap().phase, SessionPhase::Closed);
    }

    #[test]
    fn test_tombstone_released_by_fin_only() {
        let mut registry = SessionRegistry::default();
        let sid = registry.allocate(state()).unwrap();
        registry.tombstone(sid);
        assert!(!registry.is_open(sid));
        assert_eq!(registry.phase(sid), SessionPhase::FinSent);

        let data = SmpHeader::new(SmpType::Data, sid, 24, 1, 5);
        assert!(matches!(
            registry.handle_inbound(&data),
            Err(TransportError::ProtocolViolation(_))
        ));

        let fin = SmpHeader::control(SmpType::Fin, sid, 0, 4);
        assert_eq!(registry.handle_inbound(&fin).unwrap(), Dispatch::Released);
        assert_eq!(registry.phase(sid), SessionPhase::Closed);
        assert_eq!(registry.allocate(state()).unwrap(), sid);
    }

    #[test]
    fn test_violations() {
        let mut registry = SessionRegistry::default();
        let unknown = SmpHeader::control(SmpType::Ack, 3, 0, 4);
        assert!(registry.handle_inbound(&unknown).is_err());

        let sid = registry.allocate(state()).unwrap();
        let syn = SmpHeader::control(SmpType::Syn, sid, 0, 4);
        assert!(matches!(
            registry.handle_inbound(&syn),
            Err(TransportError::ProtocolViolation(_))
        ));
    }
}
