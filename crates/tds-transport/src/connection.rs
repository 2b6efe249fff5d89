//! Shared connection state and the network driver.
//!
//! One mutex guards everything mutable about a physical connection: the
//! packet pool, both queues, the session table and the network-owner
//! marker. Exactly one thread at a time owns the network. The owner drains
//! the outbound queue and reads frames, releasing the lock around every
//! blocking transport call; everyone else sleeps on their session's
//! condition variable and re-checks after each wake-up or poll slice.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::framer::{Frame, PacketReader};
use crate::hook::{DefaultErrorHook, ErrorHook, Operation, TimeoutAction, TimeoutContext};
use crate::mux::{self, SessionPhase, SessionRegistry, SessionState};
use crate::packet::{Packet, PacketView};
use crate::pool::PacketPool;
use crate::session::Session;
use crate::transport::{Transport, is_retryable};

#[derive(Debug)]
pub(crate) struct Outbound {
    packet: Packet,
    /// Bytes of `packet.wire()` already written.
    sent: usize,
}

/// Packets waiting for the network owner, in transmission order.
#[derive(Debug, Default)]
pub(crate) struct OutboundQueue {
    queue: VecDeque<Outbound>,
    /// Session of the packet the owner is writing right now.
    in_flight: Option<u16>,
}

impl OutboundQueue {
    pub(crate) fn push_back(&mut self, packet: Packet) {
        self.queue.push_back(Outbound { packet, sent: 0 });
    }

    /// Queue ahead of everything not yet started.
    pub(crate) fn push_urgent(&mut self, packet: Packet) {
        let at = usize::from(self.queue.front().is_some_and(|out| out.sent > 0));
        self.queue.insert(at, Outbound { packet, sent: 0 });
    }

    /// Put a packet whose first `sent` bytes were written out of band at
    /// the head of the queue. Only valid while nothing is mid-write.
    pub(crate) fn push_resumed(&mut self, packet: Packet, sent: usize) {
        debug_assert!(!self.is_writing());
        self.queue.push_front(Outbound { packet, sent });
    }

    fn take(&mut self) -> Option<Outbound> {
        let out = self.queue.pop_front()?;
        self.in_flight = Some(out.packet.sid());
        Some(out)
    }

    fn restore(&mut self, out: Outbound) {
        self.in_flight = None;
        self.queue.push_front(out);
    }

    fn complete(&mut self) {
        self.in_flight = None;
    }

    /// Whether a packet is partially on the wire.
    pub(crate) fn is_writing(&self) -> bool {
        self.in_flight.is_some() || self.queue.front().is_some_and(|out| out.sent > 0)
    }

    pub(crate) fn pending_for(&self, sid: u16) -> bool {
        self.in_flight == Some(sid) || self.queue.iter().any(|out| out.packet.sid() == sid)
    }

    fn drain(&mut self) -> impl Iterator<Item = Packet> + '_ {
        self.in_flight = None;
        self.queue.drain(..).map(|out| out.packet)
    }
}

/// Everything guarded by the connection mutex.
#[derive(Debug)]
pub(crate) struct ConnState {
    pub(crate) pool: PacketPool,
    pub(crate) outbound: OutboundQueue,
    pub(crate) inbound: VecDeque<Packet>,
    pub(crate) sessions: SessionRegistry,
    pub(crate) net_owner: Option<u16>,
    /// Bumped by the owner on every read or write that moved bytes.
    progress: u64,
    /// Partially read frame, parked here between owners.
    reader: Option<PacketReader>,
    pub(crate) dead: bool,
}

pub(crate) struct Shared<T> {
    pub(crate) transport: T,
    pub(crate) config: TransportConfig,
    hook: Arc<dyn ErrorHook>,
    pub(crate) state: Mutex<ConnState>,
}

/// A physical TDS connection shared by one or more sessions.
///
/// Cloning is cheap and yields another handle to the same connection.
///
/// # Example
///
/// ```rust,no_run
/// use std::net::TcpStream;
/// use tds_transport::{Connection, TransportConfig};
/// use tds_protocol::PacketType;
///
/// # fn main() -> Result<(), tds_transport::TransportError> {
/// let stream = TcpStream::connect("localhost:1433")?;
/// let conn = Connection::new(stream, TransportConfig::new().mars(true))?;
///
/// let mut session = conn.open_session()?;
/// session.set_packet_type(PacketType::SqlBatch);
/// session.put_utf16("SELECT 1")?;
/// session.flush(true)?;
///
/// let reply = session.read_packet()?;
/// println!("{} bytes of {:?}", reply.payload.len(), reply.packet_type());
/// # Ok(())
/// # }
/// ```
pub struct Connection<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for Connection<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Transport> std::fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Connection<T> {
    /// Wrap an established transport. Timeouts abort the connection.
    pub fn new(transport: T, config: TransportConfig) -> Result<Self> {
        Self::with_error_hook(transport, config, Arc::new(DefaultErrorHook))
    }

    /// Wrap an established transport with a custom error hook.
    pub fn with_error_hook(
        transport: T,
        config: TransportConfig,
        hook: Arc<dyn ErrorHook>,
    ) -> Result<Self> {
        config.validate()?;
        transport.set_read_timeout(Some(config.poll_interval))?;
        transport.set_write_timeout(Some(config.poll_interval))?;

        let state = ConnState {
            pool: PacketPool::new(config.packet_cache_size),
            outbound: OutboundQueue::default(),
            inbound: VecDeque::new(),
            sessions: SessionRegistry::default(),
            net_owner: None,
            progress: 0,
            reader: Some(PacketReader::new(config.mars, config.buffer_capacity())),
            dead: false,
        };

        tracing::debug!(
            mars = config.mars,
            packet_size = config.packet_size,
            "TDS transport ready"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                transport,
                config,
                hook,
                state: Mutex::new(state),
            }),
        })
    }

    /// Open a session.
    ///
    /// Plain connections carry exactly one session (sid 0). Under MARS the
    /// lowest free identifier is used and nothing is sent until the first
    /// packet, which is preceded by a SYN.
    pub fn open_session(&self) -> Result<Session<T>> {
        let mut st = self.shared.state.lock();
        if st.dead {
            return Err(TransportError::ConnectionClosed);
        }

        let waker = Arc::new(Condvar::new());
        let mut state = SessionState::new(Arc::clone(&waker), self.shared.config.initial_window);
        if !self.shared.config.mars {
            if st.sessions.is_open(0) {
                return Err(TransportError::Usage(
                    "a plain connection carries a single session",
                ));
            }
            state.phase = SessionPhase::Active;
        }
        let sid = st.sessions.allocate(state)?;
        drop(st);

        tracing::debug!(sid, mars = self.shared.config.mars, "opened session");
        Ok(Session::new(Arc::clone(&self.shared), sid, waker))
    }

    /// Tear the connection down. Every blocked or later operation fails
    /// with [`TransportError::ConnectionClosed`].
    pub fn close(&self) {
        let mut st = self.shared.state.lock();
        if !st.dead {
            tracing::debug!("closing TDS connection");
            self.shared.teardown(&mut st);
        }
    }

    /// Whether the connection has been torn down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().dead
    }

    /// Settings this connection runs with.
    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    /// Number of idle packet buffers held for reuse.
    #[must_use]
    pub fn cached_packets(&self) -> usize {
        self.shared.state.lock().pool.len()
    }
}

impl<T: Transport> Shared<T> {
    pub(crate) fn acquire(&self, capacity: usize) -> Result<Packet> {
        let mut st = self.state.lock();
        if st.dead {
            return Err(TransportError::ConnectionClosed);
        }
        st.pool.acquire(capacity)
    }

    pub(crate) fn recycle(&self, packets: Vec<Packet>) {
        if !packets.is_empty() {
            self.state.lock().pool.release_all(packets);
        }
    }

    /// Mark the connection dead and report `err` to the hook.
    ///
    /// Once the connection is dead every failure surfaces as
    /// [`TransportError::ConnectionClosed`].
    pub(crate) fn fail(&self, st: &mut ConnState, err: TransportError) -> TransportError {
        if st.dead {
            return TransportError::ConnectionClosed;
        }
        tracing::error!(error = %err, "closing TDS connection");
        self.teardown(st);
        self.hook.on_error(&err);
        err
    }

    pub(crate) fn teardown(&self, st: &mut ConnState) {
        st.dead = true;
        if let Err(err) = self.transport.shutdown() {
            tracing::debug!(error = %err, "transport shutdown failed");
        }
        let queued: Vec<Packet> = st.outbound.drain().chain(st.inbound.drain(..)).collect();
        st.pool.release_all(queued);
        st.sessions.notify_all();
    }

    /// Send one finished packet for `sid`, blocking until it is on the wire.
    pub(crate) fn put_packet(&self, sid: u16, waker: &Condvar, mut packet: Packet) -> Result<()> {
        packet.set_sid(sid);
        let mut st = self.state.lock();
        let mut since = Instant::now();
        let mut pending = packet;
        loop {
            if st.dead {
                st.pool.release(pending);
                return Err(TransportError::ConnectionClosed);
            }
            match self.enqueue(&mut st, sid, pending)? {
                None => break,
                Some(packet) => pending = packet,
            }

            let step = if st.net_owner.is_none() {
                self.drive(&mut st, sid, Operation::Window, |s| window_open(s, sid))
            } else {
                self.wait(&mut st, waker, sid, Operation::Window, &mut since)
            };
            if let Err(err) = step {
                st.pool.release(pending);
                return Err(err);
            }
        }
        self.wait_sent(&mut st, sid, waker)
    }

    /// Queue `packet`, or hand it back if the send window is closed.
    fn enqueue(&self, st: &mut ConnState, sid: u16, mut packet: Packet) -> Result<Option<Packet>> {
        if !self.config.mars {
            st.outbound.push_back(packet);
            return Ok(None);
        }

        let ConnState {
            sessions,
            pool,
            outbound,
            ..
        } = st;
        let session = match sessions.get_mut(sid) {
            Some(session) if session.phase != SessionPhase::Closed => session,
            _ => {
                pool.release(packet);
                return Err(TransportError::SessionClosed { sid });
            }
        };
        if !session.can_send() {
            return Ok(Some(packet));
        }

        if session.phase == SessionPhase::Idle {
            match mux::control_packet(pool, session.syn_header(sid)) {
                Ok(syn) => outbound.push_back(syn),
                Err(err) => {
                    pool.release(packet);
                    return Err(err);
                }
            }
            session.phase = SessionPhase::SynSent;
            tracing::debug!(sid, "queued SYN");
        }

        session.stamp_data(sid, &mut packet);
        tracing::trace!(
            sid,
            seq = session.send_seq,
            length = packet.data_len(),
            "queued DATA frame"
        );
        outbound.push_back(packet);
        Ok(None)
    }

    /// Block until nothing queued for `sid` remains.
    pub(crate) fn wait_sent(
        &self,
        st: &mut MutexGuard<'_, ConnState>,
        sid: u16,
        waker: &Condvar,
    ) -> Result<()> {
        let mut since = Instant::now();
        loop {
            if st.dead {
                return Err(TransportError::ConnectionClosed);
            }
            if !st.outbound.pending_for(sid) {
                return Ok(());
            }
            if st.net_owner.is_none() {
                self.drive(st, sid, Operation::Send, |s| !s.outbound.pending_for(sid))?;
            } else {
                self.wait(st, waker, sid, Operation::Send, &mut since)?;
            }
        }
    }

    /// Block until a packet for `sid` arrives.
    pub(crate) fn read_packet(&self, sid: u16, waker: &Condvar) -> Result<PacketView> {
        let mut st = self.state.lock();
        let mut since = Instant::now();
        loop {
            if st.dead {
                return Err(TransportError::ConnectionClosed);
            }
            if let Some(packet) = self.dequeue(&mut st, sid) {
                let view = PacketView::from_packet(&packet);
                st.pool.release(packet);
                return view;
            }
            if st.sessions.phase(sid) == SessionPhase::Closed {
                return Err(TransportError::SessionClosed { sid });
            }

            if st.net_owner.is_none() {
                self.drive(&mut st, sid, Operation::Receive, |s| {
                    has_inbound(s, sid) || s.sessions.phase(sid) == SessionPhase::Closed
                })?;
            } else {
                self.wait(&mut st, waker, sid, Operation::Receive, &mut since)?;
            }
        }
    }

    /// Pop the oldest packet for `sid`, queuing a window update if due.
    fn dequeue(&self, st: &mut ConnState, sid: u16) -> Option<Packet> {
        let index = st.inbound.iter().position(|packet| packet.sid() == sid)?;
        let packet = st.inbound.remove(index)?;
        if !self.config.mars {
            return Some(packet);
        }

        let ConnState {
            sessions,
            pool,
            outbound,
            ..
        } = st;
        if let Some(session) = sessions.get_mut(sid) {
            if session.needs_ack() {
                let ack = session.ack_header(sid);
                match mux::control_packet(pool, ack) {
                    Ok(frame) => {
                        outbound.push_back(frame);
                        session.recv_wnd = ack.wnd;
                        tracing::trace!(sid, wnd = ack.wnd, "queued ACK");
                    }
                    Err(err) => {
                        tracing::warn!(sid, error = %err, "could not queue ACK, retrying on next packet");
                    }
                }
            }
        }
        Some(packet)
    }

    /// Queue FIN for `sid` and retire it. With `wait`, block until the FIN
    /// has been written.
    pub(crate) fn close_session(&self, sid: u16, waker: &Condvar, wait: bool) -> Result<()> {
        let mut st = self.state.lock();
        if st.dead {
            return Err(TransportError::ConnectionClosed);
        }

        let state = &mut *st;
        let (stale, kept): (Vec<Packet>, Vec<Packet>) =
            state.inbound.drain(..).partition(|packet| packet.sid() == sid);
        state.inbound = kept.into();
        state.pool.release_all(stale);

        if !self.config.mars {
            state.sessions.free(sid);
            tracing::debug!(sid, "closed session");
            return Ok(());
        }

        let Some(session) = state.sessions.get(sid) else {
            return Ok(());
        };
        if session.phase == SessionPhase::Idle {
            state.sessions.free(sid);
            tracing::debug!(sid, "released unused session");
            return Ok(());
        }

        let peer_closed = session.phase == SessionPhase::Closed;
        let fin = mux::control_packet(&mut state.pool, session.fin_header(sid))?;
        state.outbound.push_back(fin);
        if peer_closed {
            state.sessions.free(sid);
        } else {
            state.sessions.tombstone(sid);
        }
        tracing::debug!(sid, peer_closed, "queued FIN");

        if wait {
            self.wait_sent(&mut st, sid, waker)
        } else {
            Ok(())
        }
    }

    /// Sleep until woken or one poll slice passes, then check the timeout.
    /// Bytes moved by the owner in the meantime restart the clock.
    pub(crate) fn wait(
        &self,
        st: &mut MutexGuard<'_, ConnState>,
        waker: &Condvar,
        sid: u16,
        operation: Operation,
        since: &mut Instant,
    ) -> Result<()> {
        let seen = st.progress;
        waker.wait_for(st, self.config.poll_interval);
        if st.progress != seen {
            *since = Instant::now();
        }
        self.check_timeout(st, sid, operation, since)
    }

    /// Own the network until `done` holds or the connection fails.
    pub(crate) fn drive(
        &self,
        st: &mut MutexGuard<'_, ConnState>,
        sid: u16,
        operation: Operation,
        done: impl Fn(&ConnState) -> bool,
    ) -> Result<()> {
        st.net_owner = Some(sid);
        tracing::trace!(sid, ?operation, "took network ownership");
        let mut reader = st
            .reader
            .take()
            .unwrap_or_else(|| PacketReader::new(self.config.mars, self.config.buffer_capacity()));

        let result = self.pump(st, &mut reader, sid, operation, &done);

        st.reader = Some(reader);
        st.net_owner = None;
        st.sessions.notify_all();
        tracing::trace!(sid, "released network ownership");
        result
    }

    fn pump(
        &self,
        st: &mut MutexGuard<'_, ConnState>,
        reader: &mut PacketReader,
        sid: u16,
        operation: Operation,
        done: &dyn Fn(&ConnState) -> bool,
    ) -> Result<()> {
        let mut last_progress = Instant::now();
        loop {
            if st.dead {
                return Err(TransportError::ConnectionClosed);
            }
            if done(st) {
                return Ok(());
            }

            if let Some(mut out) = st.outbound.take() {
                let written = MutexGuard::unlocked(st, || {
                    self.transport.write(&out.packet.wire()[out.sent..])
                });
                match written {
                    Ok(0) => {
                        st.outbound.restore(out);
                        let err = io::Error::from(io::ErrorKind::WriteZero);
                        return Err(self.fail(st, err.into()));
                    }
                    Ok(n) => {
                        last_progress = Instant::now();
                        st.progress = st.progress.wrapping_add(1);
                        out.sent += n;
                        if out.sent < out.packet.wire().len() {
                            st.outbound.restore(out);
                            continue;
                        }
                        st.outbound.complete();
                        let owner = out.packet.sid();
                        tracing::trace!(sid = owner, length = out.sent, "sent packet");
                        st.pool.release(out.packet);
                        st.sessions.notify(owner);
                    }
                    Err(err) if is_retryable(&err) => {
                        // The peer may have stopped reading until we take
                        // what it is sending.
                        st.outbound.restore(out);
                        while self.read_step(st, reader, sid, operation, &mut last_progress)? {}
                    }
                    Err(err) => {
                        st.outbound.restore(out);
                        return Err(self.fail(st, err.into()));
                    }
                }
                continue;
            }

            self.read_step(st, reader, sid, operation, &mut last_progress)?;
        }
    }

    /// Read whatever one poll slice yields and dispatch a completed frame.
    /// Returns whether any bytes arrived.
    fn read_step(
        &self,
        st: &mut MutexGuard<'_, ConnState>,
        reader: &mut PacketReader,
        sid: u16,
        operation: Operation,
        last_progress: &mut Instant,
    ) -> Result<bool> {
        if let Err(err) = reader.prepare(&mut st.pool) {
            return Err(if reader.in_progress() {
                self.fail(st, err)
            } else {
                err
            });
        }
        let read = MutexGuard::unlocked(st, || reader.fill(&self.transport));
        match read {
            Ok(0) => Err(self.fail(st, TransportError::ConnectionClosed)),
            Ok(n) => {
                *last_progress = Instant::now();
                st.progress = st.progress.wrapping_add(1);
                match reader.advance(n) {
                    Ok(Some(frame)) => self.dispatch(st, frame)?,
                    Ok(None) => {}
                    Err(err) => return Err(self.fail(st, err)),
                }
                Ok(true)
            }
            Err(err) if is_retryable(&err) => {
                self.check_timeout(st, sid, operation, last_progress)?;
                Ok(false)
            }
            Err(err) => Err(self.fail(st, err.into())),
        }
    }

    /// Route a received frame to its session.
    fn dispatch(&self, st: &mut ConnState, frame: Frame) -> Result<()> {
        match frame {
            Frame::Packet(mut packet) => {
                packet.set_sid(0);
                if st.sessions.is_open(0) {
                    st.inbound.push_back(packet);
                    st.sessions.notify(0);
                } else {
                    tracing::warn!("dropping packet for a session that is not open");
                    st.pool.release(packet);
                }
                Ok(())
            }
            Frame::Control(header) => match st.sessions.handle_inbound(&header) {
                Ok(dispatch) => {
                    tracing::trace!(sid = header.sid, ?dispatch, wnd = header.wnd, "SMP control frame");
                    st.sessions.notify(header.sid);
                    Ok(())
                }
                Err(err) => Err(self.fail(st, err)),
            },
            Frame::Data { header, packet } => match st.sessions.handle_inbound(&header) {
                Ok(_) => {
                    st.inbound.push_back(packet);
                    st.sessions.notify(header.sid);
                    Ok(())
                }
                Err(err) => {
                    st.pool.release(packet);
                    Err(self.fail(st, err))
                }
            },
        }
    }

    fn check_timeout(
        &self,
        st: &mut MutexGuard<'_, ConnState>,
        sid: u16,
        operation: Operation,
        since: &mut Instant,
    ) -> Result<()> {
        let Some(limit) = self.config.query_timeout else {
            return Ok(());
        };
        let elapsed = since.elapsed();
        if elapsed < limit {
            return Ok(());
        }

        tracing::warn!(
            sid,
            ?operation,
            elapsed_ms = elapsed.as_millis() as u64,
            "no progress within the query timeout"
        );
        let ctx = TimeoutContext {
            sid,
            operation,
            elapsed,
        };
        match MutexGuard::unlocked(st, || self.hook.on_timeout(&ctx)) {
            TimeoutAction::Continue => {
                *since = Instant::now();
                Ok(())
            }
            TimeoutAction::Abort => Err(self.fail(st, TransportError::Timeout { sid, elapsed })),
        }
    }
}

fn window_open(st: &ConnState, sid: u16) -> bool {
    st.sessions
        .get(sid)
        .is_none_or(|session| session.can_send() || session.phase == SessionPhase::Closed)
}

fn has_inbound(st: &ConnState, sid: u16) -> bool {
    st.inbound.iter().any(|packet| packet.sid() == sid)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn packet(sid: u16) -> Packet {
        let mut packet = Packet::allocate(8).unwrap();
        packet.set_layout(0, 8);
        packet.set_sid(sid);
        packet
    }

    #[test]
    fn test_outbound_order_and_pending() {
        let mut queue = OutboundQueue::default();
        queue.push_back(packet(1));
        queue.push_back(packet(2));
        assert!(queue.pending_for(2));
        assert!(!queue.pending_for(3));

        let first = queue.take().unwrap();
        assert_eq!(first.packet.sid(), 1);
        assert!(queue.pending_for(1));
        assert!(queue.is_writing());
        queue.complete();
        assert!(!queue.pending_for(1));
        assert!(!queue.is_writing());
    }

    #[test]
    fn test_urgent_never_splits_a_partial_write() {
        let mut queue = OutboundQueue::default();
        queue.push_back(packet(1));
        queue.push_back(packet(1));
        let mut out = queue.take().unwrap();
        out.sent = 3;
        queue.restore(out);
        assert!(queue.is_writing());

        queue.push_urgent(packet(9));
        let order: Vec<u16> = queue.drain().map(|p| p.sid()).collect();
        assert_eq!(order, vec![1, 9, 1]);
    }

    #[test]
    fn test_resumed_packet_is_finished_first() {
        let mut queue = OutboundQueue::default();
        queue.push_back(packet(1));
        queue.push_resumed(packet(0), 5);
        assert!(queue.is_writing());
        assert!(queue.pending_for(0));

        let out = queue.take().unwrap();
        assert_eq!((out.packet.sid(), out.sent), (0, 5));
    }

    #[test]
    fn test_urgent_goes_first_when_idle() {
        let mut queue = OutboundQueue::default();
        queue.push_back(packet(1));
        queue.push_urgent(packet(9));
        assert_eq!(queue.take().unwrap().packet.sid(), 9);
    }
}
