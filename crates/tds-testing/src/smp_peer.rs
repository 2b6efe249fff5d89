//! Server stand-in for MARS connections.
//!
//! [`SmpPeer`] speaks the SMP layer from the server side: it accepts SYN,
//! grants windows with ACKs, checks that the client never sends past the
//! window it was given, echoes completed messages within the client's
//! window and answers FIN with FIN.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::Write;
use std::net::TcpStream;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use tds_protocol::codec::seq_diff;
use tds_protocol::{PacketType, SMP_HEADER_SIZE, SmpHeader, SmpType};

use crate::peer::{PeerError, Result, attention_ack, parse_packet, read_full, split_message};
use crate::recorder::{Message, Reassembler};

/// Behaviour of an [`SmpPeer`].
#[derive(Debug, Clone, Copy)]
pub struct PeerConfig {
    /// Send an ACK after this many DATA frames.
    pub ack_every: u32,
    /// Frames granted past the last one received.
    pub grant: u32,
    /// Window the client starts with before any ACK.
    pub initial_window: u32,
    /// Echo each message back as a tabular result.
    pub echo: bool,
    /// Packet size used for replies.
    pub packet_size: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ack_every: 2,
            grant: 4,
            initial_window: 4,
            echo: true,
            packet_size: 4096,
        }
    }
}

impl PeerConfig {
    /// Set the ACK cadence.
    #[must_use]
    pub fn ack_every(mut self, frames: u32) -> Self {
        self.ack_every = frames.max(1);
        self
    }

    /// Set the window grant.
    #[must_use]
    pub fn grant(mut self, frames: u32) -> Self {
        self.grant = frames;
        self
    }

    /// Enable or disable echoing.
    #[must_use]
    pub fn echo(mut self, enabled: bool) -> Self {
        self.echo = enabled;
        self
    }

    /// Set the reply packet size.
    #[must_use]
    pub fn packet_size(mut self, size: usize) -> Self {
        self.packet_size = size;
        self
    }
}

/// What the peer saw on one session.
#[derive(Debug, Clone, Default)]
pub struct SessionReport {
    /// Completed messages, in order.
    pub messages: Vec<Message>,
    /// Sequence numbers of DATA frames sent past the granted window.
    pub violations: Vec<u32>,
    /// DATA frames received.
    pub data_frames: u32,
    /// ACKs received from the client.
    pub acks_received: u32,
    /// ACKs sent to the client.
    pub acks_sent: u32,
    /// Whether the client closed the session.
    pub fin_received: bool,
}

/// Everything the peer saw, by session id.
#[derive(Debug, Clone, Default)]
pub struct PeerReport {
    /// Per-session reports. A reused session id appends to the same entry.
    pub sessions: BTreeMap<u16, SessionReport>,
}

impl PeerReport {
    /// Report for `sid`.
    #[must_use]
    pub fn session(&self, sid: u16) -> Option<&SessionReport> {
        self.sessions.get(&sid)
    }

    /// Window violations across every session.
    #[must_use]
    pub fn total_violations(&self) -> usize {
        self.sessions.values().map(|s| s.violations.len()).sum()
    }
}

#[derive(Debug)]
struct PeerSession {
    recv_seq: u32,
    /// Highest sequence number the client may send.
    advertised: u32,
    since_ack: u32,
    send_seq: u32,
    /// Highest sequence number we may send.
    client_wnd: u32,
    reassembler: Reassembler,
    /// Reply packets waiting for window.
    backlog: VecDeque<Vec<u8>>,
}

impl PeerSession {
    fn new(initial_window: u32, client_wnd: u32) -> Self {
        Self {
            recv_seq: 0,
            advertised: initial_window,
            since_ack: 0,
            send_seq: 0,
            client_wnd,
            reassembler: Reassembler::new(),
            backlog: VecDeque::new(),
        }
    }
}

/// MARS peer running on a background thread.
#[derive(Debug)]
pub struct SmpPeer {
    handle: JoinHandle<Result<PeerReport>>,
}

impl SmpPeer {
    /// Serve `stream` until the client disconnects.
    pub fn spawn(stream: TcpStream, config: PeerConfig) -> Self {
        let handle = thread::spawn(move || {
            let mut server = Server {
                stream,
                config,
                sessions: HashMap::new(),
                report: PeerReport::default(),
            };
            server.run()?;
            Ok(server.report)
        });
        Self { handle }
    }

    /// Wait for the client to disconnect and return the report.
    pub fn join(self) -> Result<PeerReport> {
        self.handle.join().map_err(|_| PeerError::Panicked)?
    }
}

struct Server {
    stream: TcpStream,
    config: PeerConfig,
    sessions: HashMap<u16, PeerSession>,
    report: PeerReport,
}

impl Server {
    fn run(&mut self) -> Result<()> {
        while let Some((header, body)) = self.read_frame()? {
            let sid = header.sid;
            if header.smp_type == SmpType::Syn {
                if self.sessions.contains_key(&sid) {
                    return Err(PeerError::Protocol(format!("duplicate SYN for session {sid}")));
                }
                tracing::debug!(sid, wnd = header.wnd, "peer accepted session");
                self.sessions
                    .insert(sid, PeerSession::new(self.config.initial_window, header.wnd));
                self.report.sessions.entry(sid).or_default();
                continue;
            }

            let Some(session) = self.sessions.get_mut(&sid) else {
                return Err(PeerError::Protocol(format!(
                    "{:?} frame for unknown session {sid}",
                    header.smp_type
                )));
            };
            session.client_wnd = header.wnd;

            match header.smp_type {
                SmpType::Ack => {
                    self.report.sessions.entry(sid).or_default().acks_received += 1;
                }
                SmpType::Fin => {
                    self.report.sessions.entry(sid).or_default().fin_received = true;
                    let session = self.sessions.remove(&sid);
                    let (seq, wnd) = session.map_or((0, 0), |s| (s.send_seq, s.advertised));
                    write_control(&mut self.stream, SmpType::Fin, sid, seq, wnd)?;
                    tracing::debug!(sid, "peer closed session");
                    continue;
                }
                SmpType::Data => self.on_data(header, body)?,
                SmpType::Syn => {}
            }
            self.flush_backlog(sid)?;
        }
        tracing::debug!("client disconnected");
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<(SmpHeader, Bytes)>> {
        let mut head = [0u8; SMP_HEADER_SIZE];
        if !read_full(&mut self.stream, &mut head)? {
            return Ok(None);
        }
        let header = SmpHeader::decode(&mut &head[..])
            .map_err(|err| PeerError::Protocol(err.to_string()))?;
        if !header.has_valid_size() {
            return Err(PeerError::Protocol(format!(
                "{:?} frame with size {}",
                header.smp_type, header.size
            )));
        }

        let mut body = vec![0u8; header.payload_length()];
        if !read_full(&mut self.stream, &mut body)? {
            return Err(PeerError::Protocol("stream ended inside a frame".into()));
        }
        Ok(Some((header, body.into())))
    }

    fn on_data(&mut self, header: SmpHeader, body: Bytes) -> Result<()> {
        let sid = header.sid;
        let packet = parse_packet(body)?;
        let report = self.report.sessions.entry(sid).or_default();
        let Some(session) = self.sessions.get_mut(&sid) else {
            return Ok(());
        };

        report.data_frames += 1;
        if seq_diff(header.seq, session.advertised) > 0 {
            tracing::warn!(sid, seq = header.seq, wnd = session.advertised, "client overran window");
            report.violations.push(header.seq);
        }
        session.recv_seq = header.seq;
        session.since_ack += 1;

        if session.since_ack >= self.config.ack_every || seq_diff(header.seq, session.advertised) >= 0 {
            session.advertised = session.recv_seq.wrapping_add(self.config.grant);
            session.since_ack = 0;
            report.acks_sent += 1;
            write_control(
                &mut self.stream,
                SmpType::Ack,
                sid,
                session.send_seq,
                session.advertised,
            )?;
        }

        if let Some(message) = session.reassembler.push(&packet.header, packet.payload()) {
            if message.packet_type == PacketType::Attention {
                session.backlog.push_back(attention_ack());
            } else if self.config.echo {
                session.backlog.extend(split_message(
                    PacketType::TabularResult,
                    &message.payload,
                    self.config.packet_size,
                ));
            }
            report.messages.push(message);
        }
        Ok(())
    }

    /// Send queued replies the client's window allows.
    fn flush_backlog(&mut self, sid: u16) -> Result<()> {
        let Some(session) = self.sessions.get_mut(&sid) else {
            return Ok(());
        };
        while seq_diff(session.send_seq, session.client_wnd) < 0 {
            let Some(packet) = session.backlog.pop_front() else {
                break;
            };
            session.send_seq = session.send_seq.wrapping_add(1);
            let header = SmpHeader::new(
                SmpType::Data,
                sid,
                (SMP_HEADER_SIZE + packet.len()) as u32,
                session.send_seq,
                session.advertised,
            );
            let mut frame = Vec::with_capacity(SMP_HEADER_SIZE + packet.len());
            header.encode(&mut frame);
            frame.extend_from_slice(&packet);
            self.stream.write_all(&frame)?;
        }
        Ok(())
    }
}

fn write_control(stream: &mut TcpStream, smp_type: SmpType, sid: u16, seq: u32, wnd: u32) -> Result<()> {
    let mut raw = [0u8; SMP_HEADER_SIZE];
    SmpHeader::control(smp_type, sid, seq, wnd).encode_into(&mut raw);
    stream.write_all(&raw)?;
    Ok(())
}
