//! Blocking server stand-in for plain (non-MARS) TDS connections.
//!
//! The peer runs on its own thread, reads whole packets from its end of a
//! socket pair and answers each one through a caller-supplied responder.
//! Every packet in either direction is recorded and handed back when the
//! client disconnects.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use tds_protocol::{PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType};
use thiserror::Error;

use crate::recorder::{PacketRecorder, Reassembler};

/// Error type for peer operations.
#[derive(Debug, Error)]
pub enum PeerError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The client broke the protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer thread panicked.
    #[error("peer thread panicked")]
    Panicked,
}

/// Result type for peer operations.
pub type Result<T> = std::result::Result<T, PeerError>;

/// One TDS packet as read off the wire.
#[derive(Debug, Clone)]
pub struct RawPacket {
    /// Decoded header.
    pub header: PacketHeader,
    /// Whole packet, header included.
    pub data: Bytes,
}

impl RawPacket {
    /// Bytes after the header.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.data[PACKET_HEADER_SIZE..]
    }
}

/// Connected loopback TCP pair: `(client, server)`.
pub fn socket_pair() -> io::Result<(TcpStream, TcpStream)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let client = TcpStream::connect(listener.local_addr()?)?;
    let (server, _) = listener.accept()?;
    client.set_nodelay(true)?;
    server.set_nodelay(true)?;
    Ok((client, server))
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}

/// Fill `buf` completely. `Ok(false)` means the stream ended before the
/// first byte.
pub(crate) fn read_full(stream: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) if filled == 0 && is_disconnect(&err) => return Ok(false),
            Err(err) => return Err(err.into()),
        }
    }
    Ok(true)
}

/// Parse a TDS packet held entirely in `data`.
pub(crate) fn parse_packet(data: Bytes) -> Result<RawPacket> {
    let header = PacketHeader::decode(&mut &data[..])
        .map_err(|err| PeerError::Protocol(err.to_string()))?;
    if usize::from(header.length) != data.len() {
        return Err(PeerError::Protocol(format!(
            "packet length {} does not match {} bytes received",
            header.length,
            data.len()
        )));
    }
    Ok(RawPacket { header, data })
}

/// Read one TDS packet, or `None` at end of stream.
pub fn read_packet(stream: &mut impl Read) -> Result<Option<RawPacket>> {
    let mut head = [0u8; PACKET_HEADER_SIZE];
    if !read_full(stream, &mut head)? {
        return Ok(None);
    }
    let length = PacketHeader::peek_length(&head).map_or(0, usize::from);
    if length < PACKET_HEADER_SIZE {
        return Err(PeerError::Protocol(format!("packet length {length} below header size")));
    }

    let mut data = vec![0u8; length];
    data[..PACKET_HEADER_SIZE].copy_from_slice(&head);
    if !read_full(stream, &mut data[PACKET_HEADER_SIZE..])? {
        return Err(PeerError::Protocol("stream ended inside a packet".into()));
    }
    parse_packet(data.into()).map(Some)
}

/// Encode one packet.
#[must_use]
pub fn encode_packet(
    packet_type: PacketType,
    status: PacketStatus,
    packet_id: u8,
    payload: &[u8],
) -> Vec<u8> {
    let length = (PACKET_HEADER_SIZE + payload.len()) as u16;
    let header = PacketHeader::new(packet_type, status, length).with_packet_id(packet_id);
    let mut out = vec![0u8; PACKET_HEADER_SIZE];
    header.encode(&mut &mut out[..]);
    out.extend_from_slice(payload);
    out
}

/// Split `payload` into packets of at most `packet_size` bytes.
///
/// An empty payload still yields one (end-of-message) packet.
#[must_use]
pub fn split_message(packet_type: PacketType, payload: &[u8], packet_size: usize) -> Vec<Vec<u8>> {
    let chunk = packet_size.saturating_sub(PACKET_HEADER_SIZE).max(1);
    let mut chunks: Vec<&[u8]> = payload.chunks(chunk).collect();
    if chunks.is_empty() {
        chunks.push(&[]);
    }

    let count = chunks.len();
    let mut packet_id = 0u8;
    chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| {
            packet_id = packet_id.wrapping_add(1).max(1);
            let status = if index + 1 == count {
                PacketStatus::END_OF_MESSAGE
            } else {
                PacketStatus::NORMAL
            };
            encode_packet(packet_type, status, packet_id, chunk)
        })
        .collect()
}

/// Tabular result holding a single DONE token with the attention
/// acknowledgement bit set.
#[must_use]
pub fn attention_ack() -> Vec<u8> {
    let mut done = vec![0xFD];
    done.extend_from_slice(&0x0020u16.to_le_bytes());
    done.extend_from_slice(&0u16.to_le_bytes());
    done.extend_from_slice(&0u64.to_le_bytes());
    encode_packet(
        PacketType::TabularResult,
        PacketStatus::END_OF_MESSAGE,
        1,
        &done,
    )
}

/// Plain TDS peer running on a background thread.
#[derive(Debug)]
pub struct PlainPeer {
    handle: JoinHandle<Result<PacketRecorder>>,
}

impl PlainPeer {
    /// Serve `stream`, answering each packet with the raw packets `respond`
    /// returns.
    pub fn spawn<F>(mut stream: TcpStream, mut respond: F) -> Self
    where
        F: FnMut(&RawPacket) -> Vec<Vec<u8>> + Send + 'static,
    {
        let handle = thread::spawn(move || {
            let mut recorder = PacketRecorder::new();
            while let Some(packet) = read_packet(&mut stream)? {
                tracing::trace!(
                    packet_type = ?packet.header.packet_type,
                    length = packet.header.length,
                    "peer received packet"
                );
                let replies = respond(&packet);
                recorder.record(false, packet.data);
                for reply in replies {
                    stream.write_all(&reply)?;
                    recorder.record(true, reply.into());
                }
            }
            tracing::debug!("client disconnected");
            Ok(recorder)
        });
        Self { handle }
    }

    /// Serve `stream`, echoing every complete message back as a tabular
    /// result and acknowledging attention signals.
    pub fn echo(stream: TcpStream, packet_size: usize) -> Self {
        let mut reassembler = Reassembler::new();
        Self::spawn(stream, move |packet| {
            if packet.header.packet_type == PacketType::Attention {
                return vec![attention_ack()];
            }
            match reassembler.push(&packet.header, packet.payload()) {
                Some(message) => {
                    split_message(PacketType::TabularResult, &message.payload, packet_size)
                }
                None => Vec::new(),
            }
        })
    }

    /// Serve `stream` without ever replying.
    pub fn silent(stream: TcpStream) -> Self {
        Self::spawn(stream, |_| Vec::new())
    }

    /// Wait for the client to disconnect and return the capture.
    pub fn join(self) -> Result<PacketRecorder> {
        self.handle.join().map_err(|_| PeerError::Panicked)?
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::recorder::strip_headers;

    #[test]
    fn test_split_message_sizes_and_ids() {
        let packets = split_message(PacketType::TabularResult, &[7u8; 20], 16);
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].len(), 16);
        assert_eq!(packets[2].len(), 12);
        assert_eq!(packets.iter().map(|p| p[6]).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(packets[1][1], 0x00);
        assert_eq!(packets[2][1], 0x01);
        assert_eq!(strip_headers(&packets.concat()).unwrap(), vec![7u8; 20]);
    }

    #[test]
    fn test_split_empty_message() {
        let packets = split_message(PacketType::TabularResult, &[], 512);
        assert_eq!(packets, vec![vec![0x04, 0x01, 0x00, 0x08, 0x00, 0x00, 0x01, 0x00]]);
    }

    #[test]
    fn test_read_packet_round_trip() {
        let raw = encode_packet(PacketType::Rpc, PacketStatus::END_OF_MESSAGE, 3, b"xyz");
        let mut cursor = io::Cursor::new(raw.clone());
        let packet = read_packet(&mut cursor).unwrap().unwrap();
        assert_eq!(packet.header.packet_type, PacketType::Rpc);
        assert_eq!(packet.payload(), b"xyz");
        assert_eq!(&packet.data[..], &raw[..]);
        assert!(read_packet(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_read_packet_truncated() {
        let raw = encode_packet(PacketType::Rpc, PacketStatus::END_OF_MESSAGE, 1, b"xyz");
        let mut cursor = io::Cursor::new(raw[..9].to_vec());
        assert!(read_packet(&mut cursor).is_err());
    }

    #[test]
    fn test_echo_peer_over_sockets() {
        let (mut client, server) = socket_pair().unwrap();
        let peer = PlainPeer::echo(server, 512);

        for packet in split_message(PacketType::SqlBatch, b"ping", 512) {
            client.write_all(&packet).unwrap();
        }
        let reply = read_packet(&mut client).unwrap().unwrap();
        assert_eq!(reply.header.packet_type, PacketType::TabularResult);
        assert_eq!(reply.payload(), b"ping");

        drop(client);
        let recorder = peer.join().unwrap();
        assert_eq!(recorder.messages(false)[0].payload, b"ping");
        assert_eq!(recorder.messages(true).len(), 1);
    }
}
