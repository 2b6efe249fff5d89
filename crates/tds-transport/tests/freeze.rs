//! Deferred-length writes observed from the server side of a socket.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use proptest::prelude::*;
use tds_protocol::PacketType;
use tds_protocol::codec::Endian;
use tds_testing::{Message, PlainPeer, socket_pair};
use tds_transport::{Connection, Session, TransportConfig, TransportError};

use std::net::{Shutdown, TcpStream};
use std::time::{Duration, Instant};

const PACKET_SIZE: u16 = 512;
const CHUNK: usize = PACKET_SIZE as usize - 8;

fn connect() -> (Connection<TcpStream>, Session<TcpStream>, PlainPeer) {
    let (client, server) = socket_pair().unwrap();
    let peer = PlainPeer::silent(server);
    let conn = Connection::new(client, TransportConfig::new().packet_size(PACKET_SIZE)).unwrap();
    let mut session = conn.open_session().unwrap();
    session.set_packet_type(PacketType::SqlBatch);
    (conn, session, peer)
}

/// Close everything and return what the server received.
fn finish(conn: Connection<TcpStream>, session: Session<TcpStream>, peer: PlainPeer) -> Vec<Message> {
    drop(session);
    conn.close();
    peer.join().unwrap().messages(false)
}

// =============================================================================
// Nesting and boundaries
// =============================================================================

#[test]
fn test_nested_frames_patch_both_prefixes() {
    let (conn, mut session, peer) = connect();

    session.put_u8(0xD2).unwrap();
    let outer = session.freeze(4).unwrap();
    let inner = session.freeze(2).unwrap();
    session.put_u32(0x1234_5678, Endian::Little).unwrap();
    assert_eq!(session.freeze_bytes_written(&inner), 6);
    session.freeze_close(inner).unwrap();
    session.put_u16(0x4321, Endian::Big).unwrap();
    session.freeze_close(outer).unwrap();
    session.flush(true).unwrap();

    let messages = finish(conn, session, peer);
    assert_eq!(messages.len(), 1);
    assert_eq!(
        messages[0].payload,
        [0xD2, 8, 0, 0, 0, 4, 0, 0x78, 0x56, 0x34, 0x12, 0x43, 0x21]
    );
}

#[test]
fn test_frame_spanning_packets() {
    let (conn, mut session, peer) = connect();

    let frame = session.freeze(4).unwrap();
    session.put_bytes(&[0xAB; 2000]).unwrap();
    session.freeze_close(frame).unwrap();
    session.flush(true).unwrap();

    let messages = finish(conn, session, peer);
    let message = &messages[0];
    assert_eq!(message.packet_lengths, vec![512, 512, 512, 500]);
    assert_eq!(message.packet_ids, vec![1, 2, 3, 4]);
    assert_eq!(&message.payload[..4], &2000u32.to_le_bytes());
    assert!(message.payload[4..].iter().all(|&b| b == 0xAB));
}

#[test]
fn test_prefix_straddling_a_packet_boundary() {
    let (conn, mut session, peer) = connect();

    session.put_zeros(CHUNK - 1).unwrap();
    let frame = session.freeze(4).unwrap();
    session.put_bytes(b"xyz").unwrap();
    session.freeze_close(frame).unwrap();
    session.flush(true).unwrap();

    let messages = finish(conn, session, peer);
    let payload = &messages[0].payload;
    assert_eq!(messages[0].packet_lengths, vec![512, 14]);
    assert_eq!(&payload[CHUNK - 1..CHUNK + 3], &[3, 0, 0, 0]);
    assert_eq!(&payload[CHUNK + 3..], b"xyz");
}

#[test]
fn test_exactly_full_packet_sends_no_empty_follower() {
    let (conn, mut session, peer) = connect();

    let frame = session.freeze(2).unwrap();
    session.put_zeros(CHUNK - 2).unwrap();
    session.freeze_close(frame).unwrap();
    session.flush(true).unwrap();

    let messages = finish(conn, session, peer);
    assert_eq!(messages[0].packet_lengths, vec![512]);
    assert_eq!(&messages[0].payload[..2], &((CHUNK - 2) as u16).to_le_bytes());
}

#[test]
fn test_unit_count_prefix() {
    let (conn, mut session, peer) = connect();

    let frame = session.freeze(2).unwrap();
    session.put_utf16("héllo").unwrap();
    session.freeze_close_as_unit_count(frame, 2).unwrap();
    session.flush(true).unwrap();

    let messages = finish(conn, session, peer);
    assert_eq!(&messages[0].payload[..2], &[5, 0]);
    assert_eq!(messages[0].payload.len(), 12);
}

// =============================================================================
// Abort and misuse
// =============================================================================

#[test]
fn test_abort_discards_spanning_output() {
    let (conn, mut session, peer) = connect();

    session.put_u8(1).unwrap();
    let frame = session.freeze(2).unwrap();
    session.put_bytes(&[9; 1500]).unwrap();
    session.freeze_abort(frame).unwrap();
    assert_eq!(session.freeze_depth(), 0);
    session.put_u8(2).unwrap();
    session.flush(true).unwrap();

    let messages = finish(conn, session, peer);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].payload, [1, 2]);
    assert_eq!(messages[0].packet_lengths, vec![10]);
}

#[test]
fn test_length_too_large_for_prefix() {
    let (conn, mut session, peer) = connect();

    session.put_u8(7).unwrap();
    let frame = session.freeze(1).unwrap();
    session.put_bytes(b"abc").unwrap();
    let err = session.freeze_close_with_length(frame, 300).unwrap_err();
    assert!(matches!(err, TransportError::Usage(_)));
    assert_eq!(session.freeze_depth(), 0);
    session.flush(true).unwrap();

    let messages = finish(conn, session, peer);
    assert_eq!(messages[0].payload, [7]);
}

#[test]
fn test_flush_while_frozen_is_rejected() {
    let (conn, mut session, peer) = connect();

    let outer = session.freeze(4).unwrap();
    let inner = session.freeze(2).unwrap();
    assert!(matches!(session.flush(true), Err(TransportError::Usage(_))));
    assert!(matches!(session.freeze_close(outer), Err(TransportError::Usage(_))));
    session.freeze_close(inner).unwrap();
    assert_eq!(session.freeze_depth(), 1);

    let messages = finish(conn, session, peer);
    assert!(messages.is_empty());
}

#[test]
fn test_connection_closed_mid_freeze() {
    let (conn, mut session, peer) = connect();

    let frame = session.freeze(4).unwrap();
    session.put_bytes(&[1; 3000]).unwrap();
    conn.close();

    let result = session.freeze_close(frame);
    assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    assert!(conn.cached_packets() <= conn.config().packet_cache_size);

    drop(session);
    assert!(peer.join().unwrap().messages(false).is_empty());
}

#[test]
fn test_peer_shutdown_mid_freeze() {
    let (client, server) = socket_pair().unwrap();
    let conn = Connection::new(client, TransportConfig::new().packet_size(PACKET_SIZE)).unwrap();
    let mut session = conn.open_session().unwrap();
    session.set_packet_type(PacketType::SqlBatch);

    let frame = session.freeze(4).unwrap();
    session.put_bytes(&[1; 3000]).unwrap();
    server.shutdown(Shutdown::Both).unwrap();

    // Releasing the chain either hits the dead socket or, if the writes
    // still land in the send buffer, the reply read sees end of stream.
    let started = Instant::now();
    let result = session
        .freeze_close(frame)
        .and_then(|()| session.flush(true))
        .and_then(|()| session.read_packet().map(drop));
    assert!(result.is_err());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(conn.is_closed());
    assert!(matches!(session.read_packet(), Err(TransportError::ConnectionClosed)));
}

// =============================================================================
// Property tests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prefixed_chunks_arrive_intact(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..700), 0..6)
    ) {
        let (conn, mut session, peer) = connect();

        let outer = session.freeze(4).unwrap();
        for chunk in &chunks {
            let frame = session.freeze(2).unwrap();
            session.put_bytes(chunk).unwrap();
            session.freeze_close(frame).unwrap();
        }
        session.freeze_close(outer).unwrap();
        session.flush(true).unwrap();

        let mut body = Vec::new();
        for chunk in &chunks {
            body.extend_from_slice(&(chunk.len() as u16).to_le_bytes());
            body.extend_from_slice(chunk);
        }
        let mut expected = (body.len() as u32).to_le_bytes().to_vec();
        expected.extend(body);

        let messages = finish(conn, session, peer);
        prop_assert_eq!(messages.len(), 1);
        prop_assert_eq!(&messages[0].payload, &expected);
        prop_assert!(messages[0].packet_lengths.iter().all(|&len| len > 8 && len <= PACKET_SIZE));
    }
}
