//! Attention signalling on plain connections.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::thread;
use std::time::Duration;

use tds_protocol::PacketType;
use tds_testing::{PlainPeer, attention_ack, socket_pair};
use tds_transport::{Connection, TransportConfig, TransportError};

#[test]
fn test_cancel_from_another_thread() {
    let (client, server) = socket_pair().unwrap();
    let peer = PlainPeer::spawn(server, |packet| {
        if packet.header.packet_type == PacketType::Attention {
            vec![attention_ack()]
        } else {
            Vec::new()
        }
    });
    let conn = Connection::new(client, TransportConfig::new()).unwrap();
    let mut session = conn.open_session().unwrap();

    session.set_packet_type(PacketType::SqlBatch);
    session.put_utf16("WAITFOR DELAY '01:00:00'").unwrap();
    session.flush(true).unwrap();

    let cancel = session.cancel_handle();
    assert_eq!(cancel.sid(), 0);
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        cancel.cancel()
    });

    // Blocks as network owner until the attention acknowledgement arrives.
    let reply = session.read_packet().unwrap();
    canceller.join().unwrap().unwrap();
    assert_eq!(reply.packet_type(), PacketType::TabularResult);
    assert!(reply.is_end_of_message());
    assert_eq!(&reply.payload[..5], &[0xFD, 0x20, 0x00, 0x00, 0x00]);

    drop(session);
    conn.close();
    let recorder = peer.join().unwrap();
    let sent: Vec<_> = recorder.client_packets().collect();
    assert_eq!(sent.len(), 2);
    assert_eq!(&sent[1][..], &[0x06, 0x01, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00]);
}

#[test]
fn test_cancel_between_requests() {
    let (client, server) = socket_pair().unwrap();
    let peer = PlainPeer::echo(server, 4096);
    let conn = Connection::new(client, TransportConfig::new()).unwrap();
    let mut session = conn.open_session().unwrap();

    session.cancel_handle().cancel().unwrap();
    let reply = session.read_packet().unwrap();
    assert_eq!(reply.payload[0], 0xFD);

    session.put_bytes(b"after").unwrap();
    session.flush(true).unwrap();
    assert_eq!(&session.read_packet().unwrap().payload[..], b"after");

    drop(session);
    conn.close();
    let messages = peer.join().unwrap().messages(false);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].packet_type, PacketType::Attention);
}

#[test]
fn test_cancel_on_closed_connection() {
    let (client, _server) = socket_pair().unwrap();
    let conn = Connection::new(client, TransportConfig::new()).unwrap();
    let session = conn.open_session().unwrap();
    let cancel = session.cancel_handle();

    conn.close();
    assert!(matches!(cancel.cancel(), Err(TransportError::ConnectionClosed)));
}

#[test]
fn test_single_session_without_mars() {
    let (client, _server) = socket_pair().unwrap();
    let conn = Connection::new(client, TransportConfig::new()).unwrap();

    let session = conn.open_session().unwrap();
    assert!(matches!(conn.open_session(), Err(TransportError::Usage(_))));
    drop(session);
    assert_eq!(conn.open_session().unwrap().sid(), 0);
}
