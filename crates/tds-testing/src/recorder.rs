//! Packet capture and message reassembly.

use bytes::Bytes;
use tds_protocol::{PACKET_HEADER_SIZE, PacketHeader, PacketType};

/// Recorded packet.
#[derive(Debug, Clone)]
pub struct RecordedPacket {
    /// Packet direction (true = server to client).
    pub from_server: bool,
    /// Raw packet data including header.
    pub data: Bytes,
}

/// A complete message rebuilt from its packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Type carried by the first packet.
    pub packet_type: PacketType,
    /// Concatenated payloads, headers stripped.
    pub payload: Vec<u8>,
    /// Header length field of every packet, in order.
    pub packet_lengths: Vec<u16>,
    /// Packet id of every packet, in order.
    pub packet_ids: Vec<u8>,
}

impl Message {
    fn start(header: &PacketHeader) -> Self {
        Self {
            packet_type: header.packet_type,
            payload: Vec::new(),
            packet_lengths: Vec::new(),
            packet_ids: Vec::new(),
        }
    }

    fn push(&mut self, header: &PacketHeader, payload: &[u8]) {
        self.payload.extend_from_slice(payload);
        self.packet_lengths.push(header.length);
        self.packet_ids.push(header.packet_id);
    }
}

/// Accumulates packets until an end-of-message packet completes a message.
#[derive(Debug, Default)]
pub struct Reassembler {
    partial: Option<Message>,
}

impl Reassembler {
    /// Create an empty reassembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one packet. Returns the finished message on end of message.
    pub fn push(&mut self, header: &PacketHeader, payload: &[u8]) -> Option<Message> {
        let message = self.partial.get_or_insert_with(|| Message::start(header));
        message.push(header, payload);
        if header.is_end_of_message() {
            self.partial.take()
        } else {
            None
        }
    }

    /// Whether a message is partially received.
    #[must_use]
    pub fn in_progress(&self) -> bool {
        self.partial.is_some()
    }
}

/// Packet recorder for capturing a plain TDS exchange.
#[derive(Debug, Default)]
pub struct PacketRecorder {
    packets: Vec<RecordedPacket>,
}

impl PacketRecorder {
    /// Create a new packet recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a packet.
    pub fn record(&mut self, from_server: bool, data: Bytes) {
        self.packets.push(RecordedPacket { from_server, data });
    }

    /// Get all recorded packets.
    pub fn packets(&self) -> &[RecordedPacket] {
        &self.packets
    }

    /// Packets sent by the client, in arrival order.
    pub fn client_packets(&self) -> impl Iterator<Item = &Bytes> {
        self.packets
            .iter()
            .filter(|packet| !packet.from_server)
            .map(|packet| &packet.data)
    }

    /// Rebuild the messages travelling in one direction.
    ///
    /// A trailing message without its end-of-message packet is left out.
    #[must_use]
    pub fn messages(&self, from_server: bool) -> Vec<Message> {
        let mut reassembler = Reassembler::new();
        self.packets
            .iter()
            .filter(|packet| packet.from_server == from_server)
            .filter_map(|packet| {
                let header = PacketHeader::decode(&mut &packet.data[..]).ok()?;
                reassembler.push(&header, packet.data.get(PACKET_HEADER_SIZE..)?)
            })
            .collect()
    }
}

/// Concatenate the payloads of back-to-back TDS packets in `raw`.
///
/// Returns `None` if a header is malformed or a packet is truncated.
#[must_use]
pub fn strip_headers(mut raw: &[u8]) -> Option<Vec<u8>> {
    let mut payload = Vec::with_capacity(raw.len());
    while !raw.is_empty() {
        let header = PacketHeader::decode(&mut &raw[..]).ok()?;
        let length = usize::from(header.length);
        if length < PACKET_HEADER_SIZE {
            return None;
        }
        payload.extend_from_slice(raw.get(PACKET_HEADER_SIZE..length)?);
        raw = &raw[length..];
    }
    Some(payload)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tds_protocol::PacketStatus;

    fn raw_packet(status: PacketStatus, id: u8, payload: &[u8]) -> Vec<u8> {
        let length = (PACKET_HEADER_SIZE + payload.len()) as u16;
        let header = PacketHeader::new(PacketType::SqlBatch, status, length).with_packet_id(id);
        let mut raw = [0u8; PACKET_HEADER_SIZE];
        header.encode_into(&mut raw);
        let mut out = raw.to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_strip_headers() {
        let mut raw = raw_packet(PacketStatus::NORMAL, 1, b"abc");
        raw.extend(raw_packet(PacketStatus::END_OF_MESSAGE, 2, b"de"));
        assert_eq!(strip_headers(&raw).unwrap(), b"abcde");
        assert!(strip_headers(&raw[..raw.len() - 1]).is_none());
    }

    #[test]
    fn test_recorder_reassembles_per_direction() {
        let mut recorder = PacketRecorder::new();
        recorder.record(false, raw_packet(PacketStatus::NORMAL, 1, b"he").into());
        recorder.record(true, raw_packet(PacketStatus::END_OF_MESSAGE, 1, b"ok").into());
        recorder.record(false, raw_packet(PacketStatus::END_OF_MESSAGE, 2, b"llo").into());
        recorder.record(false, raw_packet(PacketStatus::NORMAL, 1, b"tail").into());

        let sent = recorder.messages(false);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, b"hello");
        assert_eq!(sent[0].packet_ids, vec![1, 2]);
        assert_eq!(sent[0].packet_lengths, vec![10, 11]);
        assert_eq!(recorder.messages(true)[0].payload, b"ok");
        assert_eq!(recorder.client_packets().count(), 3);
    }
}
