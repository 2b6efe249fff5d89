#![no_main]

use libfuzzer_sys::fuzz_target;
use tds_protocol::{PACKET_HEADER_SIZE, PacketHeader};

fuzz_target!(|data: &[u8]| {
    let mut cursor = data;
    if let Ok(header) = PacketHeader::decode(&mut cursor) {
        let mut raw = [0u8; PACKET_HEADER_SIZE];
        header.encode_into(&mut raw);
        assert_eq!(&raw[..], &data[..PACKET_HEADER_SIZE]);
        assert_eq!(PacketHeader::peek_length(data), Some(header.length));
    }
});
