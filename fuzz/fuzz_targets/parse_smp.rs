#![no_main]

use libfuzzer_sys::fuzz_target;
use tds_protocol::{SMP_HEADER_SIZE, SmpHeader, SmpType};

fuzz_target!(|data: &[u8]| {
    let mut cursor = data;
    if let Ok(header) = SmpHeader::decode(&mut cursor) {
        let mut raw = [0u8; SMP_HEADER_SIZE];
        header.encode_into(&mut raw);
        assert_eq!(&raw[..], &data[..SMP_HEADER_SIZE]);
        if header.has_valid_size() && header.smp_type != SmpType::Data {
            assert_eq!(header.payload_length(), 0);
        }
    }
});
