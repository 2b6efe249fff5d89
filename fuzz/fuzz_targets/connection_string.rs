#![no_main]

use libfuzzer_sys::fuzz_target;
use tds_transport::TransportConfig;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = TransportConfig::from_connection_string(s) {
            assert!(config.validate().is_ok());
        }
    }
});
