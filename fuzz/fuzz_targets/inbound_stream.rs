#![no_main]

//! Feed arbitrary server bytes through the framer and session dispatch.

use std::io;
use std::sync::Mutex;
use std::time::Duration;

use libfuzzer_sys::fuzz_target;
use tds_transport::{Connection, Transport, TransportConfig};

/// Serves a fixed byte string, then end of stream. Writes are discarded.
struct Replay {
    input: Mutex<(Vec<u8>, usize)>,
}

impl Transport for Replay {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut guard = self.input.lock().map_err(|_| io::Error::other("poisoned"))?;
        let (data, pos) = &mut *guard;
        let n = buf.len().min(data.len() - *pos).min(97);
        buf[..n].copy_from_slice(&data[*pos..*pos + n]);
        *pos += n;
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn set_read_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }

    fn set_write_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }

    fn shutdown(&self) -> io::Result<()> {
        Ok(())
    }
}

fuzz_target!(|data: &[u8]| {
    let Some((&mode, rest)) = data.split_first() else {
        return;
    };
    let transport = Replay {
        input: Mutex::new((rest.to_vec(), 0)),
    };
    let config = TransportConfig::new().packet_size(512).mars(mode & 1 == 1);
    let Ok(conn) = Connection::new(transport, config) else {
        return;
    };
    let Ok(mut session) = conn.open_session() else {
        return;
    };

    if session.put_u8(mode).and_then(|()| session.flush(true)).is_err() {
        return;
    }
    while session.read_packet().is_ok() {}
});
