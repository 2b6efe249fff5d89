#![no_main]

//! Random freeze/write/close sequences must never panic and must leave the
//! stream balanced once every frame is finished.

use std::io;
use std::time::Duration;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tds_transport::{Connection, FreezeFrame, Transport, TransportConfig};

struct Sink;

impl Transport for Sink {
    fn read(&self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::ErrorKind::WouldBlock.into())
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

#[derive(Debug, Arbitrary)]
enum Op {
    Write(u16),
    Freeze(u8),
    Close,
    CloseUnits,
    CloseWith(u32),
    Abort,
    Flush(bool),
}

fuzz_target!(|ops: Vec<Op>| {
    let Ok(conn) = Connection::new(Sink, TransportConfig::new().packet_size(512)) else {
        return;
    };
    let Ok(mut session) = conn.open_session() else {
        return;
    };
    let mut frames: Vec<FreezeFrame> = Vec::new();

    for op in ops {
        let _ = match op {
            Op::Write(len) => session.put_zeros(usize::from(len % 2048)),
            Op::Freeze(width) => session
                .freeze([0, 1, 2, 4][usize::from(width % 4)])
                .map(|frame| frames.push(frame)),
            Op::Close => frames.pop().map_or(Ok(()), |f| session.freeze_close(f)),
            Op::CloseUnits => frames
                .pop()
                .map_or(Ok(()), |f| session.freeze_close_as_unit_count(f, 2)),
            Op::CloseWith(len) => frames
                .pop()
                .map_or(Ok(()), |f| session.freeze_close_with_length(f, len)),
            Op::Abort => frames.pop().map_or(Ok(()), |f| session.freeze_abort(f)),
            Op::Flush(last) => session.flush(last),
        };
        assert_eq!(session.freeze_depth(), frames.len());
    }
});
