//! Byte-stream abstraction the network driver runs on.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

/// A full-duplex, thread-safe byte stream.
///
/// All methods take `&self`: the thread that owns the network reads and
/// writes through a shared reference while other threads (a cancel request,
/// for instance) may write concurrently. Reads must honour the timeout set
/// with [`Transport::set_read_timeout()`] by failing with
/// [`io::ErrorKind::WouldBlock`] or [`io::ErrorKind::TimedOut`].
pub trait Transport: Send + Sync + 'static {
    /// Read into `buf`, returning `Ok(0)` at end of stream.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write some prefix of `buf`, returning how much was taken.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Bound how long a single read may block.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Bound how long a single write may block.
    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Shut both directions down, waking any blocked reader.
    fn shutdown(&self) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(&mut &*self, buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        Write::write(&mut &*self, buf)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

#[cfg(unix)]
impl Transport for std::os::unix::net::UnixStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(&mut &*self, buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        Write::write(&mut &*self, buf)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_write_timeout(self, timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        std::os::unix::net::UnixStream::shutdown(self, Shutdown::Both)
    }
}

/// Whether an IO error only means "nothing happened within the slice".
pub(crate) fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}
