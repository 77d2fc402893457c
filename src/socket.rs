//! Socket Abstraction
//!
//! A thin, non-blocking view of a connected stream endpoint. Connections talk
//! to the OS only through this trait, which keeps the connection state machine
//! testable with scripted sockets.
//!
//! All methods take `&self`: reads and writes on a connected stream do not need
//! exclusive access, and the connection reads from one handler while writing
//! from another.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};

/// A connected, non-blocking stream socket.
///
/// `read` and `write` return `io::ErrorKind::WouldBlock` when the operation
/// cannot make progress right now; that is not an error. Dropping the socket
/// closes it.
pub trait Socket: Send + Sync {
    /// Descriptor used as the registration key in the event loop.
    fn raw_fd(&self) -> RawFd;

    /// Reads into `buf`. `Ok(0)` means the peer finished sending.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes as much of `buf` as the kernel accepts.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Shuts down both directions without releasing the descriptor.
    fn shutdown(&self) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Takes the pending socket error (`SO_ERROR`), if any.
    fn take_error(&self) -> io::Result<Option<io::Error>>;
}

impl Socket for mio::net::TcpStream {
    fn raw_fd(&self) -> RawFd {
        self.as_raw_fd()
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        <&mio::net::TcpStream as Read>::read(&mut &*self, buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        <&mio::net::TcpStream as Write>::write(&mut &*self, buf)
    }

    fn shutdown(&self) -> io::Result<()> {
        mio::net::TcpStream::shutdown(self, Shutdown::Both)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        mio::net::TcpStream::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        mio::net::TcpStream::peer_addr(self)
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        mio::net::TcpStream::take_error(self)
    }
}

/// Returns true for errors that only mean "try again on the next readiness".
pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
