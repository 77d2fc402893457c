//! Socket-aware Byte Buffers
//!
//! Connections keep their pending input and output in [`BytesMut`]. This
//! module adds the three operations the connection needs on top of it:
//!
//! - `fill_from_socket`: one non-blocking read appended to the buffer
//! - `drain_to_socket`: write buffered bytes until empty or would-block
//! - `readable_bytes`: how many bytes are waiting
//!
//! ## Partial Data
//!
//! TCP is a stream protocol: one read may carry half a message or several.
//! The input buffer simply accumulates whatever arrives; the codec consumes
//! complete messages from the front and leaves the tail for the next read.

use crate::socket::Socket;
use bytes::{Buf, BytesMut};
use std::io;

/// Default number of bytes requested per read.
pub const DEFAULT_READ_HINT: usize = 4096;

/// Buffer operations that move bytes between a [`BytesMut`] and a [`Socket`].
pub trait SocketBuffer {
    /// Performs one read of up to `hint` bytes and appends the result.
    ///
    /// Returns the number of bytes appended; `Ok(0)` means end-of-stream.
    fn fill_from_socket(&mut self, socket: &dyn Socket, hint: usize) -> io::Result<usize>;

    /// Writes from the front of the buffer until it is empty or the socket
    /// would block. Written bytes are removed.
    ///
    /// Returns the number of bytes written (possibly 0).
    fn drain_to_socket(&mut self, socket: &dyn Socket) -> io::Result<usize>;

    fn readable_bytes(&self) -> usize;
}

impl SocketBuffer for BytesMut {
    fn fill_from_socket(&mut self, socket: &dyn Socket, hint: usize) -> io::Result<usize> {
        let start = self.len();
        self.resize(start + hint.max(1), 0);

        match socket.read(&mut self[start..]) {
            Ok(n) => {
                self.truncate(start + n);
                Ok(n)
            }
            Err(e) => {
                self.truncate(start);
                Err(e)
            }
        }
    }

    fn drain_to_socket(&mut self, socket: &dyn Socket) -> io::Result<usize> {
        let mut total = 0;

        while !self.is_empty() {
            match socket.write(&self[..]) {
                Ok(0) => break,
                Ok(n) => {
                    self.advance(n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        Ok(total)
    }

    fn readable_bytes(&self) -> usize {
        self.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::mock::MockSocket;

    #[test]
    fn test_fill_appends_after_existing_bytes() {
        let socket = MockSocket::new();
        socket.push_read(b"world");

        let mut buf = BytesMut::from(&b"hello "[..]);
        let n = buf.fill_from_socket(&socket, 64).unwrap();

        assert_eq!(n, 5);
        assert_eq!(&buf[..], b"hello world");
    }

    #[test]
    fn test_fill_respects_hint() {
        let socket = MockSocket::new();
        socket.push_read(b"abcdefgh");

        let mut buf = BytesMut::new();
        assert_eq!(buf.fill_from_socket(&socket, 3).unwrap(), 3);
        assert_eq!(buf.fill_from_socket(&socket, 3).unwrap(), 3);
        assert_eq!(buf.fill_from_socket(&socket, 3).unwrap(), 2);
        assert_eq!(&buf[..], b"abcdefgh");
    }

    #[test]
    fn test_fill_would_block_leaves_buffer_untouched() {
        let socket = MockSocket::new();
        let mut buf = BytesMut::from(&b"keep"[..]);

        let err = buf.fill_from_socket(&socket, 16).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(&buf[..], b"keep");
    }

    #[test]
    fn test_fill_eof() {
        let socket = MockSocket::new();
        socket.push_eof();

        let mut buf = BytesMut::new();
        assert_eq!(buf.fill_from_socket(&socket, 16).unwrap(), 0);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn test_drain_stops_at_would_block() {
        let socket = MockSocket::new();
        socket.set_write_budget(Some(4));

        let mut buf = BytesMut::from(&b"0123456789"[..]);
        assert_eq!(buf.drain_to_socket(&socket).unwrap(), 4);
        assert_eq!(&buf[..], b"456789");
        assert_eq!(socket.written(), b"0123");

        socket.set_write_budget(None);
        assert_eq!(buf.drain_to_socket(&socket).unwrap(), 6);
        assert!(buf.is_empty());
        assert_eq!(socket.written(), b"0123456789");
    }

    #[test]
    fn test_drain_error() {
        let socket = MockSocket::new();
        socket.fail_writes(io::ErrorKind::BrokenPipe);

        let mut buf = BytesMut::from(&b"data"[..]);
        let err = buf.drain_to_socket(&socket).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(buf.readable_bytes(), 4);
    }
}
