//! Protocol Decoders
//!
//! A [`Codec`] turns the bytes accumulated in a connection's input buffer into
//! protocol messages. The connection calls it after every successful read:
//!
//! 1. The new bytes are appended to the input buffer
//! 2. `decode()` consumes every complete message from the front
//! 3. Incomplete trailing bytes stay in the buffer for the next read
//!
//! One codec instance is usually shared by every connection of a broker, so
//! per-connection decoding state belongs in the connection's context.

use crate::connection::TcpConn;
use bytes::BytesMut;
use tracing::trace;

/// Decoder invoked whenever new bytes arrive on a connection.
pub trait Codec: Send + Sync {
    /// Consumes zero or more complete messages from `input`.
    ///
    /// May call `conn.write()` and `conn.close()`. Must not call methods that
    /// lock the input buffer (such as `TcpConn::buffered_input`).
    fn decode(&self, conn: &TcpConn, input: &mut BytesMut);
}

/// Writes every received byte straight back to the sender.
///
/// Used by the `mqlink` server binary to exercise the connection layer.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoCodec;

impl Codec for EchoCodec {
    fn decode(&self, conn: &TcpConn, input: &mut BytesMut) {
        let data = input.split();
        trace!(peer = %conn, bytes = data.len(), "Echoing");
        conn.write(&data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::mock::{MockLoop, MockSocket};
    use crate::event::Ready;
    use std::sync::{Arc, Weak};

    #[test]
    fn test_echo_codec_writes_back() {
        let event_loop = MockLoop::new();
        let socket = MockSocket::new();
        let conn = TcpConn::new(
            event_loop.clone(),
            Weak::new(),
            socket.boxed(),
            Some(Arc::new(EchoCodec)),
        )
        .unwrap();

        socket.push_read(b"ping");
        socket.push_read(b"pong");
        event_loop.fire(conn.fd(), Ready::READABLE);

        assert_eq!(socket.written(), b"pingpong");
        assert_eq!(conn.buffered_input(), 0);
    }
}
