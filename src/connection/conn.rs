//! TCP Connection State Machine
//!
//! A [`TcpConn`] owns one accepted socket and drives it from readiness events
//! delivered by an [`EventLoop`]. It is a shared handle: cloning it (or calling
//! [`TcpConn::acquire`]) adds a reference, dropping it removes one, and the
//! connection is destroyed when the last reference goes away.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. new(): register read + error handlers
//!        │   (the registration holds one reference)
//!        ▼
//! 2. ┌──────────────── Connected ─────────────────┐
//!    │ readable  ─> fill in_buffer ─> codec       │
//!    │ write()   ─> socket, remainder buffered    │
//!    │ writable  ─> drain out_buffer              │
//!    └──────┬─────────────────────────────┬───────┘
//!           │ close() with output pending │ close()
//!           ▼                             │
//! 3. Disconnecting ── output drained ───> │
//!                                         ▼
//! 4. Disconnected: handlers unregistered, on_close fired,
//!    registration reference released
//!        │
//!        ▼
//! 5. last reference dropped: context cleanup, socket closed
//! ```
//!
//! ## Re-entrancy
//!
//! Every callback (codec, `on_write_complete`, `on_close`) may call back into
//! `write()` and `close()`. Handlers upgrade their weak reference before doing
//! any work, so a connection is never destroyed while one of its own handlers
//! is still running. No lock is held while an owner callback runs, except the
//! input buffer lock during `Codec::decode`.

use super::context::Context;
use super::stats::ConnectionStats;
use crate::buffer::{SocketBuffer, DEFAULT_READ_HINT};
use crate::codec::Codec;
use crate::event::{EventHandler, EventLoop, Ready};
use crate::server::IoGroup;
use crate::socket::{self, Socket};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, error, trace, warn};

/// Initial capacity of the input and output buffers
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Reads performed for one readiness event before yielding to other sockets
const MAX_READS_PER_EVENT: usize = 16;

/// Life-cycle state. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connected = 0,
    /// `close()` was requested while output was still buffered.
    Disconnecting = 1,
    Disconnected = 2,
}

impl From<u8> for ConnState {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnState::Connected,
            1 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

/// Called when the output buffer has been fully handed to the kernel.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConn) + Send + Sync>;

/// Called once when the connection reaches `Disconnected`.
pub type CloseCallback = Arc<dyn Fn(&TcpConn) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_write_complete: Option<WriteCompleteCallback>,
    on_close: Option<CloseCallback>,
}

struct Inner {
    socket: Box<dyn Socket>,
    event_loop: Arc<dyn EventLoop>,
    group: Weak<IoGroup>,
    codec: Option<Arc<dyn Codec>>,
    stats: Option<Arc<ConnectionStats>>,
    read_hint: usize,

    in_buffer: Mutex<BytesMut>,
    out_buffer: Mutex<BytesMut>,

    state: AtomicU8,
    is_writing: AtomicBool,

    read_handler: EventHandler,
    error_handler: EventHandler,
    write_handler: OnceLock<EventHandler>,

    context: Mutex<Option<Context>>,
    callbacks: Mutex<Callbacks>,

    /// The reference owned by the loop registration. Released by `close()`.
    registration: Mutex<Option<TcpConn>>,

    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Cleanup must see the connection's socket still open.
        self.context.get_mut().take();
        debug!(peer = %self.peer_addr, "Connection destroyed");
    }
}

/// Shared handle to one accepted TCP connection.
#[derive(Clone)]
pub struct TcpConn {
    inner: Arc<Inner>,
}

impl TcpConn {
    /// Wraps an accepted socket and registers it with `event_loop`.
    ///
    /// # Arguments
    ///
    /// * `event_loop` - The loop that will deliver readiness for this socket
    /// * `group` - The io group owning the loop (may be empty)
    /// * `socket` - The accepted, non-blocking socket
    /// * `codec` - Decoder invoked after every successful read
    ///
    /// # Errors
    ///
    /// Fails if the descriptor is invalid, the socket addresses cannot be
    /// read, or the loop refuses the registration. The socket is closed in
    /// every failure case.
    pub fn new(
        event_loop: Arc<dyn EventLoop>,
        group: Weak<IoGroup>,
        socket: Box<dyn Socket>,
        codec: Option<Arc<dyn Codec>>,
    ) -> Result<TcpConn, ConnectionError> {
        let fd = socket.raw_fd();
        if fd < 0 {
            return Err(ConnectionError::InvalidSocket(fd));
        }

        let local_addr = socket.local_addr().map_err(ConnectionError::Address)?;
        let peer_addr = socket.peer_addr().map_err(ConnectionError::Address)?;

        let (stats, read_hint) = match group.upgrade() {
            Some(group) => (Some(group.stats()), group.read_hint()),
            None => (None, DEFAULT_READ_HINT),
        };

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let on_readable = weak.clone();
            let on_error = weak.clone();

            Inner {
                socket,
                event_loop,
                group,
                codec,
                stats,
                read_hint,
                in_buffer: Mutex::new(BytesMut::with_capacity(INITIAL_BUFFER_SIZE)),
                out_buffer: Mutex::new(BytesMut::with_capacity(INITIAL_BUFFER_SIZE)),
                state: AtomicU8::new(ConnState::Connected as u8),
                is_writing: AtomicBool::new(false),
                read_handler: EventHandler::new(
                    fd,
                    Ready::READABLE | Ready::READ_CLOSED,
                    move |ready| {
                        if let Some(conn) = TcpConn::upgrade(&on_readable) {
                            conn.handle_read(ready);
                        }
                    },
                ),
                error_handler: EventHandler::new(fd, Ready::ERROR | Ready::HANGUP, move |ready| {
                    if let Some(conn) = TcpConn::upgrade(&on_error) {
                        conn.handle_error(ready);
                    }
                }),
                write_handler: OnceLock::new(),
                context: Mutex::new(None),
                callbacks: Mutex::new(Callbacks::default()),
                registration: Mutex::new(None),
                local_addr,
                peer_addr,
            }
        });
        let conn = TcpConn { inner };

        let event_loop = &conn.inner.event_loop;
        event_loop
            .register(&conn.inner.read_handler)
            .map_err(ConnectionError::Register)?;
        if let Err(e) = event_loop.register(&conn.inner.error_handler) {
            event_loop.unregister(&conn.inner.read_handler);
            return Err(ConnectionError::Register(e));
        }

        *conn.inner.registration.lock() = Some(conn.clone());
        debug!(peer = %peer_addr, local = %local_addr, fd, "Connection established");

        Ok(conn)
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<TcpConn> {
        weak.upgrade().map(|inner| TcpConn { inner })
    }

    /// Takes an additional reference to this connection.
    pub fn acquire(&self) -> TcpConn {
        self.clone()
    }

    /// Gives back a reference. The connection is destroyed with the last one.
    pub fn release(self) {}

    /// Number of live references, including the loop registration's.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Returns true if both handles refer to the same connection.
    pub fn ptr_eq(&self, other: &TcpConn) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn state(&self) -> ConnState {
        ConnState::from(self.inner.state.load(Ordering::Acquire))
    }

    /// True while output is buffered and write readiness is registered.
    pub fn is_writing(&self) -> bool {
        self.inner.is_writing.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// Identifies the connection by its peer address, e.g. `"10.0.0.7:50123"`.
    pub fn id(&self) -> String {
        self.inner.peer_addr.to_string()
    }

    pub fn fd(&self) -> RawFd {
        self.inner.socket.raw_fd()
    }

    /// The io group this connection was accepted into, if it is still alive.
    pub fn group(&self) -> Option<Arc<IoGroup>> {
        self.inner.group.upgrade()
    }

    /// Bytes waiting in the output buffer.
    pub fn pending_output(&self) -> usize {
        self.inner.out_buffer.lock().readable_bytes()
    }

    /// Bytes received but not yet consumed by the codec.
    ///
    /// Must not be called from inside `Codec::decode`.
    pub fn buffered_input(&self) -> usize {
        self.inner.in_buffer.lock().readable_bytes()
    }

    pub fn set_write_complete_callback<F>(&self, callback: F)
    where
        F: Fn(&TcpConn) + Send + Sync + 'static,
    {
        self.inner.callbacks.lock().on_write_complete = Some(Arc::new(callback));
    }

    pub fn set_close_callback<F>(&self, callback: F)
    where
        F: Fn(&TcpConn) + Send + Sync + 'static,
    {
        self.inner.callbacks.lock().on_close = Some(Arc::new(callback));
    }

    /// Replaces the attached context. The previous one (if any) runs its
    /// cleanup and is dropped; `None` just clears it.
    pub fn set_context(&self, context: Option<Context>) {
        let previous = std::mem::replace(&mut *self.inner.context.lock(), context);
        drop(previous);
    }

    /// Runs `f` on the attached context if it holds a `T`.
    ///
    /// `f` must not call `set_context` on the same connection.
    pub fn with_context<T, R, F>(&self, f: F) -> Option<R>
    where
        T: 'static,
        F: FnOnce(&mut T) -> R,
    {
        let mut context = self.inner.context.lock();
        context.as_mut()?.downcast_mut::<T>().map(f)
    }

    pub fn has_context(&self) -> bool {
        self.inner.context.lock().is_some()
    }

    /// Sends `data`, buffering whatever the socket does not take right away.
    ///
    /// Bytes from successive calls are transmitted in call order.
    /// `on_write_complete` runs synchronously if everything was sent, or later
    /// from the write handler once the buffer drains. An empty write sends
    /// nothing and completes synchronously unless output is already pending,
    /// in which case the pending drain completes it. A hard socket error is
    /// logged and the data is discarded; the error path will close the
    /// connection.
    ///
    /// Must be called on the connection's loop thread (from the codec or a
    /// callback, or through `Reactor::queue_in_loop`). The check of pending
    /// output and the direct send are not atomic, so a call from another
    /// thread could overtake buffered bytes. Debug builds assert this.
    pub fn write(&self, data: &[u8]) {
        let inner = &self.inner;
        debug_assert!(
            self.on_loop_thread(),
            "TcpConn::write called off the connection's loop thread"
        );

        if self.state() == ConnState::Disconnected {
            debug!(peer = %inner.peer_addr, bytes = data.len(), "Write on closed connection dropped");
            return;
        }
        if data.is_empty() {
            if !self.is_writing() {
                self.notify_write_complete();
            }
            return;
        }

        let mut written = 0;
        if !self.is_writing() {
            match inner.socket.write(data) {
                Ok(n) => written = n,
                Err(e) if socket::is_transient(&e) => {}
                Err(e) => {
                    warn!(peer = %inner.peer_addr, error = %e, "Write failed");
                    return;
                }
            }
        }

        if written > 0 {
            if let Some(stats) = &inner.stats {
                stats.bytes_written(written);
            }
        }

        if written == data.len() {
            trace!(peer = %inner.peer_addr, bytes = written, "Sent data");
            self.notify_write_complete();
            return;
        }

        let remaining = &data[written..];
        inner.out_buffer.lock().extend_from_slice(remaining);
        if let Some(stats) = &inner.stats {
            stats.write_deferred();
        }
        trace!(
            peer = %inner.peer_addr,
            sent = written,
            buffered = remaining.len(),
            "Socket busy, buffering output"
        );

        if !self.is_writing() {
            self.start_writing();
        }
    }

    /// Closes the connection.
    ///
    /// Idempotent. If output is still buffered the close is deferred until the
    /// write handler drains it; otherwise the handlers are unregistered,
    /// `on_close` runs and the registration's reference is released.
    pub fn close(&self) {
        let inner = &self.inner;

        if self.state() == ConnState::Disconnected {
            return;
        }

        if self.is_writing() {
            if inner
                .state
                .compare_exchange(
                    ConnState::Connected as u8,
                    ConnState::Disconnecting as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                debug!(
                    peer = %inner.peer_addr,
                    pending = self.pending_output(),
                    "Close deferred until output drains"
                );
            }
            return;
        }

        let previous = inner
            .state
            .swap(ConnState::Disconnected as u8, Ordering::AcqRel);
        if ConnState::from(previous) == ConnState::Disconnected {
            return;
        }

        inner.event_loop.unregister(&inner.read_handler);
        inner.event_loop.unregister(&inner.error_handler);
        if let Some(write_handler) = inner.write_handler.get() {
            if inner.event_loop.is_registered(write_handler) {
                inner.event_loop.unregister(write_handler);
            }
        }

        debug!(peer = %inner.peer_addr, "Connection closed");

        let on_close = inner.callbacks.lock().on_close.clone();
        if let Some(on_close) = on_close {
            on_close(&self.acquire());
        }

        let registration = inner.registration.lock().take();
        drop(registration);
    }

    /// Closes immediately, discarding any output still waiting to be sent.
    ///
    /// Used when the loop is going away and a deferred close could never
    /// finish. Must run on the loop thread or after the loop has stopped.
    pub fn abort(&self) {
        if self.state() == ConnState::Disconnected {
            return;
        }

        let dropped = {
            let mut output = self.inner.out_buffer.lock();
            let dropped = output.readable_bytes();
            output.clear();
            dropped
        };
        if self.is_writing() {
            self.stop_writing();
        }
        if dropped > 0 {
            warn!(peer = %self.inner.peer_addr, dropped, "Aborting connection with pending output");
        }
        self.close();
    }

    fn on_loop_thread(&self) -> bool {
        self.group().map_or(true, |group| {
            let reactor = group.reactor();
            reactor.is_in_loop_thread() || reactor.is_stopped()
        })
    }

    fn handle_read(&self, _ready: Ready) {
        let inner = &self.inner;

        for _ in 0..MAX_READS_PER_EVENT {
            let result = inner
                .in_buffer
                .lock()
                .fill_from_socket(inner.socket.as_ref(), inner.read_hint);

            match result {
                Ok(0) => {
                    debug!(peer = %inner.peer_addr, "Peer closed the connection");
                    self.close();
                    return;
                }
                Ok(n) => {
                    if let Some(stats) = &inner.stats {
                        stats.bytes_read(n);
                    }
                    trace!(peer = %inner.peer_addr, bytes = n, "Read data");

                    self.decode();
                    if self.state() == ConnState::Disconnected {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    error!(peer = %inner.peer_addr, error = %e, "Read failed");
                    self.close();
                    return;
                }
            }
        }

        // Budget spent with the socket still readable. Readiness is
        // edge-triggered, so no new event will arrive for what is left:
        // continue after the other descriptors of this round.
        trace!(peer = %inner.peer_addr, "Read budget exhausted, yielding");
        let weak = Arc::downgrade(inner);
        inner.event_loop.defer(Box::new(move || {
            if let Some(conn) = TcpConn::upgrade(&weak) {
                if conn.state() != ConnState::Disconnected {
                    conn.handle_read(Ready::READABLE);
                }
            }
        }));
    }

    fn decode(&self) {
        if let Some(codec) = &self.inner.codec {
            let mut input = self.inner.in_buffer.lock();
            codec.decode(self, &mut input);
        }
    }

    fn start_writing(&self) {
        let inner = &self.inner;
        let handler = inner.write_handler.get_or_init(|| {
            let weak = Arc::downgrade(inner);
            EventHandler::new(self.fd(), Ready::WRITABLE, move |ready| {
                if let Some(conn) = TcpConn::upgrade(&weak) {
                    conn.handle_write(ready);
                }
            })
        });

        match inner.event_loop.register(handler) {
            Ok(()) => inner.is_writing.store(true, Ordering::Release),
            Err(e) => {
                error!(peer = %inner.peer_addr, error = %e, "Failed to register write interest");
                inner.out_buffer.lock().clear();
                self.close();
            }
        }
    }

    fn stop_writing(&self) {
        let inner = &self.inner;
        if let Some(handler) = inner.write_handler.get() {
            inner.event_loop.unregister(handler);
        }
        inner.is_writing.store(false, Ordering::Release);
    }

    fn handle_write(&self, _ready: Ready) {
        let inner = &self.inner;
        if !self.is_writing() {
            return;
        }

        let (result, remaining) = {
            let mut output = inner.out_buffer.lock();
            let result = output.drain_to_socket(inner.socket.as_ref());
            (result, output.readable_bytes())
        };

        match result {
            Ok(n) => {
                if n > 0 {
                    if let Some(stats) = &inner.stats {
                        stats.bytes_written(n);
                    }
                }
                trace!(peer = %inner.peer_addr, bytes = n, remaining, "Flushed output");

                if remaining == 0 {
                    self.stop_writing();
                    self.notify_write_complete();
                    if self.state() == ConnState::Disconnecting {
                        self.close();
                    }
                }
            }
            Err(e) => {
                error!(
                    peer = %inner.peer_addr,
                    error = %e,
                    dropped = remaining,
                    "Failed to flush output"
                );
                // The output can never be delivered; stop waiting for it so the
                // close (requested now or by the error path) is not stuck.
                inner.out_buffer.lock().clear();
                self.stop_writing();
                if self.state() == ConnState::Disconnecting {
                    self.close();
                }
            }
        }
    }

    fn handle_error(&self, ready: Ready) {
        let peer = self.inner.peer_addr;

        if ready.contains(Ready::ERROR) {
            match self.inner.socket.take_error() {
                Ok(Some(e)) => error!(peer = %peer, error = %e, "Socket error"),
                Ok(None) => error!(peer = %peer, "Socket error reported by poller"),
                Err(e) => error!(peer = %peer, error = %e, "Socket error, SO_ERROR unavailable"),
            }
            self.close();
        } else if ready.contains(Ready::HANGUP) && !ready.contains(Ready::READABLE) {
            debug!(peer = %peer, "Connection hung up");
            self.close();
        }
        // HANGUP with READABLE: the read handler drains what is left and
        // observes end-of-stream itself.
    }

    fn notify_write_complete(&self) {
        let callback = self.inner.callbacks.lock().on_write_complete.clone();
        if let Some(callback) = callback {
            callback(self);
        }
    }
}

impl fmt::Display for TcpConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.peer_addr)
    }
}

impl fmt::Debug for TcpConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConn")
            .field("peer", &self.inner.peer_addr)
            .field("local", &self.inner.local_addr)
            .field("state", &self.state())
            .field("is_writing", &self.is_writing())
            .finish()
    }
}

/// Errors that can occur while setting up a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The socket handle does not refer to an open descriptor
    #[error("Invalid socket descriptor: {0}")]
    InvalidSocket(RawFd),

    /// Local or peer address could not be read
    #[error("Failed to read socket address: {0}")]
    Address(#[source] io::Error),

    /// The event loop refused a handler registration
    #[error("Failed to register with the event loop: {0}")]
    Register(#[source] io::Error),
}
