//! Readiness Events and Handler Registrations
//!
//! This module defines the contract between connections and the event loop
//! that drives them. A connection never polls anything itself: it hands
//! [`EventHandler`] registrations to an [`EventLoop`], and the loop invokes the
//! handler's callback with a [`Ready`] mask whenever the descriptor becomes
//! readable, writable, or reports an error/hangup.
//!
//! ## Registration Model
//!
//! ```text
//!   EventHandler { id, fd, interest, callback }
//!          │
//!          │ register()
//!          ▼
//!   ┌──────────────┐   readiness(fd)   ┌───────────────────────┐
//!   │  EventLoop   │──────────────────>│ callback(ready mask)  │
//!   └──────────────┘                   └───────────────────────┘
//! ```
//!
//! Several handlers may share one descriptor (a connection registers a read
//! handler, an error handler, and sometimes a write handler on the same
//! socket). Handlers are identified by a process-unique [`HandlerId`], so the
//! same handler value can be registered, unregistered and registered again.

use bitflags::bitflags;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

bitflags! {
    /// Readiness mask delivered to handlers, also used as the interest set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Ready: u8 {
        /// Data (or end-of-stream) can be read.
        const READABLE = 0b0000_0001;
        /// The send buffer has room.
        const WRITABLE = 0b0000_0010;
        /// An error is pending on the socket.
        const ERROR = 0b0000_0100;
        /// Both directions are shut down.
        const HANGUP = 0b0000_1000;
        /// The peer shut down its sending side.
        const READ_CLOSED = 0b0001_0000;
    }
}

impl From<&mio::event::Event> for Ready {
    fn from(event: &mio::event::Event) -> Self {
        let mut ready = Ready::empty();
        if event.is_readable() {
            ready |= Ready::READABLE;
        }
        if event.is_writable() {
            ready |= Ready::WRITABLE;
        }
        if event.is_error() {
            ready |= Ready::ERROR;
        }
        if event.is_read_closed() {
            ready |= Ready::READ_CLOSED;
            if event.is_write_closed() {
                ready |= Ready::HANGUP;
            }
        }
        ready
    }
}

/// Process-unique identity of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        HandlerId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Callback invoked by the loop with the readiness observed on the descriptor.
pub type ReadyCallback = Arc<dyn Fn(Ready) + Send + Sync>;

/// Work posted to a loop from its own thread or any other.
pub type Task = Box<dyn FnOnce() + Send>;

/// A registration: descriptor, interest set and callback.
///
/// Cloning is cheap and keeps the same [`HandlerId`].
#[derive(Clone)]
pub struct EventHandler {
    id: HandlerId,
    fd: RawFd,
    interest: Ready,
    callback: ReadyCallback,
}

impl EventHandler {
    /// Creates a new handler with a fresh id.
    pub fn new<F>(fd: RawFd, interest: Ready, callback: F) -> Self
    where
        F: Fn(Ready) + Send + Sync + 'static,
    {
        Self {
            id: HandlerId::next(),
            fd,
            interest,
            callback: Arc::new(callback),
        }
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn interest(&self) -> Ready {
        self.interest
    }

    /// Returns true if this handler wants to hear about `ready`.
    pub fn wants(&self, ready: Ready) -> bool {
        self.interest.intersects(ready)
    }

    /// Invokes the callback.
    pub fn dispatch(&self, ready: Ready) {
        (self.callback)(ready)
    }
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandler")
            .field("id", &self.id)
            .field("fd", &self.fd)
            .field("interest", &self.interest)
            .finish()
    }
}

/// A single-threaded readiness dispatcher.
///
/// Implementations must not hold internal locks while invoking callbacks:
/// callbacks routinely call back into `register`/`unregister`.
pub trait EventLoop: Send + Sync {
    /// Starts delivering readiness for `handler`.
    fn register(&self, handler: &EventHandler) -> io::Result<()>;

    /// Stops delivering readiness for `handler`. Unknown handlers are ignored.
    fn unregister(&self, handler: &EventHandler);

    /// Returns true if `handler` is currently registered.
    fn is_registered(&self, handler: &EventHandler) -> bool;

    /// Runs `task` on the loop thread after the current dispatch round.
    fn defer(&self, task: Task);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_handler_ids_are_unique() {
        let a = EventHandler::new(3, Ready::READABLE, |_| {});
        let b = EventHandler::new(3, Ready::READABLE, |_| {});
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }

    #[test]
    fn test_wants() {
        let handler = EventHandler::new(3, Ready::ERROR | Ready::HANGUP, |_| {});
        assert!(handler.wants(Ready::HANGUP | Ready::READABLE));
        assert!(!handler.wants(Ready::READABLE));
        assert!(!handler.wants(Ready::WRITABLE));
    }

    #[test]
    fn test_dispatch_passes_mask() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        let handler = EventHandler::new(7, Ready::READABLE, move |ready| {
            seen_clone.store(ready.bits() as usize, Ordering::SeqCst);
        });

        handler.dispatch(Ready::READABLE | Ready::HANGUP);
        assert_eq!(
            seen.load(Ordering::SeqCst),
            (Ready::READABLE | Ready::HANGUP).bits() as usize
        );
    }
}
