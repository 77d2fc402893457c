//! Reactor: a mio-backed Event Loop
//!
//! One [`Reactor`] runs on one thread and owns one `mio::Poll`. It implements
//! [`EventLoop`], so connections register their handlers with it directly.
//!
//! ## Design
//!
//! ```text
//!   register(handler) ──> handlers[fd] = [read, error, write, ...]
//!                              │
//!                              │ union of interests
//!                              ▼
//!                      mio::Registry (one registration per fd)
//!
//!   run():  poll ──> for each event: Ready mask ──> matching handlers
//!             ▲                                          │
//!             └──────── pending tasks (queue_in_loop) <──┘
//! ```
//!
//! mio allows one registration per descriptor, while a connection registers up
//! to three handlers on its socket. The reactor therefore keeps the handlers
//! per descriptor and registers the union of their interests, re-registering
//! whenever that union changes. mio is edge-triggered: handlers must read and
//! write until the socket reports would-block.
//!
//! Other threads interact with a reactor through [`Reactor::queue_in_loop`]
//! and [`Reactor::stop`], both of which wake the poller.

use crate::event::{EventHandler, EventLoop, Ready, Task};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Default number of events fetched per poll
pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;

/// Default poll timeout in milliseconds
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;

const WAKER_TOKEN: Token = Token(usize::MAX);

struct FdEntry {
    handlers: Vec<EventHandler>,
    interest: Interest,
}

/// A single-threaded readiness dispatcher built on `mio::Poll`.
pub struct Reactor {
    name: String,
    poll: Mutex<Poll>,
    registry: Registry,
    waker: Waker,
    handlers: Mutex<HashMap<RawFd, FdEntry>>,
    pending: Mutex<Vec<Task>>,
    stopped: AtomicBool,
    loop_thread: Mutex<Option<ThreadId>>,
    events_capacity: usize,
    poll_timeout: Duration,
}

impl Reactor {
    /// Creates a reactor with custom polling parameters.
    ///
    /// # Arguments
    ///
    /// * `name` - Used in log records
    /// * `events_capacity` - Maximum number of events handled per poll
    /// * `poll_timeout_ms` - How long one poll may block
    pub fn new(name: impl Into<String>, events_capacity: usize, poll_timeout_ms: u64) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        Ok(Self {
            name: name.into(),
            poll: Mutex::new(poll),
            registry,
            waker,
            handlers: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            loop_thread: Mutex::new(None),
            events_capacity: events_capacity.max(1),
            poll_timeout: Duration::from_millis(poll_timeout_ms),
        })
    }

    /// Creates a reactor with [`DEFAULT_EVENTS_CAPACITY`] and
    /// [`DEFAULT_POLL_TIMEOUT_MS`].
    pub fn with_defaults(name: impl Into<String>) -> io::Result<Self> {
        Self::new(name, DEFAULT_EVENTS_CAPACITY, DEFAULT_POLL_TIMEOUT_MS)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the loop on the calling thread until [`stop`](Self::stop).
    ///
    /// # Errors
    ///
    /// Fails if the reactor is already running on another thread or the
    /// poller itself fails.
    pub fn run(&self) -> io::Result<()> {
        let mut poll = self
            .poll
            .try_lock()
            .ok_or_else(|| io::Error::other(format!("reactor {} is already running", self.name)))?;
        *self.loop_thread.lock() = Some(thread::current().id());

        let mut events = Events::with_capacity(self.events_capacity);
        info!(reactor = %self.name, "Reactor started");

        let result = loop {
            if self.stopped.load(Ordering::Acquire) {
                break Ok(());
            }

            if let Err(e) = poll.poll(&mut events, Some(self.poll_timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(reactor = %self.name, error = %e, "Poll failed");
                break Err(e);
            }

            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                self.dispatch(event.token().0 as RawFd, Ready::from(event));
            }

            self.run_pending_tasks();
        };

        self.run_pending_tasks();
        *self.loop_thread.lock() = None;
        info!(reactor = %self.name, "Reactor stopped");
        result
    }

    /// Asks the loop to exit after the current round. Callable from any thread.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!(reactor = %self.name, error = %e, "Failed to wake reactor");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Returns true when called from the thread currently running the loop.
    pub fn is_in_loop_thread(&self) -> bool {
        *self.loop_thread.lock() == Some(thread::current().id())
    }

    /// Runs `task` on the loop thread after the current dispatch round.
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pending.lock().push(Box::new(task));
        if let Err(e) = self.waker.wake() {
            warn!(reactor = %self.name, error = %e, "Failed to wake reactor");
        }
    }

    /// Runs `task` now if called on the loop thread, otherwise queues it.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Number of descriptors with at least one handler.
    pub fn registered_fds(&self) -> usize {
        self.handlers.lock().len()
    }

    fn dispatch(&self, fd: RawFd, ready: Ready) {
        let targets: Vec<EventHandler> = match self.handlers.lock().get(&fd) {
            Some(entry) => entry
                .handlers
                .iter()
                .filter(|h| h.wants(ready))
                .cloned()
                .collect(),
            None => return,
        };

        trace!(reactor = %self.name, fd, ?ready, handlers = targets.len(), "Dispatching");
        for handler in &targets {
            // An earlier handler in this round may have unregistered it.
            if self.is_registered(handler) {
                handler.dispatch(ready);
            }
        }
    }

    fn run_pending_tasks(&self) {
        let tasks = std::mem::take(&mut *self.pending.lock());
        for task in tasks {
            task();
        }
    }
}

/// mio needs a non-empty interest; error and hangup are always reported.
fn combined_interest(handlers: &[EventHandler]) -> Interest {
    let wants_write = handlers
        .iter()
        .any(|h| h.interest().contains(Ready::WRITABLE));
    let wants_read = handlers
        .iter()
        .any(|h| !h.interest().difference(Ready::WRITABLE).is_empty());

    match (wants_read, wants_write) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (false, true) => Interest::WRITABLE,
        _ => Interest::READABLE,
    }
}

impl EventLoop for Reactor {
    fn register(&self, handler: &EventHandler) -> io::Result<()> {
        let fd = handler.fd();
        if fd < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid descriptor {}", fd),
            ));
        }

        let mut handlers = self.handlers.lock();
        match handlers.get_mut(&fd) {
            Some(entry) => {
                if entry.handlers.iter().any(|h| h.id() == handler.id()) {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        "handler already registered",
                    ));
                }

                entry.handlers.push(handler.clone());
                let interest = combined_interest(&entry.handlers);
                if interest != entry.interest {
                    if let Err(e) =
                        self.registry
                            .reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
                    {
                        entry.handlers.pop();
                        return Err(e);
                    }
                    entry.interest = interest;
                }
            }
            None => {
                let list = vec![handler.clone()];
                let interest = combined_interest(&list);
                self.registry
                    .register(&mut SourceFd(&fd), Token(fd as usize), interest)?;
                handlers.insert(
                    fd,
                    FdEntry {
                        handlers: list,
                        interest,
                    },
                );
            }
        }

        trace!(reactor = %self.name, fd, handler = handler.id().as_u64(), "Handler registered");
        Ok(())
    }

    fn unregister(&self, handler: &EventHandler) {
        let fd = handler.fd();

        // Dropped after the lock is released: a handler's closure may own
        // resources whose teardown touches this reactor.
        let removed = {
            let mut handlers = self.handlers.lock();
            let Some(entry) = handlers.get_mut(&fd) else {
                return;
            };
            let Some(pos) = entry.handlers.iter().position(|h| h.id() == handler.id()) else {
                return;
            };
            let removed = entry.handlers.remove(pos);

            if entry.handlers.is_empty() {
                handlers.remove(&fd);
                if let Err(e) = self.registry.deregister(&mut SourceFd(&fd)) {
                    debug!(reactor = %self.name, fd, error = %e, "Deregister failed");
                }
            } else {
                let interest = combined_interest(&entry.handlers);
                if interest != entry.interest {
                    match self
                        .registry
                        .reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
                    {
                        Ok(()) => entry.interest = interest,
                        Err(e) => warn!(reactor = %self.name, fd, error = %e, "Reregister failed"),
                    }
                }
            }
            removed
        };

        trace!(reactor = %self.name, fd, handler = removed.id().as_u64(), "Handler unregistered");
    }

    fn is_registered(&self, handler: &EventHandler) -> bool {
        self.handlers
            .lock()
            .get(&handler.fd())
            .is_some_and(|entry| entry.handlers.iter().any(|h| h.id() == handler.id()))
    }

    fn defer(&self, task: Task) {
        self.queue_in_loop(task);
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("name", &self.name)
            .field("registered_fds", &self.registered_fds())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
