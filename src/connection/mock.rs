//! Scripted socket and recording event loop for unit tests.

use crate::event::{EventHandler, EventLoop, Ready, Task};
use crate::socket::Socket;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

enum ReadStep {
    Data(Vec<u8>),
    Eof,
    Fail(io::ErrorKind),
}

#[derive(Default)]
struct SocketState {
    reads: Mutex<VecDeque<ReadStep>>,
    written: Mutex<Vec<u8>>,
    write_budget: Mutex<Option<usize>>,
    write_error: Mutex<Option<io::ErrorKind>>,
    pending_error: Mutex<Option<io::ErrorKind>>,
    write_calls: AtomicUsize,
    drops: AtomicUsize,
}

/// A socket whose reads and write capacity are scripted by the test.
///
/// Reads pop from a queue and report would-block once it is empty. Writes
/// accept everything unless a budget is set; a budget of `Some(n)` accepts
/// `n` more bytes and then blocks.
#[derive(Clone)]
pub struct MockSocket {
    state: Arc<SocketState>,
    fd: RawFd,
    tracked: bool,
}

impl MockSocket {
    pub fn new() -> Self {
        Self::with_fd(42)
    }

    pub fn with_fd(fd: RawFd) -> Self {
        Self {
            state: Arc::default(),
            fd,
            tracked: false,
        }
    }

    /// A boxed clone for the connection; its drop is counted.
    pub fn boxed(&self) -> Box<dyn Socket> {
        Box::new(MockSocket {
            state: Arc::clone(&self.state),
            fd: self.fd,
            tracked: true,
        })
    }

    pub fn push_read(&self, data: &[u8]) {
        self.state
            .reads
            .lock()
            .push_back(ReadStep::Data(data.to_vec()));
    }

    pub fn push_eof(&self) {
        self.state.reads.lock().push_back(ReadStep::Eof);
    }

    pub fn push_read_error(&self, kind: io::ErrorKind) {
        self.state.reads.lock().push_back(ReadStep::Fail(kind));
    }

    pub fn set_write_budget(&self, budget: Option<usize>) {
        *self.state.write_budget.lock() = budget;
    }

    pub fn fail_writes(&self, kind: io::ErrorKind) {
        *self.state.write_error.lock() = Some(kind);
    }

    pub fn set_pending_error(&self, kind: io::ErrorKind) {
        *self.state.pending_error.lock() = Some(kind);
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.written.lock().clone()
    }

    pub fn write_calls(&self) -> usize {
        self.state.write_calls.load(Ordering::SeqCst)
    }

    /// How many times the connection's copy was dropped (closed).
    pub fn drops(&self) -> usize {
        self.state.drops.load(Ordering::SeqCst)
    }
}

impl Drop for MockSocket {
    fn drop(&mut self) {
        if self.tracked {
            self.state.drops.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Socket for MockSocket {
    fn raw_fd(&self) -> RawFd {
        self.fd
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut reads = self.state.reads.lock();
        match reads.pop_front() {
            None => Err(io::ErrorKind::WouldBlock.into()),
            Some(ReadStep::Eof) => Ok(0),
            Some(ReadStep::Fail(kind)) => Err(kind.into()),
            Some(ReadStep::Data(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    reads.push_front(ReadStep::Data(data.split_off(n)));
                }
                Ok(n)
            }
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.state.write_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(kind) = *self.state.write_error.lock() {
            return Err(kind.into());
        }

        let mut budget = self.state.write_budget.lock();
        let n = match *budget {
            None => buf.len(),
            Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
            Some(left) => {
                let n = left.min(buf.len());
                *budget = Some(left - n);
                n
            }
        };
        self.state.written.lock().extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn shutdown(&self) -> io::Result<()> {
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 1883)))
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from(([10, 0, 0, 7], 50123)))
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        Ok(self.state.pending_error.lock().take().map(io::Error::from))
    }
}

/// An event loop that records registrations and dispatches on demand.
#[derive(Default)]
pub struct MockLoop {
    handlers: Mutex<Vec<EventHandler>>,
    registrations: AtomicUsize,
    deferred: Mutex<Vec<Task>>,
}

impl MockLoop {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Delivers `ready` for `fd` the way the reactor does.
    pub fn fire(&self, fd: RawFd, ready: Ready) {
        let targets: Vec<EventHandler> = self
            .handlers
            .lock()
            .iter()
            .filter(|h| h.fd() == fd && h.wants(ready))
            .cloned()
            .collect();

        for handler in targets {
            if self.is_registered(&handler) {
                handler.dispatch(ready);
            }
        }
    }

    pub fn registered(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    pub fn deferred(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Runs the tasks deferred so far; tasks they defer wait for the next call.
    pub fn run_deferred(&self) {
        let tasks = std::mem::take(&mut *self.deferred.lock());
        for task in tasks {
            task();
        }
    }

    /// True if some registered handler listens for any of `interest`.
    pub fn has_interest(&self, interest: Ready) -> bool {
        self.handlers.lock().iter().any(|h| h.wants(interest))
    }
}

impl EventLoop for MockLoop {
    fn register(&self, handler: &EventHandler) -> io::Result<()> {
        let mut handlers = self.handlers.lock();
        if handlers.iter().any(|h| h.id() == handler.id()) {
            return Err(io::ErrorKind::AlreadyExists.into());
        }
        handlers.push(handler.clone());
        self.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unregister(&self, handler: &EventHandler) {
        self.handlers.lock().retain(|h| h.id() != handler.id());
    }

    fn is_registered(&self, handler: &EventHandler) -> bool {
        self.handlers.lock().iter().any(|h| h.id() == handler.id())
    }

    fn defer(&self, task: Task) {
        self.deferred.lock().push(task);
    }
}
