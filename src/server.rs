//! Server: Acceptor and IO Groups
//!
//! The server binds one listening socket and runs `io_threads + 1` reactors:
//!
//! ```text
//!                    ┌──────────────────┐
//!   clients ───────> │ acceptor reactor │  accept until would-block
//!                    └────────┬─────────┘
//!                             │ round-robin hand_off()
//!            ┌────────────────┼────────────────┐
//!            ▼                ▼                ▼
//!     ┌────────────┐   ┌────────────┐   ┌────────────┐
//!     │ IoGroup 0  │   │ IoGroup 1  │   │ IoGroup N  │
//!     │  reactor   │   │  reactor   │   │  reactor   │
//!     │  TcpConns  │   │  TcpConns  │   │  TcpConns  │
//!     └────────────┘   └────────────┘   └────────────┘
//! ```
//!
//! A connection never migrates: it is created on its group's loop thread and
//! every callback for it runs there.

use crate::codec::Codec;
use crate::config::Config;
use crate::connection::{ConnectionStats, TcpConn};
use crate::event::{EventHandler, EventLoop, Ready};
use crate::reactor::Reactor;
use anyhow::{anyhow, Context as _};
use mio::net::{TcpListener, TcpStream};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

type LoopThread = JoinHandle<io::Result<()>>;

/// One reactor thread and the connections bound to it.
pub struct IoGroup {
    id: usize,
    reactor: Arc<Reactor>,
    codec: Option<Arc<dyn Codec>>,
    connections: Mutex<HashMap<String, TcpConn>>,
    stats: Arc<ConnectionStats>,
    read_hint: usize,
    thread: Mutex<Option<LoopThread>>,
}

impl IoGroup {
    pub fn new(id: usize, codec: Option<Arc<dyn Codec>>, read_hint: usize) -> io::Result<Arc<Self>> {
        Ok(Arc::new(Self {
            id,
            reactor: Arc::new(Reactor::with_defaults(format!("io-{}", id))?),
            codec,
            connections: Mutex::new(HashMap::new()),
            stats: Arc::new(ConnectionStats::new()),
            read_hint,
            thread: Mutex::new(None),
        }))
    }

    /// Spawns the group's loop thread.
    pub fn start(&self) -> io::Result<()> {
        let reactor = Arc::clone(&self.reactor);
        let handle = thread::Builder::new()
            .name(format!("mqlink-io-{}", self.id))
            .spawn(move || reactor.run())?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    pub fn stats(&self) -> Arc<ConnectionStats> {
        Arc::clone(&self.stats)
    }

    pub fn read_hint(&self) -> usize {
        self.read_hint
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Hands an accepted socket to this group. Callable from any thread.
    pub fn hand_off(self: &Arc<Self>, stream: TcpStream) {
        let group = Arc::downgrade(self);
        self.reactor.queue_in_loop(move || {
            if let Some(group) = group.upgrade() {
                group.add_connection(stream);
            }
        });
    }

    /// Builds a connection on the loop thread and tracks it until it closes.
    fn add_connection(self: &Arc<Self>, stream: TcpStream) {
        let event_loop: Arc<dyn EventLoop> = self.reactor.clone();
        let conn = match TcpConn::new(
            event_loop,
            Arc::downgrade(self),
            Box::new(stream),
            self.codec.clone(),
        ) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(group = self.id, error = %e, "Failed to set up connection");
                return;
            }
        };

        let group = Arc::downgrade(self);
        conn.set_close_callback(move |conn| {
            if let Some(group) = group.upgrade() {
                group.remove_connection(conn);
            }
        });

        self.stats.connection_opened();
        info!(group = self.id, peer = %conn, "Connection accepted");
        self.connections.lock().insert(conn.id(), conn);
    }

    fn remove_connection(&self, conn: &TcpConn) {
        let removed = self.connections.lock().remove(&conn.id());
        if removed.is_some() {
            self.stats.connection_closed();
            info!(group = self.id, peer = %conn, "Connection removed");
        }
    }

    /// Closes every connection of the group. Must run on the loop thread.
    pub fn close_all(&self) {
        let conns: Vec<TcpConn> = self.connections.lock().values().cloned().collect();
        debug!(group = self.id, count = conns.len(), "Closing all connections");
        for conn in conns {
            conn.close();
        }
    }

    /// Closes all connections, stops the loop and joins its thread.
    ///
    /// Connections whose close is still waiting on output when the loop
    /// stops are aborted: nothing would ever drain them.
    pub fn shutdown(self: &Arc<Self>) {
        let group = Arc::clone(self);
        self.reactor.queue_in_loop(move || group.close_all());
        self.reactor.stop();

        if self.reactor.is_in_loop_thread() {
            warn!(group = self.id, "Shutdown called from the loop thread; not joining");
        } else {
            let handle = self.thread.lock().take();
            if let Some(handle) = handle {
                join_loop(&format!("io-{}", self.id), handle);
            }
        }

        self.abort_remaining();
    }

    fn abort_remaining(&self) {
        let conns: Vec<TcpConn> = self.connections.lock().values().cloned().collect();
        if !conns.is_empty() {
            warn!(group = self.id, count = conns.len(), "Aborting connections with unsent output");
        }
        for conn in conns {
            conn.abort();
        }
    }
}

fn join_loop(name: &str, handle: LoopThread) {
    match handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(reactor = name, error = %e, "Reactor exited with an error"),
        Err(_) => error!(reactor = name, "Reactor thread panicked"),
    }
}

/// A running broker front end: listener, acceptor and io groups.
pub struct Server {
    local_addr: SocketAddr,
    acceptor: Arc<Reactor>,
    accept_handler: EventHandler,
    acceptor_thread: Option<LoopThread>,
    groups: Vec<Arc<IoGroup>>,
}

impl Server {
    /// Binds the listener and starts every reactor thread.
    pub fn start(config: &Config, codec: Arc<dyn Codec>) -> anyhow::Result<Server> {
        let bind_address = config.bind_address();
        let addr = bind_address
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve {}", bind_address))?
            .next()
            .ok_or_else(|| anyhow!("{} resolved to no address", bind_address))?;

        let listener = Arc::new(
            TcpListener::bind(addr).with_context(|| format!("failed to bind {}", addr))?,
        );
        let local_addr = listener.local_addr()?;

        let mut groups = Vec::with_capacity(config.io_threads.max(1));
        for id in 0..config.io_threads.max(1) {
            let group = IoGroup::new(id, Some(Arc::clone(&codec)), config.read_hint)?;
            group.start()?;
            groups.push(group);
        }

        let acceptor = Arc::new(Reactor::with_defaults("acceptor")?);
        let accept_handler = {
            let fd = listener.as_raw_fd();
            let groups = groups.clone();
            let next = AtomicUsize::new(0);
            let no_delay = config.no_delay;
            EventHandler::new(fd, Ready::READABLE, move |_| {
                accept_pending(&listener, &groups, &next, no_delay)
            })
        };
        acceptor.register(&accept_handler)?;

        let acceptor_thread = {
            let acceptor = Arc::clone(&acceptor);
            thread::Builder::new()
                .name("mqlink-acceptor".to_string())
                .spawn(move || acceptor.run())?
        };

        info!(addr = %local_addr, io_threads = groups.len(), "Listening");

        Ok(Server {
            local_addr,
            acceptor,
            accept_handler,
            acceptor_thread: Some(acceptor_thread),
            groups,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn groups(&self) -> &[Arc<IoGroup>] {
        &self.groups
    }

    /// Counters summed over every io group.
    pub fn stats(&self) -> ConnectionStats {
        let total = ConnectionStats::new();
        for group in &self.groups {
            total.merge(&group.stats());
        }
        total
    }

    /// Stops accepting, closes every connection and joins all threads.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(acceptor_thread) = self.acceptor_thread.take() else {
            return;
        };

        self.acceptor.unregister(&self.accept_handler);
        self.acceptor.stop();
        join_loop("acceptor", acceptor_thread);

        for group in &self.groups {
            group.shutdown();
        }
        info!(addr = %self.local_addr, "Server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_pending(listener: &TcpListener, groups: &[Arc<IoGroup>], next: &AtomicUsize, no_delay: bool) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if no_delay {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                }
                let index = next.fetch_add(1, Ordering::Relaxed) % groups.len();
                debug!(peer = %peer, group = index, "Handing off socket");
                groups[index].hand_off(stream);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(error = %e, "Accept failed");
                break;
            }
        }
    }
}
