//! Connection Module
//!
//! This module manages individual client connections. Each accepted socket
//! becomes a [`TcpConn`] bound to one io group's reactor for its whole life;
//! all of its callbacks run on that reactor's thread.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Acceptor (server.rs)                       │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │
//!                        │ hand_off() to an io group
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       TcpConn                               │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │  │ read ready  │───>│  in_buffer  │───>│    Codec    │      │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘      │
//! │                                               │ write()     │
//! │                                               ▼             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │  │ write ready │───>│ out_buffer  │<───│ socket busy │      │
//! │  └─────────────┘    └─────────────┘    └─────────────┘      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Backpressure**: bytes the socket cannot take are buffered and flushed
//!   on write readiness
//! - **Deferred close**: `close()` waits for buffered output to drain
//! - **Shared lifetime**: the connection lives until the loop registration
//!   and every external holder have released it
//! - **Statistics**: per-group byte and connection counters
//!
//! ## Example
//!
//! ```ignore
//! use mqlink::connection::TcpConn;
//!
//! let conn = TcpConn::new(event_loop, group, Box::new(stream), Some(codec))?;
//! conn.set_close_callback(|conn| println!("{} went away", conn));
//! conn.write(b"hello");
//! ```

pub mod conn;
pub mod context;
pub mod stats;

#[cfg(test)]
pub(crate) mod mock;

// Re-export commonly used types
pub use conn::{CloseCallback, ConnState, ConnectionError, TcpConn, WriteCompleteCallback};
pub use context::Context;
pub use stats::ConnectionStats;
