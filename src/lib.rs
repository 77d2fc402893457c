//! # mqlink - TCP Connection Layer for a Message Broker
//!
//! mqlink owns the life cycle of every client socket of a broker: it reads
//! bytes into a buffer and hands them to a protocol decoder, writes replies
//! with backpressure, and tears connections down in an orderly way.
//!
//! ## Features
//!
//! - **Reactor per thread**: each io group runs one `mio` poller on its own thread
//! - **Backpressure**: bytes the socket cannot take wait in an output buffer
//! - **Graceful close**: a close requested with output pending completes
//!   after the output drains
//! - **Shared lifetime**: connections stay valid while any holder keeps a handle
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               mqlink                                    │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │  Acceptor   │───>│  IoGroup    │───>│  TcpConn    │                  │
//! │  │  (Reactor)  │    │  (Reactor)  │    │             │                  │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘                  │
//! │                                               │                         │
//! │                           ┌───────────────────┼──────────────┐          │
//! │                           ▼                   ▼              ▼          │
//! │                    ┌─────────────┐    ┌─────────────┐ ┌─────────────┐   │
//! │                    │   Codec     │    │  Buffers    │ │  Context    │   │
//! │                    │  decode()   │    │  in / out   │ │  (cleanup)  │   │
//! │                    └─────────────┘    └─────────────┘ └─────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use mqlink::{Config, EchoCodec, Server};
//! use std::sync::Arc;
//!
//! let config = Config { port: 1883, ..Config::default() };
//! let server = Server::start(&config, Arc::new(EchoCodec))?;
//! println!("listening on {}", server.local_addr());
//! // ...
//! server.shutdown();
//! ```
//!
//! ## Module Overview
//!
//! - [`event`]: readiness flags, event handlers and the `EventLoop` trait
//! - [`reactor`]: the mio-backed event loop
//! - [`socket`]: the socket abstraction used by connections
//! - [`buffer`]: moving bytes between buffers and sockets
//! - [`codec`]: the protocol decoder seam
//! - [`connection`]: `TcpConn`, its context and statistics
//! - [`server`]: acceptor and io groups
//! - [`config`]: command-line configuration
//!
//! ## Design Highlights
//!
//! ### Close State Machine
//!
//! A connection moves `Connected -> Disconnecting -> Disconnected` and never
//! back. `Disconnecting` exists only while output is pending; the final close
//! runs once the write handler has drained the buffer.
//!
//! ### Hangup Ordering
//!
//! When the poller reports hangup together with readable data, the data is
//! read and decoded before the connection closes.

pub mod buffer;
pub mod codec;
pub mod config;
pub mod connection;
pub mod event;
pub mod reactor;
pub mod server;
pub mod socket;

// Re-export commonly used types for convenience
pub use codec::{Codec, EchoCodec};
pub use config::{Command, Config, ConfigError};
pub use connection::{ConnState, ConnectionError, ConnectionStats, Context, TcpConn};
pub use event::{EventHandler, EventLoop, Ready};
pub use reactor::Reactor;
pub use server::{IoGroup, Server};
pub use socket::Socket;

/// The default port mqlink listens on (MQTT)
pub const DEFAULT_PORT: u16 = 1883;

/// The default host mqlink binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of mqlink
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
