//! # Gnutella 0.6 connection engine
//!
//! Everything between an accepted or dialed TCP socket and a stream of
//! routed Gnutella messages: the text handshake, binary message framing,
//! per-connection outbound flow control and the two I/O models that drive
//! them.
//!
//! ## Features
//!
//! - **Handshake**: sans-IO state machine for both sides, pluggable responder,
//!   multi-round authentication, crawler and slots-full handling
//! - **Framing**: 23-byte header codec with hop/TTL sanity checks, blocking
//!   and incremental decoders
//! - **SACHRIFC flow control**: eight bounded, timed priority classes drained
//!   with biased round-robin
//! - **Compression**: `Content-Encoding: deflate` streams in either direction
//! - **I/O models**: thread-per-connection or a single readiness loop, chosen
//!   once per process
//!
//! ## Architecture
//!
//! ```text
//!   socket bytes
//!        │
//!        v
//!  ┌────────────┐  handshake  ┌────────────┐   accepted   ┌─────────────┐
//!  │ I/O driver │ ──────────> │ Handshaker │ ───────────> │  Framer /   │──> Dispatcher
//!  │ (threads / │             └────────────┘              │  Decoder    │
//!  │  reactor)  │ <──────────────────────────────────────  └─────────────┘
//!  └────────────┘        CompositeQueue::remove_next  <── Connection::send
//! ```
//!
//! ### Handshake
//!
//! ```text
//! Outgoing                                   Incoming
//!    |------ GNUTELLA CONNECT/0.6 ---------->|
//!    |------ request headers --------------->|
//!    |<----- GNUTELLA/0.6 200 OK ------------|
//!    |<----- response headers ---------------|
//!    |------ GNUTELLA/0.6 200 OK ----------->|
//!    |------ final headers ----------------->|
//!    |======= binary messages ==============|
//! ```
//!
//! ### Message header
//!
//! | Offset | Size | Field                   |
//! |--------|------|-------------------------|
//! | 0      | 16   | GUID                    |
//! | 16     | 1    | opcode                  |
//! | 17     | 1    | TTL                     |
//! | 18     | 1    | hops                    |
//! | 19     | 4    | payload length (LE)     |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use gnutella::{Config, Connection, ConnectionContext, Headers, Message, StaticResponder};
//!
//! let config = Arc::new(Config::default());
//! let responder = Arc::new(StaticResponder::new(Headers::new().with("User-Agent", "demo/0.1")));
//! let ctx = ConnectionContext::new(config, responder);
//!
//! let conn = Arc::new(Connection::outgoing("203.0.113.7:6346".parse()?, Headers::new(), ctx));
//! conn.initialize(Duration::from_secs(6))?;
//! conn.send(Message::ping(3));
//! conn.close();
//! ```
//!
//! ## Modules
//!
//! - [`handshake`]: header codec, responses, responders and the state machine
//! - [`message`]: message model and [`message::framer`]
//! - [`queue`]: SACHRIFC outbound queues
//! - [`connection`]: the session, compression, address learning, blocking I/O
//! - [`nio`]: readiness loop
//! - [`driver`]: I/O model selection
//! - [`config`]: Configuration management
//! - [`error`]: Error types and result aliases

pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod handshake;
pub mod message;
pub mod nio;
pub mod queue;

// Re-exports for convenience
pub use config::{Config, IoModel};
pub use connection::{
    ChannelDispatcher, CloseReason, Connection, ConnectionContext, ConnectionEvent,
    ConnectionState, Dispatcher, MessageFilter, NetworkIdentity, Notice, SharedIdentity,
    TransportKind,
};
pub use driver::{driver_for, SessionDriver, ThreadDriver};
pub use error::{GnutellaError, Result};
pub use handshake::{
    Conclusion, Direction, HandshakeOutcome, HandshakeResponse, Handshaker, Headers, Responder,
    StaticResponder, StatusCode,
};
pub use message::{Guid, Message, MessageKind, Opcode};
pub use nio::{Reactor, ReactorHandle};
pub use queue::{CompositeQueue, MessageQueue, QueueClass};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version spoken in the connect and status lines
pub const PROTOCOL_VERSION: &str = "0.6";
