//! Gnutella connection engine error types.
//!
//! # Error Classification
//!
//! | Variant          | Cause                                   | Connection |
//! |------------------|-----------------------------------------|------------|
//! | `NoGnutellaOk`   | peer (or we) answered with a non-OK code | closed, caller picks backoff |
//! | `BadHandshake`   | handshake grammar violated              | closed     |
//! | `BadPacket`      | malformed binary message                | kept unless [`BadPacketReason::is_fatal`] |
//! | `Io`             | socket closed, timeout, end-of-stream   | closed     |
//!
//! Nothing in this crate retries on its own; retry policy belongs to whoever
//! manages the set of peer connections.

use thiserror::Error;

/// Gnutella connection engine errors.
#[derive(Error, Debug)]
pub enum GnutellaError {
    /// The handshake ended with a structured refusal.
    #[error("No GNUTELLA OK: {0}")]
    NoGnutellaOk(Rejection),

    /// Handshake protocol violation.
    #[error("Bad handshake: {0}")]
    BadHandshake(String),

    /// Malformed binary message.
    #[error("Bad packet: {0}")]
    BadPacket(BadPacketReason),

    /// Operation attempted on a closed connection.
    #[error("Connection closed")]
    Closed,

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for connection engine operations
pub type Result<T> = std::result::Result<T, GnutellaError>;

impl GnutellaError {
    /// Whether the connection must be torn down after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            GnutellaError::BadPacket(reason) => reason.is_fatal(),
            _ => true,
        }
    }

    /// Whether this is a refusal because the peer (or we) had no free slots.
    pub fn is_slots_full(&self) -> bool {
        matches!(self, GnutellaError::NoGnutellaOk(r) if r.reason == RejectReason::SlotsFull)
    }

    /// Build an I/O timeout error.
    pub fn timed_out(what: &str) -> Self {
        GnutellaError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("timed out waiting for {what}"),
        ))
    }
}

impl From<toml::de::Error> for GnutellaError {
    fn from(err: toml::de::Error) -> Self {
        GnutellaError::Config(err.to_string())
    }
}

/// Which side of the handshake refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Our own responder refused the peer.
    Local,
    /// The peer refused us.
    Remote,
}

/// Why a handshake was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Status 503: no free connection slots, try again later.
    SlotsFull,
    /// Any other non-OK status code.
    Other(u16),
    /// The maximum number of rounds passed without a conclusion.
    Unresolved,
}

/// A structured handshake refusal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    /// Side that refused.
    pub side: Side,
    /// Reason for the refusal.
    pub reason: RejectReason,
}

impl Rejection {
    /// Create a new rejection.
    pub fn new(side: Side, reason: RejectReason) -> Self {
        Self { side, reason }
    }

    /// Map a refusing status code to a rejection.
    pub fn from_code(side: Side, code: u16) -> Self {
        let reason = if code == crate::handshake::StatusCode::SLOTS_FULL.0 {
            RejectReason::SlotsFull
        } else {
            RejectReason::Other(code)
        };
        Self { side, reason }
    }

    /// Numeric status code carried by this rejection (0 when unresolved).
    pub fn code(&self) -> u16 {
        match self.reason {
            RejectReason::SlotsFull => crate::handshake::StatusCode::SLOTS_FULL.0,
            RejectReason::Other(code) => code,
            RejectReason::Unresolved => 0,
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let side = match self.side {
            Side::Local => "client",
            Side::Remote => "server",
        };
        match self.reason {
            RejectReason::SlotsFull => write!(f, "{side} reject (slots full)"),
            RejectReason::Other(code) => write!(f, "{side} unknown ({code})"),
            RejectReason::Unresolved => write!(f, "unresolved {side}"),
        }
    }
}

/// Why a binary message was refused by the framer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BadPacketReason {
    /// Declared payload length outside `0..=max`.
    InvalidLength {
        /// Declared length.
        length: u32,
        /// Configured maximum.
        max: u32,
    },
    /// Hops byte is negative when read as signed.
    NegativeHops(u8),
    /// Hops reached the connection's soft max.
    HopsOverSoftMax {
        /// Hops carried by the message.
        hops: u8,
        /// Soft max in effect.
        soft_max: u8,
    },
    /// `ttl + hops` above the hard protocol maximum.
    HardMaxExceeded {
        /// TTL carried by the message.
        ttl: u8,
        /// Hops carried by the message.
        hops: u8,
    },
    /// Opcode not known to this implementation.
    UnknownOpcode(u8),
    /// Payload shorter than the opcode requires.
    Undersized {
        /// Opcode byte.
        opcode: u8,
        /// Payload length received.
        actual: usize,
        /// Minimum payload length.
        expected: usize,
    },
    /// Vendor message not sent with `ttl == 1 && hops == 0`.
    VendorTtlHops {
        /// TTL carried by the message.
        ttl: u8,
        /// Hops carried by the message.
        hops: u8,
    },
}

impl BadPacketReason {
    /// Whether the stream can no longer be trusted after this packet.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BadPacketReason::InvalidLength { .. } | BadPacketReason::VendorTtlHops { .. }
        )
    }
}

impl std::fmt::Display for BadPacketReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BadPacketReason::InvalidLength { length, max } => {
                write!(f, "payload length {length} outside 0..={max}")
            },
            BadPacketReason::NegativeHops(hops) => write!(f, "negative hops ({hops})"),
            BadPacketReason::HopsOverSoftMax { hops, soft_max } => {
                write!(f, "hops {hops} over soft max {soft_max}")
            },
            BadPacketReason::HardMaxExceeded { ttl, hops } => {
                write!(f, "ttl {ttl} + hops {hops} over hard max")
            },
            BadPacketReason::UnknownOpcode(op) => write!(f, "unknown opcode 0x{op:02x}"),
            BadPacketReason::Undersized {
                opcode,
                actual,
                expected,
            } => write!(
                f,
                "opcode 0x{opcode:02x} payload too short: {actual} < {expected}"
            ),
            BadPacketReason::VendorTtlHops { ttl, hops } => {
                write!(f, "vendor message with ttl {ttl} hops {hops}")
            },
        }
    }
}
