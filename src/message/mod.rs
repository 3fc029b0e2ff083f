//! Binary Gnutella messages.
//!
//! Every message starts with a fixed 23-byte header:
//!
//! ```text
//! ┌──────────────────┬────────┬─────┬──────┬──────────────────┐
//! │ GUID (16 bytes)  │ opcode │ TTL │ hops │ length (u32, LE) │
//! └──────────────────┴────────┴─────┴──────┴──────────────────┘
//!   0              15    16     17    18     19            22
//! ```
//!
//! followed by `length` payload bytes. Payloads are carried opaquely; only
//! the few fields needed for routing and flow control are interpreted.

pub mod framer;

use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::BadPacketReason;

pub use framer::{Decoded, Framer, MessageDecoder};

/// Size of the fixed message header.
pub const HEADER_LEN: usize = 23;

/// 16-byte globally unique message identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    /// Generate a fresh GUID marked as coming from a modern client.
    pub fn new() -> Self {
        let mut bytes = *uuid::Uuid::new_v4().as_bytes();
        bytes[8] = 0xFF;
        bytes[15] = 0x00;
        Self(bytes)
    }

    /// Wrap raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Default for Guid {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02X}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Guid({self})")
    }
}

/// Message function byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Host discovery probe
    Ping = 0x00,
    /// Answer to a ping
    PingReply = 0x01,
    /// Query routing table reset or patch
    RouteTableUpdate = 0x30,
    /// Vendor-specific message, unstable format
    VendorUnstable = 0x31,
    /// Vendor-specific message, stable format
    VendorStable = 0x32,
    /// Firewalled-servent push request
    Push = 0x40,
    /// Search
    Query = 0x80,
    /// Search results
    QueryReply = 0x81,
}

impl Opcode {
    /// Raw byte.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Replies are exempt from the soft-max hop check.
    pub fn is_reply(self) -> bool {
        matches!(self, Opcode::PingReply | Opcode::QueryReply)
    }

    /// Smallest valid payload for this opcode.
    pub fn min_payload(self) -> usize {
        match self {
            Opcode::Ping => 0,
            Opcode::PingReply => 14,
            Opcode::RouteTableUpdate => 1,
            Opcode::VendorUnstable | Opcode::VendorStable => VendorHeader::LEN,
            Opcode::Push => 26,
            Opcode::Query => 3,
            Opcode::QueryReply => 26,
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = BadPacketReason;

    fn try_from(b: u8) -> std::result::Result<Self, Self::Error> {
        match b {
            0x00 => Ok(Opcode::Ping),
            0x01 => Ok(Opcode::PingReply),
            0x30 => Ok(Opcode::RouteTableUpdate),
            0x31 => Ok(Opcode::VendorUnstable),
            0x32 => Ok(Opcode::VendorStable),
            0x40 => Ok(Opcode::Push),
            0x80 => Ok(Opcode::Query),
            0x81 => Ok(Opcode::QueryReply),
            other => Err(BadPacketReason::UnknownOpcode(other)),
        }
    }
}

/// The 8-byte prefix of every vendor message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VendorHeader {
    /// Four-letter vendor code, e.g. `BEAR` or `LIME`.
    pub vendor: [u8; 4],
    /// Message selector within the vendor's namespace.
    pub selector: u16,
    /// Message version.
    pub version: u16,
}

impl VendorHeader {
    /// Encoded size.
    pub const LEN: usize = 8;

    /// Hops-flow advisory: `BEAR` selector 4.
    pub const HOPS_FLOW: VendorHeader = VendorHeader {
        vendor: *b"BEAR",
        selector: 4,
        version: 1,
    };

    fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < Self::LEN {
            return None;
        }
        Some(Self {
            vendor: [payload[0], payload[1], payload[2], payload[3]],
            selector: u16::from_le_bytes([payload[4], payload[5]]),
            version: u16::from_le_bytes([payload[6], payload[7]]),
        })
    }

    fn put(&self, dst: &mut BytesMut) {
        dst.put_slice(&self.vendor);
        dst.put_u16_le(self.selector);
        dst.put_u16_le(self.version);
    }

    /// Whether this is a hops-flow advisory of any version.
    pub fn is_hops_flow(&self) -> bool {
        self.vendor == Self::HOPS_FLOW.vendor && self.selector == Self::HOPS_FLOW.selector
    }
}

/// Decoded message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Ping
    Ping,
    /// Ping reply
    PingReply,
    /// Query
    Query,
    /// Query reply
    QueryReply,
    /// Push request
    Push,
    /// Route table update
    RouteTableUpdate,
    /// Vendor message
    Vendor {
        /// Parsed payload prefix.
        header: VendorHeader,
        /// Stable (0x32) or unstable (0x31) variant.
        stable: bool,
    },
}

impl MessageKind {
    /// Opcode for this kind.
    pub fn opcode(&self) -> Opcode {
        match self {
            MessageKind::Ping => Opcode::Ping,
            MessageKind::PingReply => Opcode::PingReply,
            MessageKind::Query => Opcode::Query,
            MessageKind::QueryReply => Opcode::QueryReply,
            MessageKind::Push => Opcode::Push,
            MessageKind::RouteTableUpdate => Opcode::RouteTableUpdate,
            MessageKind::Vendor { stable: true, .. } => Opcode::VendorStable,
            MessageKind::Vendor { stable: false, .. } => Opcode::VendorUnstable,
        }
    }

    /// Kind for a validated opcode and payload.
    pub(crate) fn from_parts(opcode: Opcode, payload: &[u8]) -> Option<Self> {
        Some(match opcode {
            Opcode::Ping => MessageKind::Ping,
            Opcode::PingReply => MessageKind::PingReply,
            Opcode::Query => MessageKind::Query,
            Opcode::QueryReply => MessageKind::QueryReply,
            Opcode::Push => MessageKind::Push,
            Opcode::RouteTableUpdate => MessageKind::RouteTableUpdate,
            Opcode::VendorStable | Opcode::VendorUnstable => MessageKind::Vendor {
                header: VendorHeader::parse(payload)?,
                stable: opcode == Opcode::VendorStable,
            },
        })
    }
}

/// One framed message.
#[derive(Debug, Clone)]
pub struct Message {
    guid: Guid,
    kind: MessageKind,
    ttl: u8,
    hops: u8,
    payload: Bytes,
    created_at: Instant,
    priority: u32,
    originated: bool,
}

impl Message {
    /// Create a message. For vendor kinds `payload` must include the
    /// 8-byte vendor header.
    pub fn new(guid: Guid, kind: MessageKind, ttl: u8, hops: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            guid,
            kind,
            ttl,
            hops,
            payload: payload.into(),
            created_at: Instant::now(),
            priority: 0,
            originated: false,
        }
    }

    /// Ping with an empty payload.
    pub fn ping(ttl: u8) -> Self {
        Self::new(Guid::new(), MessageKind::Ping, ttl, 0, Bytes::new())
    }

    /// Query for `text` with the given minimum speed.
    pub fn query(ttl: u8, min_speed: u16, text: &str) -> Self {
        let mut payload = BytesMut::with_capacity(3 + text.len());
        payload.put_u16_le(min_speed);
        payload.put_slice(text.as_bytes());
        payload.put_u8(0);
        Self::new(Guid::new(), MessageKind::Query, ttl, 0, payload.freeze())
    }

    /// Vendor message; the header is prepended to `data`.
    pub fn vendor(header: VendorHeader, stable: bool, data: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(VendorHeader::LEN + data.len());
        header.put(&mut payload);
        payload.put_slice(data);
        Self::new(
            Guid::new(),
            MessageKind::Vendor { header, stable },
            1,
            0,
            payload.freeze(),
        )
    }

    /// Hops-flow advisory asking the peer not to send queries with
    /// `hops >= max_hops`.
    pub fn hops_flow(max_hops: u8) -> Self {
        Self::vendor(VendorHeader::HOPS_FLOW, false, &[max_hops])
    }

    /// Set the queue priority hint (reply volume for query replies).
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Override the creation time used for queue expiry.
    pub fn with_created_at(mut self, created_at: Instant) -> Self {
        self.created_at = created_at;
        self
    }

    /// Mark as originated by this node.
    pub fn originated(mut self) -> Self {
        self.originated = true;
        self
    }

    /// GUID.
    pub fn guid(&self) -> Guid {
        self.guid
    }

    /// Decoded kind.
    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    /// Opcode.
    pub fn opcode(&self) -> Opcode {
        self.kind.opcode()
    }

    /// Time to live.
    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    /// Hops travelled.
    pub fn hops(&self) -> u8 {
        self.hops
    }

    /// Payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload length.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Total size on the wire.
    pub fn total_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// When the message was created or decoded.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Queue priority hint.
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Whether this node originated the message.
    pub fn is_originated(&self) -> bool {
        self.originated
    }

    /// Hop limit carried by a hops-flow advisory.
    pub fn hops_flow_value(&self) -> Option<u8> {
        match self.kind {
            MessageKind::Vendor { header, .. } if header.is_hops_flow() => {
                self.payload.get(VendorHeader::LEN).copied()
            },
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guid_markers() {
        let guid = Guid::new();
        assert_eq!(guid.as_bytes()[8], 0xFF);
        assert_eq!(guid.as_bytes()[15], 0x00);
        assert_ne!(guid, Guid::new());
        assert_eq!(guid.to_string().len(), 32);
    }

    #[test]
    fn test_opcode_try_from() {
        assert_eq!(Opcode::try_from(0x81).unwrap(), Opcode::QueryReply);
        assert_eq!(Opcode::try_from(0x32).unwrap(), Opcode::VendorStable);
        assert_eq!(
            Opcode::try_from(0x41).unwrap_err(),
            BadPacketReason::UnknownOpcode(0x41)
        );
        assert!(Opcode::QueryReply.is_reply());
        assert!(!Opcode::Query.is_reply());
    }

    #[test]
    fn test_query_payload() {
        let q = Message::query(3, 0, "abc");
        assert_eq!(q.opcode(), Opcode::Query);
        assert_eq!(&q.payload()[..], b"\x00\x00abc\x00");
        assert!(q.len() >= Opcode::Query.min_payload());
    }

    #[test]
    fn test_hops_flow_vendor() {
        let m = Message::hops_flow(3);
        assert_eq!(m.opcode(), Opcode::VendorUnstable);
        assert_eq!(m.ttl(), 1);
        assert_eq!(m.hops(), 0);
        assert_eq!(&m.payload()[..4], b"BEAR");
        assert_eq!(m.hops_flow_value(), Some(3));
        assert_eq!(Message::ping(1).hops_flow_value(), None);
    }

    #[test]
    fn test_kind_from_parts() {
        let payload = [b'L', b'I', b'M', b'E', 5, 0, 2, 0];
        let kind = MessageKind::from_parts(Opcode::VendorStable, &payload).unwrap();
        assert_eq!(
            kind,
            MessageKind::Vendor {
                header: VendorHeader {
                    vendor: *b"LIME",
                    selector: 5,
                    version: 2
                },
                stable: true
            }
        );
        assert_eq!(kind.opcode(), Opcode::VendorStable);
        assert!(MessageKind::from_parts(Opcode::VendorStable, &payload[..4]).is_none());
    }
}
