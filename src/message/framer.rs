//! Message framing: 23-byte header plus payload.
//!
//! [`Framer`] validates headers and encodes messages, and offers a one-shot
//! blocking read over any [`Read`]. [`MessageDecoder`] is the incremental
//! variant for the readiness loop: it remembers a parsed header across calls
//! and returns `Ok(None)` until the whole payload is buffered.
//!
//! Hop and TTL rules applied to every decoded message, in order:
//!
//! | Check                                  | Result                    |
//! |----------------------------------------|---------------------------|
//! | `length > max_payload`                 | fatal bad packet          |
//! | `hops > 127`                           | bad packet                |
//! | `ttl > 127`                            | dropped silently          |
//! | `hops >= soft_max`, not a reply        | bad packet                |
//! | `ttl + hops > hard_max`                | bad packet                |
//! | `ttl + hops > soft_max`, not a reply   | `ttl = soft_max - hops`   |

use std::io::{self, Read};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{Guid, Message, MessageKind, Opcode, HEADER_LEN};
use crate::config::MessageConfig;
use crate::error::{BadPacketReason, GnutellaError, Result};

/// Output of a successful decode step.
#[derive(Debug, Clone)]
pub enum Decoded {
    /// A valid message.
    Message(Message),
    /// A frame that is discarded without being an error (negative TTL).
    Dropped,
}

#[derive(Debug, Clone, Copy)]
struct RawHeader {
    guid: [u8; 16],
    opcode: u8,
    ttl: u8,
    hops: u8,
    length: u32,
}

/// Stateless header validation and encoding.
#[derive(Debug, Clone, Copy)]
pub struct Framer {
    max_payload: u32,
    soft_max: u8,
    hard_max: u8,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new(&MessageConfig::default())
    }
}

impl Framer {
    /// Framer using the configured limits.
    pub fn new(config: &MessageConfig) -> Self {
        Self {
            max_payload: config.max_payload,
            soft_max: config.soft_max_ttl,
            hard_max: config.hard_max_ttl,
        }
    }

    /// Replace the soft max, e.g. with a connection's negotiated value.
    pub fn with_soft_max(mut self, soft_max: u8) -> Self {
        self.soft_max = soft_max;
        self
    }

    /// Soft max in effect.
    pub fn soft_max(&self) -> u8 {
        self.soft_max
    }

    /// Largest accepted payload.
    pub fn max_payload(&self) -> u32 {
        self.max_payload
    }

    /// Append `message` in wire format to `dst`.
    pub fn encode(&self, message: &Message, dst: &mut BytesMut) -> Result<()> {
        let len = message.len();
        if len > self.max_payload as usize {
            return Err(GnutellaError::BadPacket(BadPacketReason::InvalidLength {
                length: u32::try_from(len).unwrap_or(u32::MAX),
                max: self.max_payload,
            }));
        }
        dst.reserve(HEADER_LEN + len);
        dst.put_slice(message.guid().as_bytes());
        dst.put_u8(message.opcode().as_byte());
        dst.put_u8(message.ttl());
        dst.put_u8(message.hops());
        dst.put_u32_le(len as u32);
        dst.put_slice(message.payload());
        Ok(())
    }

    /// Read one message from a blocking stream.
    ///
    /// Returns `Ok(None)` when the stream's read timeout expires before the
    /// first header byte arrives. A timeout or end-of-stream after that is
    /// an I/O error.
    pub fn read_message<R: Read>(&self, reader: &mut R) -> Result<Option<Decoded>> {
        let mut header = [0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            match reader.read(&mut header[filled..]) {
                Ok(0) => {
                    return Err(GnutellaError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    )))
                },
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) if filled == 0 && is_timeout(&e) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }

        let raw = self.parse_header(&header)?;
        let mut payload = vec![0u8; raw.length as usize];
        reader.read_exact(&mut payload)?;
        self.build(raw, Bytes::from(payload)).map(Some)
    }

    fn parse_header(&self, bytes: &[u8]) -> Result<RawHeader> {
        let mut buf = bytes;
        let mut guid = [0u8; 16];
        buf.copy_to_slice(&mut guid);
        let opcode = buf.get_u8();
        let ttl = buf.get_u8();
        let hops = buf.get_u8();
        let length = buf.get_u32_le();
        if length > self.max_payload {
            return Err(GnutellaError::BadPacket(BadPacketReason::InvalidLength {
                length,
                max: self.max_payload,
            }));
        }
        Ok(RawHeader {
            guid,
            opcode,
            ttl,
            hops,
            length,
        })
    }

    fn build(&self, raw: RawHeader, payload: Bytes) -> Result<Decoded> {
        fn bad(reason: BadPacketReason) -> Result<Decoded> {
            Err(GnutellaError::BadPacket(reason))
        }

        if raw.hops > i8::MAX as u8 {
            return bad(BadPacketReason::NegativeHops(raw.hops));
        }
        if raw.ttl > i8::MAX as u8 {
            return Ok(Decoded::Dropped);
        }

        let opcode = Opcode::try_from(raw.opcode);
        let reply = matches!(opcode, Ok(op) if op.is_reply());
        let mut ttl = raw.ttl;
        if raw.hops >= self.soft_max && !reply {
            return bad(BadPacketReason::HopsOverSoftMax {
                hops: raw.hops,
                soft_max: self.soft_max,
            });
        }
        let total = u16::from(raw.ttl) + u16::from(raw.hops);
        if total > u16::from(self.hard_max) {
            return bad(BadPacketReason::HardMaxExceeded {
                ttl: raw.ttl,
                hops: raw.hops,
            });
        }
        if total > u16::from(self.soft_max) && !reply {
            ttl = self.soft_max - raw.hops;
        }

        let opcode = match opcode {
            Ok(op) => op,
            Err(reason) => return bad(reason),
        };
        let expected = opcode.min_payload();
        let undersized = BadPacketReason::Undersized {
            opcode: raw.opcode,
            actual: payload.len(),
            expected,
        };
        if payload.len() < expected {
            return bad(undersized);
        }
        let Some(kind) = MessageKind::from_parts(opcode, &payload) else {
            return bad(undersized);
        };
        if matches!(kind, MessageKind::Vendor { .. }) && (ttl != 1 || raw.hops != 0) {
            return bad(BadPacketReason::VendorTtlHops {
                ttl,
                hops: raw.hops,
            });
        }

        Ok(Decoded::Message(Message::new(
            Guid(raw.guid),
            kind,
            ttl,
            raw.hops,
            payload,
        )))
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Incremental decoder that resumes across partial reads.
#[derive(Debug)]
pub struct MessageDecoder {
    framer: Framer,
    header: Option<RawHeader>,
}

impl MessageDecoder {
    /// Create a decoder.
    pub fn new(framer: Framer) -> Self {
        Self {
            framer,
            header: None,
        }
    }

    /// Framer used for validation.
    pub fn framer(&self) -> &Framer {
        &self.framer
    }

    /// Whether a header has been consumed and its payload is pending.
    pub fn is_mid_message(&self) -> bool {
        self.header.is_some()
    }

    /// Decode the next frame from `src`, consuming exactly its bytes.
    ///
    /// `Ok(None)` means more input is needed; whatever was consumed so far
    /// is remembered for the next call.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Decoded>> {
        let raw = match self.header {
            Some(raw) => raw,
            None => {
                if src.len() < HEADER_LEN {
                    return Ok(None);
                }
                let raw = self.framer.parse_header(&src[..HEADER_LEN])?;
                src.advance(HEADER_LEN);
                self.header = Some(raw);
                raw
            },
        };

        let len = raw.length as usize;
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }
        let payload = src.split_to(len).freeze();
        self.header = None;
        self.framer.build(raw, payload).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use proptest::prelude::*;

    fn framer(soft_max: u8) -> Framer {
        Framer::default().with_soft_max(soft_max)
    }

    fn raw_frame(opcode: u8, ttl: u8, hops: u8, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_slice(&[0xAB; 16]);
        buf.put_u8(opcode);
        buf.put_u8(ttl);
        buf.put_u8(hops);
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(payload);
        buf
    }

    fn decode_all(framer: Framer, bytes: &[u8]) -> Result<Option<Decoded>> {
        let mut decoder = MessageDecoder::new(framer);
        let mut buf = BytesMut::from(bytes);
        decoder.decode(&mut buf)
    }

    fn expect_message(res: Result<Option<Decoded>>) -> Message {
        match res {
            Ok(Some(Decoded::Message(m))) => m,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    #[test]
    fn test_wire_layout() {
        let msg = Message::new(
            Guid([0x11; 16]),
            MessageKind::Query,
            2,
            1,
            Bytes::from_static(b"\x00\x00a\x00"),
        );
        let mut buf = BytesMut::new();
        framer(3).encode(&msg, &mut buf).unwrap();
        assert_eq!(
            &buf[..],
            &hex!(
                "11111111111111111111111111111111" // guid
                "80 02 01"                         // opcode ttl hops
                "04000000"                         // length
                "00006100"                         // payload
            )[..]
        );
    }

    #[test]
    fn test_roundtrip_boundary_sizes() {
        let f = framer(3);
        let max = f.max_payload() as usize;
        for size in [0usize, 1, max - 1, max] {
            let msg = Message::new(Guid::new(), MessageKind::Ping, 1, 0, vec![7u8; size]);
            let mut buf = BytesMut::new();
            f.encode(&msg, &mut buf).unwrap();
            let decoded = expect_message(decode_all(f, &buf));
            assert_eq!(decoded.guid(), msg.guid());
            assert_eq!(decoded.opcode(), Opcode::Ping);
            assert_eq!(decoded.ttl(), 1);
            assert_eq!(decoded.hops(), 0);
            assert_eq!(decoded.payload(), msg.payload());
        }
    }

    #[test]
    fn test_rejects_oversized() {
        let f = framer(3);
        let max = f.max_payload() as usize;
        let msg = Message::new(Guid::new(), MessageKind::Ping, 1, 0, vec![0u8; max + 1]);
        assert!(f.encode(&msg, &mut BytesMut::new()).is_err());

        let mut header = raw_frame(0x00, 1, 0, &[]);
        header[19..23].copy_from_slice(&(max as u32 + 1).to_le_bytes());
        let err = decode_all(f, &header).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_soft_max_clamp() {
        let frame = raw_frame(0x80, 10, 3, b"\x00\x00abc\x00");
        let msg = expect_message(decode_all(framer(5), &frame));
        assert_eq!(msg.ttl(), 2);
        assert_eq!(msg.hops(), 3);
    }

    #[test]
    fn test_hops_over_soft_max() {
        let frame = raw_frame(0x80, 1, 6, b"\x00\x00abc\x00");
        let err = decode_all(framer(5), &frame).unwrap_err();
        assert!(matches!(
            err,
            GnutellaError::BadPacket(BadPacketReason::HopsOverSoftMax {
                hops: 6,
                soft_max: 5
            })
        ));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_replies_exempt_from_soft_max() {
        let frame = raw_frame(0x01, 2, 6, &[0u8; 14]);
        let msg = expect_message(decode_all(framer(5), &frame));
        assert_eq!(msg.ttl(), 2);
        assert_eq!(msg.hops(), 6);
    }

    #[test]
    fn test_hard_max() {
        let frame = raw_frame(0x01, 10, 5, &[0u8; 14]);
        assert!(matches!(
            decode_all(framer(5), &frame),
            Err(GnutellaError::BadPacket(BadPacketReason::HardMaxExceeded { .. }))
        ));
    }

    #[test]
    fn test_negative_hops_and_ttl() {
        let frame = raw_frame(0x00, 1, 0x80, &[]);
        assert!(matches!(
            decode_all(framer(5), &frame),
            Err(GnutellaError::BadPacket(BadPacketReason::NegativeHops(0x80)))
        ));

        let frame = raw_frame(0x00, 0xFF, 0, &[]);
        assert!(matches!(
            decode_all(framer(5), &frame),
            Ok(Some(Decoded::Dropped))
        ));
    }

    #[test]
    fn test_unknown_opcode_keeps_alignment() {
        let mut buf = raw_frame(0x99, 1, 0, b"junk");
        buf.extend_from_slice(&raw_frame(0x00, 1, 0, &[]));
        let mut decoder = MessageDecoder::new(framer(3));
        let err = decoder.decode(&mut buf).unwrap_err();
        assert!(!err.is_fatal());
        let msg = expect_message(decoder.decode(&mut buf));
        assert_eq!(msg.opcode(), Opcode::Ping);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_undersized_payloads() {
        let cases: [(u8, usize); 5] = [(0x01, 13), (0x80, 2), (0x81, 25), (0x40, 25), (0x30, 0)];
        for (opcode, len) in cases {
            let frame = raw_frame(opcode, 1, 0, &vec![0u8; len]);
            assert!(
                matches!(
                    decode_all(framer(3), &frame),
                    Err(GnutellaError::BadPacket(BadPacketReason::Undersized { .. }))
                ),
                "opcode 0x{opcode:02x}"
            );
        }
    }

    #[test]
    fn test_vendor_ttl_hops() {
        let payload = b"BEAR\x04\x00\x01\x00\x03";
        let ok = raw_frame(0x31, 1, 0, payload);
        let msg = expect_message(decode_all(framer(3), &ok));
        assert_eq!(msg.hops_flow_value(), Some(3));

        let bad = raw_frame(0x31, 2, 0, payload);
        let err = decode_all(framer(3), &bad).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_read_message_blocking() {
        let msg = Message::query(2, 0, "blocking");
        let mut buf = BytesMut::new();
        framer(3).encode(&msg, &mut buf).unwrap();
        let mut reader = std::io::Cursor::new(buf.to_vec());
        let decoded = match framer(3).read_message(&mut reader).unwrap() {
            Some(Decoded::Message(m)) => m,
            other => panic!("unexpected: {other:?}"),
        };
        assert_eq!(decoded.guid(), msg.guid());

        let err = framer(3).read_message(&mut reader).unwrap_err();
        assert!(matches!(err, GnutellaError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[test]
    fn test_read_message_truncated_payload() {
        let frame = raw_frame(0x80, 1, 0, b"\x00\x00abc\x00");
        let mut reader = std::io::Cursor::new(frame[..frame.len() - 2].to_vec());
        assert!(framer(3).read_message(&mut reader).is_err());
    }

    proptest! {
        #[test]
        fn prop_byte_at_a_time_matches_whole(
            payload in proptest::collection::vec(any::<u8>(), 0..512),
            ttl in 0u8..3,
        ) {
            let f = framer(3);
            let msg = Message::new(Guid::new(), MessageKind::Ping, ttl, 0, payload);
            let mut wire = BytesMut::new();
            f.encode(&msg, &mut wire).unwrap();

            let whole = expect_message(decode_all(f, &wire));

            let mut decoder = MessageDecoder::new(f);
            let mut buf = BytesMut::new();
            let mut result = None;
            for (i, b) in wire.iter().enumerate() {
                buf.put_u8(*b);
                match decoder.decode(&mut buf).unwrap() {
                    Some(Decoded::Message(m)) => {
                        prop_assert_eq!(i, wire.len() - 1);
                        result = Some(m);
                    },
                    Some(Decoded::Dropped) => prop_assert!(false, "unexpected drop"),
                    None => {},
                }
            }
            let piecewise = result.expect("message decoded");
            prop_assert_eq!(piecewise.guid(), whole.guid());
            prop_assert_eq!(piecewise.ttl(), whole.ttl());
            prop_assert_eq!(piecewise.hops(), whole.hops());
            prop_assert_eq!(piecewise.payload(), whole.payload());
        }
    }
}
