//! Handshake line codec.
//!
//! Handshake traffic is line oriented. Every line ends in `\n`, usually
//! preceded by `\r`:
//!
//! ```text
//! GNUTELLA CONNECT/0.6          <- connect line (incoming side reads it)
//! GNUTELLA/0.6 200 OK           <- status line
//! User-Agent: LimeWire/4.18     <- header lines, any order
//!                               <- blank line ends the group
//! ```
//!
//! Reading works on a [`BytesMut`] that the caller keeps filling; a line that
//! is not yet complete stays in the buffer and `None` is returned.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{GnutellaError, Result};

/// Connect line sent by the outgoing side.
pub const CONNECT_LINE: &str = "GNUTELLA CONNECT/0.6";

/// Protocol token starting every status line.
pub const PROTOCOL_TOKEN: &str = "GNUTELLA/0.6";

const CRLF: &[u8] = b"\r\n";

/// Well-known header names.
pub mod names {
    /// Address the sender sees us connecting from.
    pub const REMOTE_IP: &str = "Remote-IP";
    /// Address the sender accepts connections on (`host:port`).
    pub const LISTEN_IP: &str = "Listen-IP";
    /// Older spelling of [`LISTEN_IP`].
    pub const MY_ADDRESS: &str = "X-My-Address";
    /// Client identification.
    pub const USER_AGENT: &str = "User-Agent";
    /// `true` for ultrapeers, `false` for leaves.
    pub const ULTRAPEER: &str = "X-Ultrapeer";
    /// Number of ultrapeer connections the sender keeps.
    pub const DEGREE: &str = "X-Degree";
    /// Query routing between ultrapeers.
    pub const ULTRAPEER_QUERY_ROUTING: &str = "X-Ultrapeer-Query-Routing";
    /// Highest TTL the sender accepts.
    pub const MAX_TTL: &str = "X-Max-TTL";
    /// Dynamic querying support.
    pub const DYNAMIC_QUERY: &str = "X-Dynamic-Querying";
    /// Whether the sender re-sends queries.
    pub const REQUERIES: &str = "X-Requeries";
    /// Encoding of the stream the sender writes.
    pub const CONTENT_ENCODING: &str = "Content-Encoding";
    /// Encodings the sender can read.
    pub const ACCEPT_ENCODING: &str = "Accept-Encoding";
    /// Sent by topology crawlers.
    pub const CRAWLER: &str = "Crawler";
    /// Short-lived connection.
    pub const TEMP_CONNECTION: &str = "X-Temp-Connection";
    /// GGEP extension support.
    pub const GGEP: &str = "GGEP";
}

/// Ordered header map with case-insensitive lookup.
///
/// Inserting an existing name replaces its value in place, so a map that
/// accumulates several rounds keeps the first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// Insert or replace a header.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Look up a header value.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether a header is present.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Merge `other` into `self`, replacing existing names.
    pub fn extend_from(&mut self, other: &Headers) {
        for (name, value) in other.iter() {
            self.insert(name, value);
        }
    }

    /// Iterate `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// One parsed line of a header group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderLine {
    /// `Name: Value`
    Header {
        /// Header name, untrimmed left side of the first colon.
        name: String,
        /// Trimmed value.
        value: String,
    },
    /// Blank line.
    EndOfHeaders,
    /// Line without a colon; tolerated and ignored.
    Skipped(String),
}

/// Parse a single header line (without its terminator).
pub fn parse_header_line(line: &str) -> HeaderLine {
    if line.is_empty() {
        return HeaderLine::EndOfHeaders;
    }
    match line.split_once(':') {
        Some((name, value)) => HeaderLine::Header {
            name: name.to_string(),
            value: value.trim().to_string(),
        },
        None => HeaderLine::Skipped(line.to_string()),
    }
}

/// Take one complete line off the front of `buf`.
///
/// Returns `Ok(None)` when no terminator has arrived yet. `\r` before the
/// `\n` is optional. Lines over `max_len` bytes are a protocol violation.
pub fn take_line(buf: &mut BytesMut, max_len: usize) -> Result<Option<String>> {
    let Some(pos) = buf.iter().position(|&b| b == b'\n') else {
        if buf.len() > max_len {
            return Err(GnutellaError::BadHandshake(format!(
                "header line longer than {max_len} bytes"
            )));
        }
        return Ok(None);
    };

    let mut line = buf.split_to(pos);
    buf.advance(1);
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
    if line.len() > max_len {
        return Err(GnutellaError::BadHandshake(format!(
            "header line longer than {max_len} bytes"
        )));
    }
    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
}

/// Read the next header line from `buf`, if one is complete.
pub fn read_header_line(buf: &mut BytesMut, max_len: usize) -> Result<Option<HeaderLine>> {
    Ok(take_line(buf, max_len)?.map(|line| parse_header_line(&line)))
}

/// Append a raw line plus CRLF.
pub fn write_line(sink: &mut impl BufMut, line: &str) {
    sink.put_slice(line.as_bytes());
    sink.put_slice(CRLF);
}

/// Append `Name: Value` plus CRLF.
pub fn write_header_line(sink: &mut impl BufMut, name: &str, value: &str) {
    sink.put_slice(name.as_bytes());
    sink.put_slice(b": ");
    sink.put_slice(value.as_bytes());
    sink.put_slice(CRLF);
}

/// Append the blank line that closes a header group.
pub fn write_end_of_headers(sink: &mut impl BufMut) {
    sink.put_slice(CRLF);
}

/// Format a status line: `GNUTELLA/0.6 <code> <message>`.
pub fn status_line(code: u16, message: &str) -> String {
    format!("{PROTOCOL_TOKEN} {code} {message}")
}

/// Check a connect line and return its protocol version.
///
/// The version is the floating-point text after `CONNECT/`; anything that
/// does not parse, or is below 0.6, is rejected with the line preserved.
pub fn parse_connect_line(line: &str) -> Result<f32> {
    let unexpected = || GnutellaError::BadHandshake(format!("Unexpected connect string: {line}"));
    let idx = line.find("CONNECT/").ok_or_else(unexpected)?;
    let version: f32 = line[idx + "CONNECT/".len()..]
        .trim()
        .parse()
        .map_err(|_| unexpected())?;
    if version < 0.6 {
        return Err(unexpected());
    }
    Ok(version)
}

/// Parse a status line into its code and message.
pub fn parse_status_line(line: &str) -> Result<(u16, String)> {
    let Some(rest) = line.strip_prefix(PROTOCOL_TOKEN) else {
        return Err(GnutellaError::BadHandshake(format!(
            "Bad connect string: {line}"
        )));
    };
    let rest = rest.trim();
    let (code, message) = rest.split_once(' ').unwrap_or((rest, ""));
    let code = code.parse::<u16>().map_err(|_| {
        GnutellaError::BadHandshake(format!("non-numeric status code in: {line}"))
    })?;
    Ok((code, message.trim().to_string()))
}

/// Parse a version-like header value (`0.1`, `1.0`), defaulting to 0.
pub fn parse_version(value: &str) -> f32 {
    value.trim().parse().unwrap_or(0.0)
}
