//! Handshake responses and the peer properties derived from their headers.

use std::net::SocketAddr;

use super::header::{names, parse_version, Headers};

/// Numeric handshake status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(pub u16);

impl StatusCode {
    /// Connection accepted.
    pub const OK: StatusCode = StatusCode(200);
    /// Credentials required.
    pub const UNAUTHORIZED: StatusCode = StatusCode(401);
    /// No free connection slots.
    pub const SLOTS_FULL: StatusCode = StatusCode(503);
    /// Peer's locale does not match ours.
    pub const LOCALE_NO_MATCH: StatusCode = StatusCode(577);
    /// Answer sent to crawlers.
    pub const CRAWLER: StatusCode = StatusCode(593);

    /// Whether the handshake may proceed with this code.
    pub fn is_ok_or_unauthorized(self) -> bool {
        self == Self::OK || self == Self::UNAUTHORIZED
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical reason text for a final OK.
pub const OK_MESSAGE: &str = "OK";

/// Reason text for an intermediate OK while credentials are checked.
pub const AUTHENTICATING_MESSAGE: &str = "OK, authenticating";

/// Immutable snapshot of one side's status plus headers.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeResponse {
    code: StatusCode,
    message: String,
    headers: Headers,
}

impl HandshakeResponse {
    /// Create a response with an explicit status.
    pub fn new(code: u16, message: impl Into<String>, headers: Headers) -> Self {
        Self {
            code: StatusCode(code),
            message: message.into(),
            headers,
        }
    }

    /// Final acceptance.
    pub fn ok(headers: Headers) -> Self {
        Self::new(StatusCode::OK.0, OK_MESSAGE, headers)
    }

    /// Intermediate acceptance; another round follows.
    pub fn authenticating(headers: Headers) -> Self {
        Self::new(StatusCode::OK.0, AUTHENTICATING_MESSAGE, headers)
    }

    /// Ask the peer for credentials.
    pub fn unauthorized(headers: Headers) -> Self {
        Self::new(StatusCode::UNAUTHORIZED.0, "Unauthorized", headers)
    }

    /// Refuse because all slots are taken.
    pub fn slots_full(headers: Headers) -> Self {
        Self::new(StatusCode::SLOTS_FULL.0, "Service unavailable", headers)
    }

    /// Refuse a crawler politely.
    pub fn crawler(headers: Headers) -> Self {
        Self::new(StatusCode::CRAWLER.0, "Hi", headers)
    }

    /// Refuse because locales differ.
    pub fn locale_no_match(headers: Headers) -> Self {
        Self::new(StatusCode::LOCALE_NO_MATCH.0, "Service unavailable", headers)
    }

    /// Refuse with an arbitrary code.
    pub fn reject(code: u16, message: impl Into<String>, headers: Headers) -> Self {
        Self::new(code, message, headers)
    }

    /// Snapshot of the headers an incoming connection sent before any
    /// status line exists.
    pub fn from_request(headers: Headers) -> Self {
        Self::ok(headers)
    }

    /// Status code.
    pub fn code(&self) -> StatusCode {
        self.code
    }

    /// Status reason text.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Consume into the header map.
    pub fn into_headers(self) -> Headers {
        self.headers
    }

    /// Whether the code is 200.
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::OK
    }

    /// Whether this is the final "200 OK" (not an intermediate OK).
    pub fn is_final_ok(&self) -> bool {
        self.is_ok() && self.message == OK_MESSAGE
    }

    /// Whether the code is 401.
    pub fn is_unauthorized(&self) -> bool {
        self.code == StatusCode::UNAUTHORIZED
    }

    /// Whether the code is 503.
    pub fn is_slots_full(&self) -> bool {
        self.code == StatusCode::SLOTS_FULL
    }

    fn header_is(&self, name: &str, expected: &str) -> bool {
        self.headers
            .get(name)
            .is_some_and(|v| v.trim().eq_ignore_ascii_case(expected))
    }

    fn version_at_least(&self, name: &str, min: f32) -> bool {
        self.headers
            .get(name)
            .is_some_and(|v| parse_version(v) >= min)
    }

    /// `X-Ultrapeer: true`
    pub fn is_ultrapeer(&self) -> bool {
        self.header_is(names::ULTRAPEER, "true")
    }

    /// `X-Ultrapeer: false`
    pub fn is_leaf(&self) -> bool {
        self.header_is(names::ULTRAPEER, "false")
    }

    /// Whether the sender writes a deflated stream.
    pub fn is_deflate_enabled(&self) -> bool {
        self.header_is(names::CONTENT_ENCODING, "deflate")
    }

    /// Whether the sender can read a deflated stream.
    pub fn is_deflate_accepted(&self) -> bool {
        self.headers.get(names::ACCEPT_ENCODING).is_some_and(|v| {
            v.split(',')
                .any(|enc| enc.trim().eq_ignore_ascii_case("deflate"))
        })
    }

    /// Whether the sender announced itself as a crawler.
    pub fn is_crawler(&self) -> bool {
        self.version_at_least(names::CRAWLER, 0.1)
    }

    /// `User-Agent` value.
    pub fn user_agent(&self) -> Option<&str> {
        self.headers.get(names::USER_AGENT)
    }

    /// Whether the sender is a LimeWire client.
    pub fn is_limewire(&self) -> bool {
        self.user_agent()
            .is_some_and(|ua| ua.to_ascii_lowercase().starts_with("limewire"))
    }

    /// Declared ultrapeer degree, 6 when absent.
    pub fn degree(&self) -> u32 {
        self.headers
            .get(names::DEGREE)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(6)
    }

    /// Whether the sender keeps at least 15 ultrapeer connections.
    pub fn is_high_degree(&self) -> bool {
        self.degree() >= 15
    }

    /// Whether query routing between ultrapeers is supported.
    pub fn is_ultrapeer_query_routing(&self) -> bool {
        self.version_at_least(names::ULTRAPEER_QUERY_ROUTING, 0.1)
    }

    /// Highest TTL the sender accepts, 4 when absent.
    pub fn max_ttl(&self) -> u8 {
        self.headers
            .get(names::MAX_TTL)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(4)
    }

    /// Whether dynamic querying is supported.
    pub fn is_dynamic_querying(&self) -> bool {
        self.version_at_least(names::DYNAMIC_QUERY, 0.1)
    }

    /// Whether the sender re-sends queries.
    pub fn is_requerying(&self) -> bool {
        !self.header_is(names::REQUERIES, "false")
    }

    /// Modern ultrapeer: high degree, QRP, low TTL, dynamic querying.
    pub fn is_good_ultrapeer(&self) -> bool {
        self.is_high_degree()
            && self.is_ultrapeer_query_routing()
            && self.max_ttl() < 5
            && self.is_dynamic_querying()
    }

    /// Leaf running modern ultrapeer-capable software that behaves.
    pub fn is_good_leaf(&self) -> bool {
        self.is_good_ultrapeer() && (self.is_limewire() || !self.is_requerying())
    }

    /// `X-Temp-Connection: true`
    pub fn is_temporary(&self) -> bool {
        self.header_is(names::TEMP_CONNECTION, "true")
    }

    /// Whether GGEP extensions are supported.
    pub fn supports_ggep(&self) -> bool {
        self.version_at_least(names::GGEP, 0.5)
    }

    /// Listening address declared through `Listen-IP` or `X-My-Address`.
    ///
    /// Malformed values yield `None`.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.headers
            .get(names::LISTEN_IP)
            .or_else(|| self.headers.get(names::MY_ADDRESS))
            .and_then(|v| v.trim().parse().ok())
    }
}
