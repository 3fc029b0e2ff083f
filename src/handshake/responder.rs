//! Pluggable handshake responders.

use super::header::Headers;
use super::response::HandshakeResponse;

/// Produces our side of each handshake round.
///
/// `peer` holds the peer's latest status and every header it has sent so far.
/// On the incoming side the first call happens before the peer has sent any
/// status line; `peer` then carries a synthetic 200 with the request headers.
pub trait Responder: Send + Sync {
    /// Compute our status and headers for this round.
    fn respond(&self, peer: &HandshakeResponse, outgoing: bool) -> HandshakeResponse;
}

impl<F> Responder for F
where
    F: Fn(&HandshakeResponse, bool) -> HandshakeResponse + Send + Sync,
{
    fn respond(&self, peer: &HandshakeResponse, outgoing: bool) -> HandshakeResponse {
        self(peer, outgoing)
    }
}

/// Always accepts, answering with a fixed header set.
#[derive(Debug, Clone, Default)]
pub struct StaticResponder {
    headers: Headers,
    reject_crawlers: bool,
}

impl StaticResponder {
    /// Create a responder answering with `headers`.
    pub fn new(headers: Headers) -> Self {
        Self {
            headers,
            reject_crawlers: false,
        }
    }

    /// Answer crawlers with status 593 instead of accepting them.
    pub fn with_crawler_rejection(mut self, enabled: bool) -> Self {
        self.reject_crawlers = enabled;
        self
    }
}

impl Responder for StaticResponder {
    fn respond(&self, peer: &HandshakeResponse, outgoing: bool) -> HandshakeResponse {
        if !outgoing && self.reject_crawlers && peer.is_crawler() {
            return HandshakeResponse::crawler(self.headers.clone());
        }
        HandshakeResponse::ok(self.headers.clone())
    }
}
