//! Gnutella 0.6 connection handshake.
//!
//! Handshakes are an HTTP-like exchange of status lines and headers that
//! runs before binary messaging starts. This module holds the line codec
//! ([`header`]), the response snapshot with its header-derived peer
//! properties ([`HandshakeResponse`]), the pluggable [`Responder`] and the
//! sans-IO [`Handshaker`] state machine.
//!
//! # Status Codes
//!
//! | Code | Meaning                          |
//! |------|----------------------------------|
//! | 200  | OK (`OK, authenticating` loops)  |
//! | 401  | Unauthorized, loops again        |
//! | 503  | Slots full, try again later      |
//! | 577  | Locale mismatch                  |
//! | 593  | Crawler answer                   |
//! | any  | Generic rejection                |

pub mod header;
mod machine;
mod responder;
mod response;

pub use header::{HeaderLine, Headers};
pub use machine::{Conclusion, Direction, HandshakeOutcome, HandshakeState, Handshaker};
pub use responder::{Responder, StaticResponder};
pub use response::{HandshakeResponse, StatusCode, AUTHENTICATING_MESSAGE, OK_MESSAGE};
