//! Sans-IO handshake state machine.
//!
//! The [`Handshaker`] never touches a socket. Drivers feed it received bytes
//! through [`Handshaker::handle_input`] and send whatever
//! [`Handshaker::poll_transmit`] hands back, so the same machine runs under
//! the blocking thread model and the readiness loop.
//!
//! ```text
//!  outgoing                                   incoming
//!  --------                                   --------
//!  CONNECT + headers  ───────────────────────> [AwaitingConnectLine]
//!                                              [ExchangingHeaders]
//!  [AwaitingPeerResponse] <─────────────────── status + headers (respond(.., false))
//!  [ExchangingHeaders]
//!  status + headers (respond(.., true)) ─────> [AwaitingPeerResponse]
//!  [Concluded]                                 [ExchangingHeaders]
//!                                              [Concluded]
//! ```
//!
//! A round that ends with an intermediate answer (`200 OK, authenticating`
//! or `401`) loops back to [`HandshakeState::AwaitingPeerResponse`]. After
//! `max_rounds` such rounds the handshake is unresolved.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use super::header::{
    self, names, parse_connect_line, parse_header_line, parse_status_line, take_line,
    write_end_of_headers, write_header_line, write_line, HeaderLine, Headers, CONNECT_LINE,
};
use super::responder::Responder;
use super::response::HandshakeResponse;
use crate::config::HandshakeConfig;
use crate::error::{GnutellaError, RejectReason, Rejection, Result, Side};

/// Which side opened the TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We connected to the peer.
    Outgoing,
    /// The peer connected to us.
    Incoming,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Outgoing => write!(f, "outgoing"),
            Direction::Incoming => write!(f, "incoming"),
        }
    }
}

/// How a handshake ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conclusion {
    /// Both sides agreed; binary messaging follows.
    Accepted,
    /// Nominal success with a crawler; the link must be dropped right away.
    AcceptedButDisconnect,
    /// One side refused.
    Rejected(Rejection),
}

/// Observable handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// [`Handshaker::start`] not called yet.
    Unstarted,
    /// Incoming side waiting for `GNUTELLA CONNECT/0.6`.
    AwaitingConnectLine,
    /// Reading a header group.
    ExchangingHeaders,
    /// Waiting for the peer's next status line.
    AwaitingPeerResponse,
    /// Finished with a verdict.
    Concluded(Conclusion),
    /// Protocol violation or other hard failure.
    Failed,
}

#[derive(Debug)]
enum Phase {
    Unstarted,
    ConnectLine,
    Headers {
        status: Option<(u16, String)>,
        count: usize,
    },
    Status,
    Done(Conclusion),
    Failed,
}

/// Result of a successful handshake.
#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    /// Accepted or accepted-but-disconnect.
    pub conclusion: Conclusion,
    /// Peer's final status with every header it sent.
    pub peer: HandshakeResponse,
    /// Our final status with every header we sent.
    pub ours: HandshakeResponse,
}

/// Drives one side of the Gnutella 0.6 handshake.
pub struct Handshaker {
    direction: Direction,
    config: HandshakeConfig,
    responder: Arc<dyn Responder>,
    request_headers: Headers,
    peer_ip: Option<IpAddr>,
    phase: Phase,
    round: usize,
    peer_status: (u16, String),
    own_status: (u16, String),
    peer_is_crawler: bool,
    awaiting_credentials: bool,
    headers_read: Headers,
    headers_written: Headers,
    remote_ips: Vec<String>,
    out: BytesMut,
}

impl Handshaker {
    /// Handshaker for a connection we opened.
    pub fn outgoing(
        config: HandshakeConfig,
        responder: Arc<dyn Responder>,
        request_headers: Headers,
        peer_ip: Option<IpAddr>,
    ) -> Self {
        Self::new(Direction::Outgoing, config, responder, request_headers, peer_ip)
    }

    /// Handshaker for a connection the peer opened.
    pub fn incoming(
        config: HandshakeConfig,
        responder: Arc<dyn Responder>,
        peer_ip: Option<IpAddr>,
    ) -> Self {
        Self::new(Direction::Incoming, config, responder, Headers::new(), peer_ip)
    }

    fn new(
        direction: Direction,
        config: HandshakeConfig,
        responder: Arc<dyn Responder>,
        request_headers: Headers,
        peer_ip: Option<IpAddr>,
    ) -> Self {
        Self {
            direction,
            config,
            responder,
            request_headers,
            peer_ip,
            phase: Phase::Unstarted,
            round: 0,
            peer_status: (0, String::new()),
            own_status: (0, String::new()),
            peer_is_crawler: false,
            awaiting_credentials: false,
            headers_read: Headers::new(),
            headers_written: Headers::new(),
            remote_ips: Vec::new(),
            out: BytesMut::new(),
        }
    }

    /// Begin the handshake. The outgoing side queues its connect request.
    pub fn start(&mut self) {
        if !matches!(self.phase, Phase::Unstarted) {
            return;
        }
        match self.direction {
            Direction::Outgoing => {
                write_line(&mut self.out, CONNECT_LINE);
                let request = std::mem::take(&mut self.request_headers);
                self.write_headers(&request);
                self.phase = Phase::Status;
            },
            Direction::Incoming => self.phase = Phase::ConnectLine,
        }
    }

    /// Side of the connection this handshaker drives.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        match &self.phase {
            Phase::Unstarted => HandshakeState::Unstarted,
            Phase::ConnectLine => HandshakeState::AwaitingConnectLine,
            Phase::Headers { .. } => HandshakeState::ExchangingHeaders,
            Phase::Status => HandshakeState::AwaitingPeerResponse,
            Phase::Done(c) => HandshakeState::Concluded(*c),
            Phase::Failed => HandshakeState::Failed,
        }
    }

    /// Whether a verdict has been reached or the handshake failed.
    pub fn is_finished(&self) -> bool {
        matches!(self.phase, Phase::Done(_) | Phase::Failed)
    }

    /// Timeout the driver should apply to its next read.
    pub fn read_timeout(&self) -> Duration {
        if self.awaiting_credentials {
            self.config.user_input_timeout()
        } else {
            self.config.timeout()
        }
    }

    /// Bytes ready to be written to the peer.
    pub fn poll_transmit(&mut self) -> Option<Bytes> {
        if self.out.is_empty() {
            None
        } else {
            Some(self.out.split().freeze())
        }
    }

    /// Whether [`Handshaker::poll_transmit`] would return bytes.
    pub fn has_pending_output(&self) -> bool {
        !self.out.is_empty()
    }

    /// `Remote-IP` values read since the last call.
    pub fn take_remote_ips(&mut self) -> Vec<String> {
        std::mem::take(&mut self.remote_ips)
    }

    /// Every header read so far.
    pub fn headers_read(&self) -> &Headers {
        &self.headers_read
    }

    /// Every header written so far.
    pub fn headers_written(&self) -> &Headers {
        &self.headers_written
    }

    /// Consume as many complete lines from `buf` as the current state needs.
    ///
    /// Bytes after the final header group stay in `buf`; they belong to the
    /// binary message stream.
    pub fn handle_input(&mut self, buf: &mut BytesMut) -> Result<()> {
        loop {
            if !matches!(
                self.phase,
                Phase::ConnectLine | Phase::Headers { .. } | Phase::Status
            ) {
                return Ok(());
            }
            let line = match take_line(buf, self.config.max_line_length) {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(()),
                Err(e) => return Err(self.fail(e)),
            };
            if let Err(e) = self.process_line(line) {
                return Err(self.fail(e));
            }
        }
    }

    /// Mark the handshake failed because the peer went quiet.
    pub fn timed_out(&mut self) -> GnutellaError {
        let what = match self.phase {
            Phase::ConnectLine => "connect line",
            Phase::Status => "status line",
            _ => "header line",
        };
        self.fail(GnutellaError::timed_out(what))
    }

    /// Final outcome, available once the handshake concluded with an accept.
    pub fn outcome(&self) -> Option<HandshakeOutcome> {
        let conclusion = match self.phase {
            Phase::Done(c @ (Conclusion::Accepted | Conclusion::AcceptedButDisconnect)) => c,
            _ => return None,
        };
        Some(HandshakeOutcome {
            conclusion,
            peer: HandshakeResponse::new(
                self.peer_status.0,
                self.peer_status.1.clone(),
                self.headers_read.clone(),
            ),
            ours: HandshakeResponse::new(
                self.own_status.0,
                self.own_status.1.clone(),
                self.headers_written.clone(),
            ),
        })
    }

    fn fail(&mut self, err: GnutellaError) -> GnutellaError {
        if !matches!(self.phase, Phase::Done(_)) {
            self.phase = Phase::Failed;
        }
        err
    }

    fn process_line(&mut self, line: String) -> Result<()> {
        match std::mem::replace(&mut self.phase, Phase::Failed) {
            Phase::ConnectLine => {
                parse_connect_line(&line)?;
                self.phase = Phase::Headers {
                    status: None,
                    count: 0,
                };
                Ok(())
            },
            Phase::Status => {
                let status = parse_status_line(&line)?;
                self.phase = Phase::Headers {
                    status: Some(status),
                    count: 0,
                };
                Ok(())
            },
            Phase::Headers { status, count } => match parse_header_line(&line) {
                HeaderLine::Header { name, value } => {
                    if count >= self.config.max_headers {
                        return Err(GnutellaError::BadHandshake(format!(
                            "too many headers read (> {})",
                            self.config.max_headers
                        )));
                    }
                    if name.eq_ignore_ascii_case(names::REMOTE_IP) {
                        self.remote_ips.push(value.clone());
                    }
                    self.headers_read.insert(name, value);
                    self.phase = Phase::Headers {
                        status,
                        count: count + 1,
                    };
                    Ok(())
                },
                HeaderLine::Skipped(raw) => {
                    tracing::debug!("skipping malformed handshake line: {:?}", raw);
                    self.phase = Phase::Headers { status, count };
                    Ok(())
                },
                HeaderLine::EndOfHeaders => self.end_of_group(status),
            },
            other => {
                self.phase = other;
                Ok(())
            },
        }
    }

    fn end_of_group(&mut self, status: Option<(u16, String)>) -> Result<()> {
        match (self.direction, status) {
            (Direction::Incoming, None) => {
                let request = HandshakeResponse::from_request(self.headers_read.clone());
                self.respond_incoming(&request)
            },
            (Direction::Incoming, Some((code, message))) => {
                let theirs = HandshakeResponse::new(code, message, self.headers_read.clone());
                self.peer_status = (code, theirs.message().to_string());
                if !theirs.is_ok() {
                    return self.reject(Rejection::from_code(Side::Remote, code));
                }
                if self.awaiting_credentials {
                    self.awaiting_credentials = false;
                    self.next_round(Side::Local)?;
                    return self.respond_incoming(&theirs);
                }
                let conclusion = if self.peer_is_crawler {
                    Conclusion::AcceptedButDisconnect
                } else {
                    Conclusion::Accepted
                };
                self.conclude(conclusion);
                Ok(())
            },
            (Direction::Outgoing, Some((code, message))) => {
                let theirs = HandshakeResponse::new(code, message, self.headers_read.clone());
                self.peer_status = (code, theirs.message().to_string());
                if !theirs.code().is_ok_or_unauthorized() {
                    return self.reject(Rejection::from_code(Side::Remote, code));
                }
                let ours = self.responder.respond(&theirs, true);
                self.write_response(&ours);
                if ours.is_final_ok() {
                    self.conclude(Conclusion::Accepted);
                    Ok(())
                } else if ours.code().is_ok_or_unauthorized() {
                    self.next_round(Side::Remote)?;
                    self.phase = Phase::Status;
                    Ok(())
                } else {
                    self.reject(Rejection::from_code(Side::Local, ours.code().0))
                }
            },
            (Direction::Outgoing, None) => Err(GnutellaError::BadHandshake(
                "header group without status line".to_string(),
            )),
        }
    }

    fn respond_incoming(&mut self, peer: &HandshakeResponse) -> Result<()> {
        self.peer_is_crawler |= peer.is_crawler();
        let ours = self.responder.respond(peer, false);
        self.write_response(&ours);
        if !ours.code().is_ok_or_unauthorized() {
            return self.reject(Rejection::from_code(Side::Local, ours.code().0));
        }
        self.awaiting_credentials = ours.is_unauthorized();
        self.phase = Phase::Status;
        Ok(())
    }

    fn next_round(&mut self, unresolved_side: Side) -> Result<()> {
        self.round += 1;
        if self.round >= self.config.max_rounds {
            return self.reject(Rejection::new(unresolved_side, RejectReason::Unresolved));
        }
        Ok(())
    }

    fn conclude(&mut self, conclusion: Conclusion) {
        tracing::debug!(
            "{} handshake concluded after {} round(s): {:?}",
            self.direction,
            self.round + 1,
            conclusion
        );
        self.phase = Phase::Done(conclusion);
    }

    fn reject(&mut self, rejection: Rejection) -> Result<()> {
        tracing::debug!("{} handshake rejected: {}", self.direction, rejection);
        self.phase = Phase::Done(Conclusion::Rejected(rejection));
        Err(GnutellaError::NoGnutellaOk(rejection))
    }

    fn write_response(&mut self, response: &HandshakeResponse) {
        self.own_status = (response.code().0, response.message().to_string());
        write_line(
            &mut self.out,
            &header::status_line(response.code().0, response.message()),
        );
        self.write_headers(response.headers());
    }

    fn write_headers(&mut self, headers: &Headers) {
        for (name, value) in headers.iter() {
            let value = match self.peer_ip {
                Some(ip) if name.eq_ignore_ascii_case(names::REMOTE_IP) => ip.to_string(),
                _ => value.to_string(),
            };
            write_header_line(&mut self.out, name, &value);
            self.headers_written.insert(name, value);
        }
        write_end_of_headers(&mut self.out);
    }
}

impl std::fmt::Debug for Handshaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshaker")
            .field("direction", &self.direction)
            .field("state", &self.state())
            .field("round", &self.round)
            .finish_non_exhaustive()
    }
}
