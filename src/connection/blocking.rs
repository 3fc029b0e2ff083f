//! Thread-per-connection I/O.
//!
//! [`Connection::initialize`] connects (outgoing only), runs the handshake
//! on the calling thread with per-read timeouts, then hands the socket to a
//! reader thread and a writer thread. The writer sleeps on the outbox
//! condvar until a message is queued or the connection closes.

use std::borrow::Cow;
use std::io::{self, Cursor, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use bytes::BytesMut;

use super::{lock, CloseReason, Connection, ConnectionState, ConnectionStats, Direction};
use crate::error::{GnutellaError, Result};
use crate::handshake::{Conclusion, Handshaker};
use crate::message::framer::MessageDecoder;
use crate::message::Message;
use crate::queue::MessageQueue;

const READ_CHUNK: usize = 8192;

impl Connection {
    /// Connect (outgoing), handshake and start the reader and writer threads.
    ///
    /// `timeout` bounds the TCP connect. Handshake reads use the configured
    /// handshake timeout. A refused or failed handshake closes the
    /// connection and returns the error; a crawler is accepted and closed.
    pub fn initialize(self: &Arc<Self>, timeout: Duration) -> Result<Conclusion> {
        match self.run_initialize(timeout) {
            Ok(conclusion) => Ok(conclusion),
            Err(e) => {
                tracing::debug!(id = self.id, remote = %self.remote, "Initialization failed: {}", e);
                self.close_with(CloseReason::from_error(&e));
                Err(e)
            },
        }
    }

    fn run_initialize(self: &Arc<Self>, timeout: Duration) -> Result<Conclusion> {
        if self.is_closed() {
            return Err(GnutellaError::Closed);
        }
        self.set_state(ConnectionState::Handshaking);

        let mut stream = match self.direction {
            Direction::Outgoing => {
                tracing::debug!(id = self.id, remote = %self.remote, "Connecting");
                TcpStream::connect_timeout(&self.remote, timeout)?
            },
            Direction::Incoming => self.take_pending_stream().ok_or(GnutellaError::Closed)?,
        };
        stream.set_nonblocking(false)?;
        self.set_teardown(Box::new(stream.try_clone()?));

        let mut handshaker = self.handshaker();
        let leftover = self.run_handshake(&mut stream, &mut handshaker)?;
        let outcome = handshaker
            .outcome()
            .ok_or_else(|| GnutellaError::BadHandshake("handshake ended without outcome".into()))?;
        let conclusion = outcome.conclusion;
        self.complete_handshake(outcome)?;
        if conclusion == Conclusion::Accepted {
            self.spawn_io(stream, leftover)?;
        }
        Ok(conclusion)
    }

    fn run_handshake(&self, stream: &mut TcpStream, handshaker: &mut Handshaker) -> Result<BytesMut> {
        handshaker.start();
        let mut buf = BytesMut::with_capacity(1024);
        let mut chunk = [0u8; 1024];
        loop {
            self.flush_handshake(stream, handshaker)?;
            if handshaker.is_finished() {
                return Ok(buf);
            }
            stream.set_read_timeout(Some(handshaker.read_timeout()))?;
            let n = match stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(GnutellaError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed during handshake",
                    )))
                },
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_timeout(&e) => return Err(handshaker.timed_out()),
                Err(e) => return Err(e.into()),
            };
            self.stats.record_wire_in(n);
            buf.extend_from_slice(&chunk[..n]);

            let result = handshaker.handle_input(&mut buf);
            self.learn_remote_ips(handshaker.take_remote_ips());
            if let Err(e) = result {
                // Let the peer see our refusal status before the socket goes.
                let _ = self.flush_handshake(stream, handshaker);
                return Err(e);
            }
        }
    }

    fn flush_handshake(&self, stream: &mut TcpStream, handshaker: &mut Handshaker) -> Result<()> {
        while let Some(bytes) = handshaker.poll_transmit() {
            stream.write_all(&bytes)?;
            self.stats.record_wire_out(bytes.len());
        }
        stream.flush()?;
        Ok(())
    }

    fn spawn_io(self: &Arc<Self>, stream: TcpStream, leftover: BytesMut) -> Result<()> {
        let writer_stream = stream.try_clone()?;

        let conn = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("gnutella-reader-{}", self.id))
            .spawn(move || {
                let result = conn.read_loop(stream, leftover);
                conn.finish_io("reader", result);
            })?;

        let conn = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("gnutella-writer-{}", self.id))
            .spawn(move || {
                let result = conn.write_loop(writer_stream);
                conn.finish_io("writer", result);
            })?;
        Ok(())
    }

    fn finish_io(&self, side: &str, result: Result<()>) {
        if let Err(e) = result {
            if !self.is_closed() {
                tracing::warn!(id = self.id, remote = %self.remote, "{} stopped: {}", side, e);
                self.close_with(CloseReason::from_error(&e));
            }
        }
    }

    fn read_loop(self: &Arc<Self>, stream: TcpStream, leftover: BytesMut) -> Result<()> {
        stream.set_read_timeout(Some(self.ctx.config.handshake.timeout()))?;
        match self.inflater() {
            Some(_) => self.read_deflated(stream, leftover),
            None => self.read_plain(stream, leftover),
        }
    }

    fn read_plain(self: &Arc<Self>, stream: TcpStream, leftover: BytesMut) -> Result<()> {
        let framer = self.framer();
        let mut reader = Metered {
            inner: Cursor::new(leftover).chain(&stream),
            stats: &self.stats,
        };
        while !self.is_closed() {
            match framer.read_message(&mut reader) {
                Ok(None) => {},
                Ok(Some(decoded)) => self.absorb(Ok(decoded))?,
                Err(e) => self.absorb(Err(e))?,
            }
        }
        Ok(())
    }

    fn read_deflated(self: &Arc<Self>, mut stream: TcpStream, leftover: BytesMut) -> Result<()> {
        let mut decoder = MessageDecoder::new(self.framer());
        let mut buf = BytesMut::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        let mut pending: Vec<u8> = leftover.to_vec();
        loop {
            if !pending.is_empty() {
                match self.inflater() {
                    Some(inflater) => buf.extend_from_slice(&inflater.inflate(&pending)?),
                    None => return Ok(()),
                }
                pending.clear();
            }
            loop {
                match decoder.decode(&mut buf) {
                    Ok(Some(decoded)) => self.absorb(Ok(decoded))?,
                    Ok(None) => break,
                    Err(e) => self.absorb(Err(e))?,
                }
            }
            if self.is_closed() {
                return Ok(());
            }

            match stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(GnutellaError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    )))
                },
                Ok(n) => {
                    self.stats.record_wire_in(n);
                    pending.extend_from_slice(&chunk[..n]);
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) if is_timeout(&e) && !decoder.is_mid_message() && buf.is_empty() => {},
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn write_loop(self: &Arc<Self>, mut stream: TcpStream) -> Result<()> {
        let framer = self.framer();
        let mut frame = BytesMut::new();
        loop {
            let Some(message) = self.wait_outbound() else {
                return Ok(());
            };

            frame.clear();
            if let Err(e) = framer.encode(&message, &mut frame) {
                tracing::debug!(id = self.id, "Dropping unsendable message: {}", e);
                self.stats.record_sent_dropped(1);
                continue;
            }
            self.stats.record_sent(frame.len());

            let wire: Cow<'_, [u8]> = match self.deflater() {
                Some(deflater) => Cow::Owned(deflater.deflate(&frame)?),
                None => Cow::Borrowed(&frame[..]),
            };
            if self.is_closed() {
                return Ok(());
            }
            stream.write_all(&wire)?;
            stream.flush()?;
            self.stats.record_wire_out(wire.len());
        }
    }

    /// Block until a message is ready or the connection closes (`None`).
    fn wait_outbound(&self) -> Option<Message> {
        let mut queue = lock(&self.outbox.queue);
        loop {
            if self.is_closed() {
                return None;
            }
            let next = queue.remove_next();
            self.stats.record_sent_dropped(queue.reset_dropped());
            if next.is_some() {
                return next;
            }
            queue = self
                .outbox
                .ready
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

struct Metered<'a, R> {
    inner: R,
    stats: &'a ConnectionStats,
}

impl<R: Read> Read for Metered<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.stats.record_wire_in(n);
        Ok(n)
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}
