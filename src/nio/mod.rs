//! Single-loop readiness driver.
//!
//! One [`Reactor`] task services every registered [`Connection`]. Each
//! session keeps exactly one pending wake-up future in a
//! [`FuturesUnordered`]; when it fires the session does as much
//! non-blocking work as it can and re-arms. Nothing in the loop ever
//! blocks: waiting means handing control back to the runtime.
//!
//! ```text
//!  ReactorHandle::register ──> [commands] ──┐
//!                                           v
//!                     ┌──────── select! ─────────┐
//!                     │                          │
//!          connect done / ready(R|W)   Notify (send, close) / deadline
//!                     │                          │
//!                     └──> Session::on_wake ─────┘──> re-arm or drop
//! ```
//!
//! Read interest is always armed. Write interest is armed only while the
//! session holds unflushed bytes. Queued messages are pulled into the
//! output buffer only while it is below [`LOW_WATER_MARK`], so a slow peer
//! leaves messages in the queue where expiry and eviction still apply.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio::io::{Interest, Ready};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::connection::{CloseReason, Connection, ConnectionState, Direction};
use crate::error::{GnutellaError, Result};
use crate::handshake::Handshaker;
use crate::message::framer::MessageDecoder;

/// Output buffered per session before the queue is consulted again.
pub const LOW_WATER_MARK: usize = 8 * 1024;

const READ_CHUNK: usize = 8192;
const MAX_READS_PER_WAKE: usize = 16;

enum Command {
    Register(Arc<Connection>),
}

/// Cloneable handle for registering connections with a running [`Reactor`].
#[derive(Debug, Clone)]
pub struct ReactorHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl ReactorHandle {
    /// Hand `conn` to the loop. Outgoing connections are connected there;
    /// incoming ones start reading the handshake right away.
    pub fn register(&self, conn: Arc<Connection>) -> Result<()> {
        self.commands
            .send(Command::Register(conn))
            .map_err(|_| GnutellaError::Closed)
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Register(conn) => f.debug_tuple("Register").field(&conn.id()).finish(),
        }
    }
}

/// The readiness loop.
#[derive(Debug)]
pub struct Reactor {
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Reactor {
    /// Create a loop and its registration handle.
    pub fn new() -> (Self, ReactorHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { commands: rx }, ReactorHandle { commands: tx })
    }

    /// Run until every handle is dropped and no session remains.
    pub async fn run(mut self) -> Result<()> {
        let mut sessions: HashMap<u64, Session> = HashMap::new();
        let mut pending: FuturesUnordered<BoxFuture<'static, (u64, Wake)>> = FuturesUnordered::new();
        let mut accepting = true;
        tracing::debug!("Readiness loop started");

        loop {
            if !accepting && sessions.is_empty() {
                break;
            }
            tokio::select! {
                command = self.commands.recv(), if accepting => match command {
                    Some(Command::Register(conn)) => {
                        let id = conn.id();
                        if let Some(session) = Session::start(conn) {
                            pending.push(session.arm(id));
                            sessions.insert(id, session);
                        }
                    },
                    None => accepting = false,
                },
                Some((id, wake)) = pending.next(), if !pending.is_empty() => {
                    let keep = sessions.get_mut(&id).is_some_and(|session| session.on_wake(wake));
                    match sessions.get(&id) {
                        Some(session) if keep => pending.push(session.arm(id)),
                        _ => {
                            sessions.remove(&id);
                        },
                    }
                },
                else => break,
            }
        }

        tracing::debug!("Readiness loop finished");
        Ok(())
    }
}

enum Wake {
    Connected(io::Result<TcpStream>),
    Ready(io::Result<Ready>),
    Outbound,
    Deadline,
}

enum Phase {
    Connecting,
    Handshaking(Box<Handshaker>),
    Steady(MessageDecoder),
}

struct Session {
    conn: Arc<Connection>,
    stream: Option<Arc<TcpStream>>,
    phase: Phase,
    inbound: BytesMut,
    outbound: BytesMut,
    deadline: Option<Instant>,
}

impl Session {
    fn start(conn: Arc<Connection>) -> Option<Self> {
        if conn.is_closed() {
            return None;
        }
        conn.set_state(ConnectionState::Handshaking);
        let mut session = Self {
            conn,
            stream: None,
            phase: Phase::Connecting,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            deadline: None,
        };
        if session.conn.direction() == Direction::Outgoing {
            return Some(session);
        }

        let result = match session.conn.take_pending_stream() {
            Some(std_stream) => std_stream
                .set_nonblocking(true)
                .and_then(|()| TcpStream::from_std(std_stream))
                .map_err(GnutellaError::from)
                .and_then(|stream| session.begin_handshake(stream)),
            None => Err(GnutellaError::Closed),
        };
        match result {
            Ok(()) => Some(session),
            Err(e) => {
                session.fail(e);
                None
            },
        }
    }

    fn arm(&self, id: u64) -> BoxFuture<'static, (u64, Wake)> {
        let Some(stream) = self.stream.as_ref().map(Arc::clone) else {
            let addr = self.conn.remote_addr();
            let timeout = self.conn.context().config.network.connect_timeout();
            return async move {
                let result = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                    Ok(result) => result,
                    Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
                };
                (id, Wake::Connected(result))
            }
            .boxed();
        };

        let conn = Arc::clone(&self.conn);
        let interest = if self.outbound.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        let deadline = self.deadline;
        async move {
            let wake = tokio::select! {
                ready = stream.ready(interest) => Wake::Ready(ready),
                () = conn.outbound_notify().notified() => Wake::Outbound,
                () = sleep_until(deadline) => Wake::Deadline,
            };
            (id, wake)
        }
        .boxed()
    }

    /// Handle one wake-up; `false` means the session is finished.
    fn on_wake(&mut self, wake: Wake) -> bool {
        if self.conn.is_closed() {
            return false;
        }
        let result = match wake {
            Wake::Connected(Ok(stream)) => self.begin_handshake(stream),
            Wake::Connected(Err(e)) | Wake::Ready(Err(e)) => Err(e.into()),
            Wake::Ready(Ok(ready)) => self.on_ready(ready),
            Wake::Outbound => self.pump_outbound(),
            Wake::Deadline => self.on_deadline(),
        };
        if let Err(e) = result {
            self.fail(e);
        }
        !self.conn.is_closed()
    }

    fn fail(&mut self, err: GnutellaError) {
        if matches!(self.phase, Phase::Handshaking(_)) {
            // Let the peer see our refusal status before the socket goes.
            let _ = self.flush();
        }
        tracing::debug!(id = self.conn.id(), remote = %self.conn.remote_addr(), "Session failed: {}", err);
        self.conn.close_with(CloseReason::from_error(&err));
    }

    fn begin_handshake(&mut self, stream: TcpStream) -> Result<()> {
        let mut handshaker = Box::new(self.conn.handshaker());
        handshaker.start();
        while let Some(bytes) = handshaker.poll_transmit() {
            self.outbound.extend_from_slice(&bytes);
        }
        self.deadline = Some(Instant::now() + handshaker.read_timeout());
        self.stream = Some(Arc::new(stream));
        self.phase = Phase::Handshaking(handshaker);
        self.flush().map(|_| ())
    }

    fn on_ready(&mut self, ready: Ready) -> Result<()> {
        if ready.is_readable() || ready.is_read_closed() {
            self.on_readable()?;
        }
        if self.conn.is_closed() {
            return Ok(());
        }
        self.pump_outbound()
    }

    fn on_readable(&mut self) -> Result<()> {
        let Some(stream) = self.stream.as_ref().map(Arc::clone) else {
            return Ok(());
        };
        let mut chunk = [0u8; READ_CHUNK];
        for _ in 0..MAX_READS_PER_WAKE {
            match stream.try_read(&mut chunk) {
                Ok(0) => {
                    return Err(GnutellaError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    )))
                },
                Ok(n) => {
                    self.conn.stats().record_wire_in(n);
                    self.consume(&chunk[..n])?;
                    if self.conn.is_closed() {
                        return Ok(());
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn consume(&mut self, data: &[u8]) -> Result<()> {
        let finished = match &mut self.phase {
            Phase::Connecting => return Ok(()),
            Phase::Handshaking(handshaker) => {
                self.inbound.extend_from_slice(data);
                let result = handshaker.handle_input(&mut self.inbound);
                self.conn.learn_remote_ips(handshaker.take_remote_ips());
                while let Some(bytes) = handshaker.poll_transmit() {
                    self.outbound.extend_from_slice(&bytes);
                }
                result?;
                self.deadline = Some(Instant::now() + handshaker.read_timeout());
                handshaker.is_finished()
            },
            Phase::Steady(_) => {
                match self.conn.inflater() {
                    Some(inflater) => self.inbound.extend_from_slice(&inflater.inflate(data)?),
                    None => self.inbound.extend_from_slice(data),
                }
                false
            },
        };
        if finished {
            return self.finish_handshake();
        }
        self.decode_all()
    }

    fn finish_handshake(&mut self) -> Result<()> {
        let Phase::Handshaking(handshaker) = std::mem::replace(&mut self.phase, Phase::Connecting) else {
            return Ok(());
        };
        self.deadline = None;
        self.flush()?;
        let outcome = handshaker
            .outcome()
            .ok_or_else(|| GnutellaError::BadHandshake("handshake ended without outcome".into()))?;
        self.conn.complete_handshake(outcome)?;
        if self.conn.is_closed() {
            return Ok(());
        }

        self.phase = Phase::Steady(MessageDecoder::new(self.conn.framer()));
        if let Some(inflater) = self.conn.inflater() {
            let leftover = self.inbound.split();
            self.inbound.extend_from_slice(&inflater.inflate(&leftover)?);
        }
        self.decode_all()
    }

    fn decode_all(&mut self) -> Result<()> {
        let Phase::Steady(decoder) = &mut self.phase else {
            return Ok(());
        };
        while !self.conn.is_closed() {
            match decoder.decode(&mut self.inbound) {
                Ok(Some(decoded)) => self.conn.absorb(Ok(decoded))?,
                Ok(None) => break,
                Err(e) => self.conn.absorb(Err(e))?,
            }
        }
        Ok(())
    }

    fn on_deadline(&mut self) -> Result<()> {
        let expired = self.deadline.is_some_and(|d| Instant::now() >= d);
        match &mut self.phase {
            Phase::Handshaking(handshaker) if expired => Err(handshaker.timed_out()),
            _ => Ok(()),
        }
    }

    /// Refill from the queue and write until the socket pushes back.
    fn pump_outbound(&mut self) -> Result<()> {
        if !matches!(self.phase, Phase::Steady(_)) {
            return self.flush().map(|_| ());
        }
        loop {
            self.fill()?;
            if self.outbound.is_empty() || !self.flush()? {
                return Ok(());
            }
        }
    }

    fn fill(&mut self) -> Result<()> {
        let framer = self.conn.framer();
        let mut frame = BytesMut::new();
        while self.outbound.len() < LOW_WATER_MARK {
            let Some(message) = self.conn.take_outbound() else {
                break;
            };
            frame.clear();
            if let Err(e) = framer.encode(&message, &mut frame) {
                tracing::debug!(id = self.conn.id(), "Dropping unsendable message: {}", e);
                self.conn.stats().record_sent_dropped(1);
                continue;
            }
            self.conn.stats().record_sent(frame.len());
            match self.conn.deflater() {
                Some(deflater) => self.outbound.extend_from_slice(&deflater.deflate(&frame)?),
                None => self.outbound.extend_from_slice(&frame),
            }
        }
        Ok(())
    }

    /// Write buffered bytes; `Ok(true)` when everything went out.
    fn flush(&mut self) -> Result<bool> {
        let Some(stream) = self.stream.as_ref() else {
            return Ok(self.outbound.is_empty());
        };
        while !self.outbound.is_empty() {
            match stream.try_write(&self.outbound) {
                Ok(0) => return Err(GnutellaError::Io(io::ErrorKind::WriteZero.into())),
                Ok(n) => {
                    self.outbound.advance(n);
                    self.conn.stats().record_wire_out(n);
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::connection::{ChannelDispatcher, ConnectionContext, ConnectionEvent, Notice};
    use crate::handshake::{Headers, StaticResponder};
    use std::time::Duration;

    fn context(config: Config) -> (ConnectionContext, mpsc::UnboundedReceiver<Notice>) {
        let (dispatcher, rx) = ChannelDispatcher::new();
        let ctx = ConnectionContext::new(Arc::new(config), Arc::new(StaticResponder::default()))
            .with_dispatcher(Arc::new(dispatcher));
        (ctx, rx)
    }

    #[tokio::test]
    async fn test_loop_ends_without_handles() {
        let (reactor, handle) = Reactor::new();
        drop(handle);
        tokio::time::timeout(Duration::from_secs(1), reactor.run())
            .await
            .expect("loop should end")
            .unwrap();
    }

    #[tokio::test]
    async fn test_register_after_loop_gone() {
        let (reactor, handle) = Reactor::new();
        drop(reactor);
        let (ctx, _rx) = context(Config::default());
        let conn = Arc::new(Connection::outgoing(
            "127.0.0.1:9".parse().unwrap(),
            Headers::new(),
            ctx,
        ));
        assert!(matches!(handle.register(conn), Err(GnutellaError::Closed)));
    }

    #[tokio::test]
    async fn test_silent_peer_hits_handshake_deadline() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut config = Config::default();
        config.handshake.timeout_secs = 1;
        let (ctx, mut rx) = context(config);
        let (reactor, handle) = Reactor::new();
        let run = tokio::spawn(reactor.run());

        let conn = Arc::new(Connection::outgoing(addr, Headers::new(), ctx));
        handle.register(Arc::clone(&conn)).unwrap();
        let (_held, _) = listener.accept().await.unwrap();

        let notice = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("close event")
            .unwrap();
        let Notice::Event { event, .. } = notice else {
            panic!("unexpected message");
        };
        assert_eq!(event, ConnectionEvent::Closed { reason: CloseReason::Io });
        assert!(conn.is_closed());

        drop(handle);
        tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_wakes_session() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (ctx, _rx) = context(Config::default());
        let (reactor, handle) = Reactor::new();
        let run = tokio::spawn(reactor.run());

        let conn = Arc::new(Connection::outgoing(addr, Headers::new(), ctx));
        handle.register(Arc::clone(&conn)).unwrap();
        let (_held, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(conn.close());
        drop(handle);
        tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("session dropped after close")
            .unwrap()
            .unwrap();
    }
}
