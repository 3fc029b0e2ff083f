//! Connection session: one Gnutella link from setup to teardown.
//!
//! A [`Connection`] owns everything that outlives a single read or write:
//! negotiated headers, the soft max TTL frozen after the handshake, the
//! outbound [`CompositeQueue`], compression codecs and counters. The actual
//! socket work is done by one of two I/O models:
//!
//! | Model     | Entry point                          | Waiting                          |
//! |-----------|--------------------------------------|----------------------------------|
//! | blocking  | [`Connection::initialize`]           | reader/writer threads, condvar   |
//! | readiness | [`crate::nio::ReactorHandle::register`] | single loop, `Notify` wake-ups |
//!
//! Both models call the same session operations, so queueing, framing and
//! close semantics are identical.
//!
//! ```text
//!  Unconnected ──initialize/register──> Handshaking ──accepted──> Steady
//!       │                                    │                      │
//!       └────────────── close() ─────────────┴──────────────────────┴──> Closed
//! ```

mod blocking;
pub mod compression;
pub mod identity;
mod stats;

use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{mpsc, Notify};

use crate::config::Config;
use crate::error::{GnutellaError, Result};
use crate::handshake::{Conclusion, HandshakeOutcome, Handshaker, Headers, Responder};
use crate::message::framer::{Decoded, Framer};
use crate::message::{Message, MessageKind};
use crate::queue::{CompositeQueue, MessageQueue};

pub use crate::handshake::Direction;
pub use compression::{Deflater, Inflater};
pub use identity::{learn_remote_ip, NetworkIdentity, SharedIdentity};
pub use stats::{ConnectionStats, StatsSummary};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Transport underneath the Gnutella stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Plain TCP
    #[default]
    Plain,
    /// TLS over TCP
    Tls,
}

impl TransportKind {
    /// Get descriptive name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Tls => "tls",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Created, no network activity yet.
    Unconnected,
    /// Connecting or exchanging handshake headers.
    Handshaking,
    /// Exchanging binary messages.
    Steady,
    /// Torn down.
    Closed,
}

impl ConnectionState {
    /// Get descriptive name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unconnected => "unconnected",
            Self::Handshaking => "handshaking",
            Self::Steady => "steady",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "code")]
pub enum CloseReason {
    /// Local [`Connection::close`] call.
    Requested,
    /// Handshake refused with this status code.
    Rejected(u16),
    /// Handshake grammar violation.
    BadHandshake,
    /// Fatal malformed message.
    BadPacket,
    /// Socket error or end of stream.
    Io,
    /// Peer was a crawler; the link is dropped right after the handshake.
    Crawler,
}

impl CloseReason {
    /// Reason matching an error that ended the connection.
    pub fn from_error(err: &GnutellaError) -> Self {
        match err {
            GnutellaError::NoGnutellaOk(rejection) => CloseReason::Rejected(rejection.code()),
            GnutellaError::BadHandshake(_) => CloseReason::BadHandshake,
            GnutellaError::BadPacket(_) => CloseReason::BadPacket,
            GnutellaError::Closed => CloseReason::Requested,
            GnutellaError::Io(_) | GnutellaError::Config(_) => CloseReason::Io,
        }
    }
}

/// Lifecycle notification delivered to the [`Dispatcher`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum ConnectionEvent {
    /// Handshake accepted; messages flow from now on.
    Connected,
    /// Connection torn down.
    Closed {
        /// Cause of the teardown
        reason: CloseReason,
    },
    /// Peer changed a flow-control setting (hops flow).
    CapabilitiesChanged,
}

/// Receives inbound messages and lifecycle events.
pub trait Dispatcher: Send + Sync {
    /// Handle one accepted inbound message.
    fn dispatch(&self, message: Message, conn: &Arc<Connection>);

    /// Observe a lifecycle event.
    fn connection_event(&self, _conn: &Connection, _event: ConnectionEvent) {}
}

/// Dispatcher that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDispatcher;

impl Dispatcher for NullDispatcher {
    fn dispatch(&self, _message: Message, _conn: &Arc<Connection>) {}
}

/// What a [`ChannelDispatcher`] forwards.
#[derive(Debug, Clone)]
pub enum Notice {
    /// Inbound message
    Message {
        /// Connection id
        connection: u64,
        /// The message
        message: Message,
    },
    /// Lifecycle event
    Event {
        /// Connection id
        connection: u64,
        /// The event
        event: ConnectionEvent,
    },
}

/// Dispatcher forwarding into an unbounded channel.
///
/// Sending never blocks, so it is safe from reader threads and from the
/// readiness loop alike.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<Notice>,
}

impl ChannelDispatcher {
    /// Dispatcher plus the receiving end.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Dispatcher for ChannelDispatcher {
    fn dispatch(&self, message: Message, conn: &Arc<Connection>) {
        let _ = self.tx.send(Notice::Message {
            connection: conn.id(),
            message,
        });
    }

    fn connection_event(&self, conn: &Connection, event: ConnectionEvent) {
        let _ = self.tx.send(Notice::Event {
            connection: conn.id(),
            event,
        });
    }
}

/// Decides whether an inbound message is worth dispatching.
pub trait MessageFilter: Send + Sync {
    /// `false` discards the message and counts it as dropped.
    fn allow(&self, message: &Message) -> bool;
}

/// Filter accepting every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl MessageFilter for AllowAll {
    fn allow(&self, _message: &Message) -> bool {
        true
    }
}

impl<F> MessageFilter for F
where
    F: Fn(&Message) -> bool + Send + Sync,
{
    fn allow(&self, message: &Message) -> bool {
        self(message)
    }
}

/// Collaborators shared by every connection.
#[derive(Clone)]
pub struct ConnectionContext {
    /// Engine configuration
    pub config: Arc<Config>,
    /// Produces our handshake answers
    pub responder: Arc<dyn Responder>,
    /// Receives inbound messages and events
    pub dispatcher: Arc<dyn Dispatcher>,
    /// Self-address belief updated from `Remote-IP`
    pub identity: Arc<dyn NetworkIdentity>,
    /// Inbound message filter
    pub filter: Arc<dyn MessageFilter>,
}

impl ConnectionContext {
    /// Context with a null dispatcher, a fresh identity and no filtering.
    pub fn new(config: Arc<Config>, responder: Arc<dyn Responder>) -> Self {
        let identity = SharedIdentity::new();
        if let Some(addr) = config.network.forced_address {
            identity.set_address(addr);
        }
        Self {
            config,
            responder,
            dispatcher: Arc::new(NullDispatcher),
            identity: Arc::new(identity),
            filter: Arc::new(AllowAll),
        }
    }

    /// Replace the dispatcher.
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Replace the identity collaborator.
    pub fn with_identity(mut self, identity: Arc<dyn NetworkIdentity>) -> Self {
        self.identity = identity;
        self
    }

    /// Replace the inbound filter.
    pub fn with_filter(mut self, filter: Arc<dyn MessageFilter>) -> Self {
        self.filter = filter;
        self
    }
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Something that can be shut down from another thread to unblock I/O.
pub trait Teardown: Send {
    /// Shut the transport down; errors are ignored.
    fn close_transport(&mut self);
}

impl Teardown for TcpStream {
    fn close_transport(&mut self) {
        let _ = TcpStream::shutdown(self, std::net::Shutdown::Both);
    }
}

struct Outbox {
    queue: Mutex<CompositeQueue>,
    ready: Condvar,
    wake: Notify,
}

/// One Gnutella connection.
pub struct Connection {
    id: u64,
    remote: SocketAddr,
    direction: Direction,
    transport: TransportKind,
    ctx: ConnectionContext,
    state: RwLock<ConnectionState>,
    closed: AtomicBool,
    request_headers: Mutex<Option<Headers>>,
    pending_stream: Mutex<Option<TcpStream>>,
    teardown: Mutex<Option<Box<dyn Teardown>>>,
    outcome: OnceLock<HandshakeOutcome>,
    soft_max: OnceLock<u8>,
    connected_at: OnceLock<Instant>,
    deflater: OnceLock<Deflater>,
    inflater: OnceLock<Inflater>,
    hops_flow_max: RwLock<Option<u8>>,
    outbox: Outbox,
    stats: ConnectionStats,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Connection {
    fn new(
        remote: SocketAddr,
        direction: Direction,
        request_headers: Option<Headers>,
        pending_stream: Option<TcpStream>,
        ctx: ConnectionContext,
    ) -> Self {
        let queue = CompositeQueue::new(&ctx.config.queue);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            direction,
            transport: TransportKind::Plain,
            ctx,
            state: RwLock::new(ConnectionState::Unconnected),
            closed: AtomicBool::new(false),
            request_headers: Mutex::new(request_headers),
            pending_stream: Mutex::new(pending_stream),
            teardown: Mutex::new(None),
            outcome: OnceLock::new(),
            soft_max: OnceLock::new(),
            connected_at: OnceLock::new(),
            deflater: OnceLock::new(),
            inflater: OnceLock::new(),
            hops_flow_max: RwLock::new(None),
            outbox: Outbox {
                queue: Mutex::new(queue),
                ready: Condvar::new(),
                wake: Notify::new(),
            },
            stats: ConnectionStats::new(),
        }
    }

    /// Connection we will open to `remote`, sending `request_headers` with
    /// the connect line. No socket exists until it is started.
    pub fn outgoing(remote: SocketAddr, request_headers: Headers, ctx: ConnectionContext) -> Self {
        Self::new(remote, Direction::Outgoing, Some(request_headers), None, ctx)
    }

    /// Connection for a socket a peer opened to us.
    pub fn incoming(stream: TcpStream, ctx: ConnectionContext) -> Result<Self> {
        let remote = stream.peer_addr()?;
        Ok(Self::new(remote, Direction::Incoming, None, Some(stream), ctx))
    }

    /// Record the transport kind.
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    /// Process-unique id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Peer address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Who opened the connection.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Transport kind.
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Shared collaborators.
    pub fn context(&self) -> &ConnectionContext {
        &self.ctx
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether [`Connection::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Handshake result, once the handshake was accepted.
    pub fn outcome(&self) -> Option<&HandshakeOutcome> {
        self.outcome.get()
    }

    /// Every header the peer sent.
    pub fn headers_read(&self) -> Option<&Headers> {
        self.outcome.get().map(|o| o.peer.headers())
    }

    /// Every header we sent.
    pub fn headers_written(&self) -> Option<&Headers> {
        self.outcome.get().map(|o| o.ours.headers())
    }

    /// Soft max TTL for inbound messages; the configured value until the
    /// handshake freezes the negotiated one.
    pub fn soft_max_ttl(&self) -> u8 {
        self.soft_max
            .get()
            .copied()
            .unwrap_or(self.ctx.config.messages.soft_max_ttl)
    }

    /// When the handshake was accepted.
    pub fn connected_at(&self) -> Option<Instant> {
        self.connected_at.get().copied()
    }

    /// Whether we read a deflated stream.
    pub fn is_read_deflated(&self) -> bool {
        self.inflater.get().is_some()
    }

    /// Whether we write a deflated stream.
    pub fn is_write_deflated(&self) -> bool {
        self.deflater.get().is_some()
    }

    /// Port the peer accepts connections on, when known.
    pub fn listen_port(&self) -> Option<u16> {
        match self.direction {
            Direction::Outgoing => Some(self.remote.port()),
            Direction::Incoming => self
                .outcome
                .get()
                .and_then(|o| o.peer.listen_addr())
                .map(|addr| addr.port()),
        }
    }

    /// Traffic counters.
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Messages waiting in the outbound queue.
    pub fn queued(&self) -> usize {
        lock(&self.outbox.queue).len()
    }

    /// Current hops-flow limit.
    pub fn hops_flow_max(&self) -> Option<u8> {
        *self.hops_flow_max.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set or clear the hops-flow limit: queries with at least this many hops
    /// are no longer sent.
    pub fn set_hops_flow_max(&self, max: Option<u8>) {
        *self.hops_flow_max.write().unwrap_or_else(PoisonError::into_inner) = max;
    }

    /// Queue `message` for sending.
    ///
    /// Messages sent after close, or queries stopped by the hops-flow limit,
    /// are counted as dropped instead.
    pub fn send(&self, message: Message) {
        if self.is_closed() {
            self.stats.record_sent_dropped(1);
            return;
        }
        if *message.kind() == MessageKind::Query {
            if let Some(max) = self.hops_flow_max() {
                if message.hops() >= max {
                    tracing::trace!(id = self.id, hops = message.hops(), max, "Query held back by hops flow");
                    self.stats.record_sent_dropped(1);
                    return;
                }
            }
        }

        {
            let mut queue = lock(&self.outbox.queue);
            queue.add(message);
            self.stats.record_sent_dropped(queue.reset_dropped());
            self.outbox.ready.notify_one();
        }
        self.outbox.wake.notify_one();
    }

    /// Send a query this node originated.
    pub fn originate_query(&self, message: Message) {
        self.send(message.originated());
    }

    /// Close with [`CloseReason::Requested`].
    pub fn close(&self) -> bool {
        self.close_with(CloseReason::Requested)
    }

    /// Tear the connection down. Only the first call has any effect; it
    /// returns `true`.
    pub fn close_with(&self, reason: CloseReason) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        *self.state.write().unwrap_or_else(PoisonError::into_inner) = ConnectionState::Closed;
        self.release_codecs();
        if let Some(mut transport) = lock(&self.teardown).take() {
            transport.close_transport();
        }
        lock(&self.pending_stream).take();
        {
            let _queue = lock(&self.outbox.queue);
            self.outbox.ready.notify_all();
        }
        self.outbox.wake.notify_one();

        tracing::info!(
            id = self.id,
            remote = %self.remote,
            direction = %self.direction,
            ?reason,
            "Connection closed"
        );
        self.ctx
            .dispatcher
            .connection_event(self, ConnectionEvent::Closed { reason });
        true
    }

    fn release_codecs(&self) {
        if let Some(deflater) = self.deflater.get() {
            deflater.release();
        }
        if let Some(inflater) = self.inflater.get() {
            inflater.release();
        }
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *current != ConnectionState::Closed {
            *current = state;
        }
    }

    /// Handshaker for this connection; the outgoing request headers are
    /// consumed by the first call.
    pub(crate) fn handshaker(&self) -> Handshaker {
        let config = self.ctx.config.handshake.clone();
        let responder = Arc::clone(&self.ctx.responder);
        let peer_ip = Some(self.remote.ip());
        match self.direction {
            Direction::Outgoing => {
                let headers = lock(&self.request_headers).take().unwrap_or_default();
                Handshaker::outgoing(config, responder, headers, peer_ip)
            },
            Direction::Incoming => Handshaker::incoming(config, responder, peer_ip),
        }
    }

    pub(crate) fn take_pending_stream(&self) -> Option<TcpStream> {
        lock(&self.pending_stream).take()
    }

    pub(crate) fn set_teardown(&self, transport: Box<dyn Teardown>) {
        let mut slot = lock(&self.teardown);
        if self.is_closed() {
            let mut transport = transport;
            transport.close_transport();
        } else {
            *slot = Some(transport);
        }
    }

    pub(crate) fn learn_remote_ips(&self, values: Vec<String>) {
        let force_ip = self.ctx.config.network.force_ip;
        for value in values {
            learn_remote_ip(self.ctx.identity.as_ref(), &value, force_ip);
        }
    }

    /// Freeze the negotiated state after an accepted handshake.
    ///
    /// A crawler outcome is recorded but closes the connection.
    pub(crate) fn complete_handshake(&self, outcome: HandshakeOutcome) -> Result<()> {
        let conclusion = outcome.conclusion;
        let peer = &outcome.peer;
        let mut soft_max = self.ctx.config.messages.soft_max_ttl;
        if peer.is_good_ultrapeer() || peer.is_good_leaf() {
            soft_max = soft_max.saturating_add(1);
        }
        let write_deflated = outcome.ours.is_deflate_enabled();
        let read_deflated = peer.is_deflate_enabled();
        let user_agent = peer.user_agent().unwrap_or("unknown").to_string();
        let _ = self.outcome.set(outcome);

        if conclusion == Conclusion::AcceptedButDisconnect {
            self.close_with(CloseReason::Crawler);
            return Ok(());
        }

        let _ = self.soft_max.set(soft_max);
        if write_deflated {
            let _ = self.deflater.set(Deflater::new());
        }
        if read_deflated {
            let _ = self.inflater.set(Inflater::new());
        }
        if self.is_closed() {
            self.release_codecs();
            return Err(GnutellaError::Closed);
        }

        let _ = self.connected_at.set(Instant::now());
        self.set_state(ConnectionState::Steady);
        tracing::info!(
            id = self.id,
            remote = %self.remote,
            direction = %self.direction,
            soft_max,
            read_deflated,
            write_deflated,
            user_agent = %user_agent,
            "Connection established"
        );
        self.ctx
            .dispatcher
            .connection_event(self, ConnectionEvent::Connected);
        Ok(())
    }

    /// Framer validating inbound messages for this connection.
    pub(crate) fn framer(&self) -> Framer {
        Framer::new(&self.ctx.config.messages).with_soft_max(self.soft_max_ttl())
    }

    pub(crate) fn deflater(&self) -> Option<&Deflater> {
        self.deflater.get()
    }

    pub(crate) fn inflater(&self) -> Option<&Inflater> {
        self.inflater.get()
    }

    pub(crate) fn outbound_notify(&self) -> &Notify {
        &self.outbox.wake
    }

    /// Next message for the wire, charging queue drops to the stats.
    pub(crate) fn take_outbound(&self) -> Option<Message> {
        let mut queue = lock(&self.outbox.queue);
        let next = queue.remove_next();
        self.stats.record_sent_dropped(queue.reset_dropped());
        next
    }

    /// Route one decode result. Errors that do not end the connection are
    /// counted and swallowed.
    pub(crate) fn absorb(self: &Arc<Self>, decoded: Result<Decoded>) -> Result<()> {
        match decoded {
            Ok(Decoded::Message(message)) => {
                self.handle_inbound(message);
                Ok(())
            },
            Ok(Decoded::Dropped) => {
                self.stats.record_received_dropped();
                Ok(())
            },
            Err(e) if !e.is_fatal() => {
                tracing::debug!(id = self.id, "Discarding inbound message: {}", e);
                self.stats.record_received_dropped();
                Ok(())
            },
            Err(e) => Err(e),
        }
    }

    /// Inbound pipeline for one decoded message.
    pub fn handle_inbound(self: &Arc<Self>, message: Message) {
        self.stats.record_received(message.total_len());
        if let Some(max) = message.hops_flow_value() {
            tracing::debug!(id = self.id, max, "Peer set hops flow");
            self.set_hops_flow_max(Some(max));
            self.ctx
                .dispatcher
                .connection_event(self, ConnectionEvent::CapabilitiesChanged);
            return;
        }
        if !self.ctx.filter.allow(&message) {
            self.stats.record_received_dropped();
            return;
        }
        self.ctx.dispatcher.dispatch(message, self);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("direction", &self.direction)
            .field("transport", &self.transport)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BadPacketReason, Rejection, Side};
    use crate::handshake::{HandshakeResponse, StaticResponder};
    use std::sync::atomic::AtomicUsize;

    fn context() -> ConnectionContext {
        ConnectionContext::new(
            Arc::new(Config::default()),
            Arc::new(StaticResponder::default()),
        )
    }

    fn outgoing(ctx: ConnectionContext) -> Arc<Connection> {
        let addr: SocketAddr = "203.0.113.7:6346".parse().unwrap();
        Arc::new(Connection::outgoing(addr, Headers::new(), ctx))
    }

    fn outcome(peer: Headers, ours: Headers, conclusion: Conclusion) -> HandshakeOutcome {
        HandshakeOutcome {
            conclusion,
            peer: HandshakeResponse::ok(peer),
            ours: HandshakeResponse::ok(ours),
        }
    }

    #[derive(Default)]
    struct CountingTeardown(Arc<AtomicUsize>);

    impl Teardown for CountingTeardown {
        fn close_transport(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_new_connection_state() {
        let conn = outgoing(context());
        assert_eq!(conn.state(), ConnectionState::Unconnected);
        assert_eq!(conn.direction(), Direction::Outgoing);
        assert_eq!(conn.transport(), TransportKind::Plain);
        assert_eq!(conn.soft_max_ttl(), 3);
        assert_eq!(conn.listen_port(), Some(6346));
        assert!(conn.outcome().is_none());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (dispatcher, mut rx) = ChannelDispatcher::new();
        let conn = outgoing(context().with_dispatcher(Arc::new(dispatcher)));
        let count = Arc::new(AtomicUsize::new(0));
        conn.set_teardown(Box::new(CountingTeardown(Arc::clone(&count))));

        assert!(conn.close());
        assert!(!conn.close());
        assert!(!conn.close_with(CloseReason::Io));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let Ok(Notice::Event { event, .. }) = rx.try_recv() else {
            panic!("expected close event");
        };
        assert_eq!(event, ConnectionEvent::Closed { reason: CloseReason::Requested });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_concurrent_close_runs_teardown_once() {
        let conn = outgoing(context());
        let count = Arc::new(AtomicUsize::new(0));
        conn.set_teardown(Box::new(CountingTeardown(Arc::clone(&count))));

        let winners: usize = (0..8)
            .map(|_| {
                let conn = Arc::clone(&conn);
                std::thread::spawn(move || conn.close())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();
        assert_eq!(winners, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_teardown_installed_after_close_runs_immediately() {
        let conn = outgoing(context());
        conn.close();
        let count = Arc::new(AtomicUsize::new(0));
        conn.set_teardown(Box::new(CountingTeardown(Arc::clone(&count))));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_send_after_close_is_dropped() {
        let conn = outgoing(context());
        conn.close();
        conn.send(Message::ping(3));
        assert_eq!(conn.queued(), 0);
        assert_eq!(conn.stats().sent_dropped(), 1);
    }

    #[test]
    fn test_hops_flow_holds_back_queries() {
        let conn = outgoing(context());
        conn.set_hops_flow_max(Some(2));
        conn.send(Message::new(crate::message::Guid::new(), MessageKind::Query, 2, 2, vec![0; 3]));
        conn.send(Message::new(crate::message::Guid::new(), MessageKind::Query, 2, 1, vec![0; 3]));
        conn.send(Message::new(crate::message::Guid::new(), MessageKind::Ping, 2, 5, Vec::new()));
        assert_eq!(conn.queued(), 2);
        assert_eq!(conn.stats().sent_dropped(), 1);
    }

    #[test]
    fn test_inbound_hops_flow_sets_limit() {
        let (dispatcher, mut rx) = ChannelDispatcher::new();
        let conn = outgoing(context().with_dispatcher(Arc::new(dispatcher)));
        conn.handle_inbound(Message::hops_flow(4));
        assert_eq!(conn.hops_flow_max(), Some(4));
        let Ok(Notice::Event { event, .. }) = rx.try_recv() else {
            panic!("expected capabilities event");
        };
        assert_eq!(event, ConnectionEvent::CapabilitiesChanged);
    }

    #[test]
    fn test_filter_and_dispatch() {
        let (dispatcher, mut rx) = ChannelDispatcher::new();
        let filter = |m: &Message| *m.kind() != MessageKind::Ping;
        let conn = outgoing(
            context()
                .with_dispatcher(Arc::new(dispatcher))
                .with_filter(Arc::new(filter)),
        );
        conn.handle_inbound(Message::ping(2));
        conn.handle_inbound(Message::query(2, 0, "needle"));

        assert_eq!(conn.stats().received(), 2);
        assert_eq!(conn.stats().received_dropped(), 1);
        let Ok(Notice::Message { message, connection }) = rx.try_recv() else {
            panic!("expected dispatched query");
        };
        assert_eq!(connection, conn.id());
        assert_eq!(*message.kind(), MessageKind::Query);
    }

    #[test]
    fn test_absorb_counts_non_fatal_errors() {
        let conn = outgoing(context());
        let soft = GnutellaError::BadPacket(BadPacketReason::HopsOverSoftMax { hops: 5, soft_max: 3 });
        assert!(conn.absorb(Err(soft)).is_ok());
        assert!(conn.absorb(Ok(Decoded::Dropped)).is_ok());
        assert_eq!(conn.stats().received_dropped(), 2);

        let fatal = GnutellaError::BadPacket(BadPacketReason::InvalidLength { length: 1 << 20, max: 65536 });
        assert!(conn.absorb(Err(fatal)).is_err());
    }

    #[test]
    fn test_complete_handshake_freezes_state() {
        let (dispatcher, mut rx) = ChannelDispatcher::new();
        let conn = outgoing(context().with_dispatcher(Arc::new(dispatcher)));
        let peer = Headers::new()
            .with("X-Ultrapeer", "true")
            .with("X-Degree", "32")
            .with("X-Ultrapeer-Query-Routing", "0.1")
            .with("X-Max-TTL", "3")
            .with("X-Dynamic-Querying", "0.1")
            .with("Content-Encoding", "deflate");
        let ours = Headers::new().with("Accept-Encoding", "deflate");

        conn.complete_handshake(outcome(peer, ours, Conclusion::Accepted)).unwrap();
        assert_eq!(conn.state(), ConnectionState::Steady);
        assert_eq!(conn.soft_max_ttl(), 4);
        assert!(conn.is_read_deflated());
        assert!(!conn.is_write_deflated());
        assert!(conn.connected_at().is_some());
        assert_eq!(conn.headers_read().unwrap().get("x-degree"), Some("32"));

        let Ok(Notice::Event { event, .. }) = rx.try_recv() else {
            panic!("expected connected event");
        };
        assert_eq!(event, ConnectionEvent::Connected);

        conn.close();
        assert!(conn.inflater().unwrap().is_released());
    }

    #[test]
    fn test_crawler_outcome_closes() {
        let conn = outgoing(context());
        conn.complete_handshake(outcome(
            Headers::new().with("Crawler", "0.1"),
            Headers::new(),
            Conclusion::AcceptedButDisconnect,
        ))
        .unwrap();
        assert!(conn.is_closed());
        assert!(conn.outcome().is_some());
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_close_reason_from_error() {
        let rejected = GnutellaError::NoGnutellaOk(Rejection::from_code(Side::Remote, 503));
        assert_eq!(CloseReason::from_error(&rejected), CloseReason::Rejected(503));
        assert_eq!(
            CloseReason::from_error(&GnutellaError::BadHandshake("x".into())),
            CloseReason::BadHandshake
        );
        assert_eq!(
            CloseReason::from_error(&GnutellaError::timed_out("status line")),
            CloseReason::Io
        );
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(ConnectionEvent::Closed {
            reason: CloseReason::Rejected(503),
        })
        .unwrap();
        assert_eq!(json["event"], "closed");
        assert_eq!(json["reason"]["kind"], "rejected");
        assert_eq!(json["reason"]["code"], 503);
    }
}
