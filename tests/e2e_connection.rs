//! End-to-end tests for two engine connections over loopback TCP using the
//! thread-per-connection model.

use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use gnutella::error::Side;
use gnutella::{
    ChannelDispatcher, CloseReason, Conclusion, Config, Connection, ConnectionContext,
    ConnectionEvent, ConnectionState, GnutellaError, HandshakeResponse, Headers, Message,
    MessageKind, Notice, Responder, StaticResponder,
};
use tokio::sync::mpsc::UnboundedReceiver;

const TIMEOUT: Duration = Duration::from_secs(5);

struct Peer {
    conn: Arc<Connection>,
    rx: UnboundedReceiver<Notice>,
}

fn context(responder: Arc<dyn Responder>) -> (ConnectionContext, UnboundedReceiver<Notice>) {
    let (dispatcher, rx) = ChannelDispatcher::new();
    let ctx = ConnectionContext::new(Arc::new(Config::default()), responder)
        .with_dispatcher(Arc::new(dispatcher));
    (ctx, rx)
}

fn responder(headers: Headers) -> Arc<dyn Responder> {
    Arc::new(StaticResponder::new(headers))
}

fn plain_headers(agent: &str) -> Headers {
    Headers::new().with("User-Agent", agent)
}

fn deflate_headers(agent: &str) -> Headers {
    plain_headers(agent)
        .with("Accept-Encoding", "deflate")
        .with("Content-Encoding", "deflate")
}

/// Handshake an outgoing and an incoming connection with each other.
fn connect_pair(
    out_responder: Arc<dyn Responder>,
    in_responder: Arc<dyn Responder>,
    request: Headers,
) -> (
    (Peer, gnutella::Result<Conclusion>),
    (Peer, gnutella::Result<Conclusion>),
) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let acceptor = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let (ctx, rx) = context(in_responder);
        let conn = Arc::new(Connection::incoming(stream, ctx).unwrap());
        let result = conn.initialize(TIMEOUT);
        (Peer { conn, rx }, result)
    });

    let (ctx, rx) = context(out_responder);
    let conn = Arc::new(Connection::outgoing(addr, request, ctx));
    let result = conn.initialize(TIMEOUT);
    let incoming = acceptor.join().unwrap();
    ((Peer { conn, rx }, result), incoming)
}

fn recv(rx: &mut UnboundedReceiver<Notice>) -> Notice {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        if let Ok(notice) = rx.try_recv() {
            return notice;
        }
        assert!(Instant::now() < deadline, "no notice within {TIMEOUT:?}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn recv_event(rx: &mut UnboundedReceiver<Notice>) -> ConnectionEvent {
    match recv(rx) {
        Notice::Event { event, .. } => event,
        other => panic!("expected event, got {other:?}"),
    }
}

fn recv_message(rx: &mut UnboundedReceiver<Notice>) -> Message {
    match recv(rx) {
        Notice::Message { message, .. } => message,
        other => panic!("expected message, got {other:?}"),
    }
}

fn wait_until(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met within {TIMEOUT:?}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_messages_flow_both_ways() {
    let ((mut out, out_res), (mut inc, in_res)) = connect_pair(
        responder(plain_headers("out/1.0")),
        responder(plain_headers("in/1.0")),
        plain_headers("out/1.0"),
    );
    assert_eq!(out_res.unwrap(), Conclusion::Accepted);
    assert_eq!(in_res.unwrap(), Conclusion::Accepted);
    assert_eq!(recv_event(&mut out.rx), ConnectionEvent::Connected);
    assert_eq!(recv_event(&mut inc.rx), ConnectionEvent::Connected);
    assert_eq!(out.conn.state(), ConnectionState::Steady);
    assert!(!out.conn.is_read_deflated());

    out.conn.send(Message::query(2, 0, "free music"));
    let query = recv_message(&mut inc.rx);
    assert_eq!(*query.kind(), MessageKind::Query);
    assert_eq!(query.ttl(), 2);
    assert_eq!(&query.payload()[2..12], b"free music");

    let ping = Message::ping(1);
    let guid = ping.guid();
    inc.conn.send(ping);
    let got = recv_message(&mut out.rx);
    assert_eq!(got.guid(), guid);

    wait_until(|| out.conn.stats().received() == 1);
    assert_eq!(out.conn.stats().sent(), 1);
    assert_eq!(inc.conn.stats().received(), 1);

    assert!(out.conn.close());
    assert_eq!(
        recv_event(&mut out.rx),
        ConnectionEvent::Closed {
            reason: CloseReason::Requested
        }
    );
    // The peer sees end of stream.
    assert_eq!(
        recv_event(&mut inc.rx),
        ConnectionEvent::Closed {
            reason: CloseReason::Io
        }
    );
    assert!(inc.conn.is_closed());
}

#[test]
fn test_deflate_in_both_directions() {
    let ((mut out, out_res), (mut inc, in_res)) = connect_pair(
        responder(deflate_headers("out/1.0")),
        responder(deflate_headers("in/1.0")),
        deflate_headers("out/1.0"),
    );
    out_res.unwrap();
    in_res.unwrap();
    assert_eq!(recv_event(&mut out.rx), ConnectionEvent::Connected);
    assert_eq!(recv_event(&mut inc.rx), ConnectionEvent::Connected);
    assert!(out.conn.is_write_deflated() && out.conn.is_read_deflated());
    assert!(inc.conn.is_write_deflated() && inc.conn.is_read_deflated());

    for i in 0..20 {
        out.conn.send(Message::query(2, 0, &format!("repeated query text {i}")));
    }
    for i in 0..20 {
        let query = recv_message(&mut inc.rx);
        let text = format!("repeated query text {i}");
        assert_eq!(&query.payload()[2..2 + text.len()], text.as_bytes());
    }

    inc.conn.send(Message::ping(1));
    assert_eq!(*recv_message(&mut out.rx).kind(), MessageKind::Ping);

    let stats = out.conn.stats();
    assert_eq!(stats.sent(), 20);
    assert!(stats.wire_bytes_out() > 0);
    assert!(stats.send_compression_ratio() < 1.0);

    out.conn.close();
    inc.conn.close();
}

#[test]
fn test_only_one_direction_deflated() {
    // Only the incoming side compresses what it writes.
    let ((mut out, out_res), (mut inc, in_res)) = connect_pair(
        responder(plain_headers("out/1.0").with("Accept-Encoding", "deflate")),
        responder(deflate_headers("in/1.0")),
        plain_headers("out/1.0").with("Accept-Encoding", "deflate"),
    );
    out_res.unwrap();
    in_res.unwrap();
    assert_eq!(recv_event(&mut out.rx), ConnectionEvent::Connected);
    assert_eq!(recv_event(&mut inc.rx), ConnectionEvent::Connected);
    assert!(out.conn.is_read_deflated() && !out.conn.is_write_deflated());
    assert!(inc.conn.is_write_deflated() && !inc.conn.is_read_deflated());

    inc.conn.send(Message::ping(1));
    out.conn.send(Message::ping(1));
    assert_eq!(*recv_message(&mut out.rx).kind(), MessageKind::Ping);
    assert_eq!(*recv_message(&mut inc.rx).kind(), MessageKind::Ping);

    out.conn.close();
    inc.conn.close();
}

#[test]
fn test_rejected_by_peer() {
    let full = |_: &HandshakeResponse, _: bool| HandshakeResponse::slots_full(Headers::new());
    let ((mut out, out_res), (mut inc, in_res)) = connect_pair(
        responder(plain_headers("out/1.0")),
        Arc::new(full),
        plain_headers("out/1.0"),
    );

    let GnutellaError::NoGnutellaOk(rejection) = out_res.unwrap_err() else {
        panic!("expected refusal");
    };
    assert_eq!(rejection.side, Side::Remote);
    assert_eq!(rejection.code(), 503);
    assert!(in_res.unwrap_err().is_slots_full());

    assert_eq!(
        recv_event(&mut out.rx),
        ConnectionEvent::Closed {
            reason: CloseReason::Rejected(503)
        }
    );
    assert_eq!(
        recv_event(&mut inc.rx),
        ConnectionEvent::Closed {
            reason: CloseReason::Rejected(503)
        }
    );
}

#[test]
fn test_close_from_many_threads() {
    let ((mut out, out_res), (inc, in_res)) = connect_pair(
        responder(plain_headers("out/1.0")),
        responder(plain_headers("in/1.0")),
        plain_headers("out/1.0"),
    );
    out_res.unwrap();
    in_res.unwrap();
    assert_eq!(recv_event(&mut out.rx), ConnectionEvent::Connected);

    let closers: Vec<_> = (0..8)
        .map(|_| {
            let conn = Arc::clone(&out.conn);
            thread::spawn(move || conn.close())
        })
        .collect();
    let won = closers
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|&closed| closed)
        .count();
    assert_eq!(won, 1);

    assert_eq!(
        recv_event(&mut out.rx),
        ConnectionEvent::Closed {
            reason: CloseReason::Requested
        }
    );
    // Exactly one close event even though the reader and writer also stop.
    thread::sleep(Duration::from_millis(100));
    assert!(out.rx.try_recv().is_err());

    out.conn.send(Message::ping(1));
    assert_eq!(out.conn.queued(), 0);
    inc.conn.close();
}

#[test]
fn test_hops_flow_from_peer() {
    let ((mut out, out_res), (mut inc, in_res)) = connect_pair(
        responder(plain_headers("out/1.0")),
        responder(plain_headers("in/1.0")),
        plain_headers("out/1.0"),
    );
    out_res.unwrap();
    in_res.unwrap();
    assert_eq!(recv_event(&mut out.rx), ConnectionEvent::Connected);
    assert_eq!(recv_event(&mut inc.rx), ConnectionEvent::Connected);

    inc.conn.send(Message::hops_flow(0));
    assert_eq!(
        recv_event(&mut out.rx),
        ConnectionEvent::CapabilitiesChanged
    );
    assert_eq!(out.conn.hops_flow_max(), Some(0));

    out.conn.close();
    inc.conn.close();
}
