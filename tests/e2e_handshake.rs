//! End-to-end handshake tests against scripted peers.
//!
//! The peer side is driven by hand over a real TCP socket so the exact
//! wire text of each header group can be checked.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{IpAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use gnutella::error::{RejectReason, Side};
use gnutella::{
    ChannelDispatcher, CloseReason, Conclusion, Config, Connection, ConnectionContext,
    ConnectionEvent, GnutellaError, HandshakeResponse, Headers, MessageKind, NetworkIdentity,
    Notice, Responder, SharedIdentity, StaticResponder,
};
use tokio::sync::mpsc::UnboundedReceiver;

const TIMEOUT: Duration = Duration::from_secs(5);

fn context(responder: Arc<dyn Responder>) -> (ConnectionContext, UnboundedReceiver<Notice>) {
    let (dispatcher, rx) = ChannelDispatcher::new();
    let ctx = ConnectionContext::new(Arc::new(Config::default()), responder)
        .with_dispatcher(Arc::new(dispatcher));
    (ctx, rx)
}

fn static_responder() -> Arc<dyn Responder> {
    Arc::new(StaticResponder::new(
        Headers::new().with("User-Agent", "engine-test/1.0"),
    ))
}

/// Read one header group: the first line plus headers up to the blank line.
fn read_group(reader: &mut impl BufRead) -> Vec<String> {
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap() == 0 {
            return lines;
        }
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        if line.is_empty() {
            return lines;
        }
        lines.push(line);
    }
}

/// Header-only ping: GUID, opcode 0x00, TTL, hops, zero length.
fn ping_frame(ttl: u8, hops: u8) -> Vec<u8> {
    let mut frame = vec![0xab; 16];
    frame.extend_from_slice(&[0x00, ttl, hops, 0, 0, 0, 0]);
    frame
}

fn next_event(rx: &mut UnboundedReceiver<Notice>) -> ConnectionEvent {
    match rx.blocking_recv() {
        Some(Notice::Event { event, .. }) => event,
        other => panic!("expected event, got {other:?}"),
    }
}

/// Outgoing connection: request, server 200, our final 200, then messages.
#[test]
fn test_outgoing_handshake_against_scripted_server() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut writer = stream;

        let request = read_group(&mut reader);
        writer
            .write_all(
                b"GNUTELLA/0.6 200 OK\r\n\
                  User-Agent: scripted/1.0\r\n\
                  Remote-IP: 203.0.113.9\r\n\
                  \r\n",
            )
            .unwrap();
        let final_group = read_group(&mut reader);
        writer.write_all(&ping_frame(1, 0)).unwrap();
        (request, final_group, writer)
    });

    let identity = Arc::new(SharedIdentity::new());
    let (ctx, mut rx) = context(static_responder());
    let ctx = ctx.with_identity(identity.clone());
    let request = Headers::new()
        .with("User-Agent", "engine-test/1.0")
        .with("Remote-IP", "0.0.0.0");
    let conn = Arc::new(Connection::outgoing(addr, request, ctx));

    assert_eq!(conn.initialize(TIMEOUT).unwrap(), Conclusion::Accepted);
    let (request, final_group, _writer) = server.join().unwrap();

    assert_eq!(request[0], "GNUTELLA CONNECT/0.6");
    assert!(request.contains(&"User-Agent: engine-test/1.0".to_string()));
    // Remote-IP carries how we see the peer, not the placeholder.
    assert!(request.contains(&"Remote-IP: 127.0.0.1".to_string()));
    assert_eq!(final_group[0], "GNUTELLA/0.6 200 OK");

    assert_eq!(next_event(&mut rx), ConnectionEvent::Connected);
    match rx.blocking_recv() {
        Some(Notice::Message { message, .. }) => {
            assert_eq!(*message.kind(), MessageKind::Ping);
            assert_eq!(message.ttl(), 1);
        },
        other => panic!("expected ping, got {other:?}"),
    }

    let ip: IpAddr = "203.0.113.9".parse().unwrap();
    assert_eq!(identity.address(), Some(ip));
    assert_eq!(conn.headers_read().unwrap().get("user-agent"), Some("scripted/1.0"));
    assert_eq!(conn.soft_max_ttl(), Config::default().messages.soft_max_ttl);

    assert!(conn.close());
    assert_eq!(
        next_event(&mut rx),
        ConnectionEvent::Closed {
            reason: CloseReason::Requested
        }
    );
}

/// Incoming connection refused by our responder: the peer sees 503.
#[test]
fn test_incoming_slots_full_reaches_peer() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let client = std::thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .write_all(b"GNUTELLA CONNECT/0.6\r\nUser-Agent: hopeful/0.1\r\n\r\n")
            .unwrap();
        read_group(&mut BufReader::new(stream))
    });

    let full = |_: &HandshakeResponse, _: bool| HandshakeResponse::slots_full(Headers::new());
    let (ctx, mut rx) = context(Arc::new(full));
    let (stream, _) = listener.accept().unwrap();
    let conn = Arc::new(Connection::incoming(stream, ctx).unwrap());

    let err = conn.initialize(TIMEOUT).unwrap_err();
    assert!(err.is_slots_full());
    let GnutellaError::NoGnutellaOk(rejection) = err else {
        panic!("expected refusal");
    };
    assert_eq!(rejection.side, Side::Local);
    assert_eq!(rejection.reason, RejectReason::SlotsFull);

    let response = client.join().unwrap();
    assert!(response[0].starts_with("GNUTELLA/0.6 503"));
    assert_eq!(
        next_event(&mut rx),
        ConnectionEvent::Closed {
            reason: CloseReason::Rejected(503)
        }
    );
}

/// A crawler completes the handshake and is dropped immediately.
#[test]
fn test_crawler_is_accepted_then_closed() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let client = std::thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        stream
            .write_all(b"GNUTELLA CONNECT/0.6\r\nCrawler: 0.1\r\n\r\n")
            .unwrap();
        let response = read_group(&mut reader);
        stream.write_all(b"GNUTELLA/0.6 200 OK\r\n\r\n").unwrap();
        let mut rest = Vec::new();
        let _ = reader.read_to_end(&mut rest);
        (response, rest)
    });

    let (ctx, mut rx) = context(static_responder());
    let (stream, _) = listener.accept().unwrap();
    let conn = Arc::new(Connection::incoming(stream, ctx).unwrap());

    assert_eq!(
        conn.initialize(TIMEOUT).unwrap(),
        Conclusion::AcceptedButDisconnect
    );
    assert!(conn.is_closed());
    assert_eq!(
        next_event(&mut rx),
        ConnectionEvent::Closed {
            reason: CloseReason::Crawler
        }
    );

    let (response, rest) = client.join().unwrap();
    assert_eq!(response[0], "GNUTELLA/0.6 200 OK");
    assert!(rest.is_empty());
}

/// Garbage instead of a connect line is a handshake violation.
#[test]
fn test_bad_connect_line_closes() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let client = std::thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"HELLO WORLD\r\n\r\n").unwrap();
        stream
    });

    let (ctx, mut rx) = context(static_responder());
    let (stream, _) = listener.accept().unwrap();
    let conn = Arc::new(Connection::incoming(stream, ctx).unwrap());

    assert!(matches!(
        conn.initialize(TIMEOUT),
        Err(GnutellaError::BadHandshake(_))
    ));
    assert_eq!(
        next_event(&mut rx),
        ConnectionEvent::Closed {
            reason: CloseReason::BadHandshake
        }
    );
    drop(client.join());
}
