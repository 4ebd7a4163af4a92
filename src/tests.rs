use crate::close::{is_valid_wire_code, truncate_reason};
use crate::config::{DeflateOptions, ReconnectPolicy, WebSocketConfig};
use crate::connection::{ConnectionState, WSConnection};
use crate::deflate::PerMessageDeflate;
use crate::error::Error;
use crate::event::Event;
use crate::frame::{OpCode, RSV1};
use crate::message::Message;
use crate::read::FrameReader;
use crate::transport::{BoxedStream, Transport};
use crate::utils::generate_websocket_accept_value;
use crate::write::FrameWriter;
use crate::WSClient;
use futures::future::BoxFuture;
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;
use url::Url;

// ---------------------------------------------------------------------
// Test doubles: an in-process transport over tokio duplex pipes plus a
// minimal scripted server speaking just enough of the protocol.
// ---------------------------------------------------------------------

struct TestTransport {
    server_side: UnboundedSender<DuplexStream>,
    attempts: AtomicUsize,
    fail_next: AtomicUsize,
}

impl TestTransport {
    fn new() -> (Arc<Self>, UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                server_side: tx,
                attempts: AtomicUsize::new(0),
                fail_next: AtomicUsize::new(0),
            }),
            rx,
        )
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn fail_next_connects(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }
}

impl Transport for TestTransport {
    fn connect<'a>(&'a self, _url: &'a Url) -> BoxFuture<'a, Result<BoxedStream, Error>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(Error::IOError {
                    source: std::io::Error::new(
                        std::io::ErrorKind::ConnectionRefused,
                        "synthetic refusal",
                    ),
                });
            }
            let (client, server) = tokio::io::duplex(1 << 20);
            self.server_side
                .send(server)
                .map_err(|_| Error::InvalidState("test server receiver gone"))?;
            Ok(Box::new(client) as BoxedStream)
        })
    }
}

fn test_config() -> WebSocketConfig {
    WebSocketConfig {
        ping_interval: Duration::ZERO,
        close_handshake_timeout: Duration::from_millis(300),
        reconnect: ReconnectPolicy::disabled(),
        ..Default::default()
    }
}

async fn read_request(stream: &mut DuplexStream) -> String {
    let mut buf: Vec<u8> = Vec::new();
    let mut tmp = [0u8; 1024];
    while !buf.windows(4).any(|window| window == b"\r\n\r\n") {
        let n = stream.read(&mut tmp).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
    }
    String::from_utf8(buf).unwrap()
}

fn key_from_request(request: &str) -> String {
    request
        .lines()
        .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
        .expect("request carries a key")
        .trim()
        .to_owned()
}

fn upgrade_response(accept: &str, extra_headers: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n{}\r\n",
        accept, extra_headers
    )
}

/// Answers the upgrade and returns the request for inspection.
async fn accept_handshake(stream: &mut DuplexStream, extra_headers: &str) -> String {
    let request = read_request(stream).await;
    let accept = generate_websocket_accept_value(&key_from_request(&request));
    stream
        .write_all(upgrade_response(&accept, extra_headers).as_bytes())
        .await
        .unwrap();
    request
}

/// Server-side frame write: unmasked, arbitrary header bits.
async fn send_server_frame(stream: &mut DuplexStream, fin: bool, rsv: u8, opcode: u8, payload: &[u8]) {
    let mut out: Vec<u8> = Vec::with_capacity(payload.len() + 10);
    out.push((fin as u8) << 7 | rsv | opcode);
    if payload.len() <= 125 {
        out.push(payload.len() as u8);
    } else if payload.len() <= 65535 {
        out.push(126);
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }
    out.extend_from_slice(payload);
    stream.write_all(&out).await.unwrap();
}

struct ClientFrame {
    fin: bool,
    rsv: u8,
    opcode: u8,
    payload: Vec<u8>,
}

/// Server-side frame read: asserts the mask invariant and unmasks.
async fn read_client_frame(stream: &mut DuplexStream) -> ClientFrame {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await.unwrap();
    let fin = header[0] & 0x80 != 0;
    let rsv = header[0] & 0x70;
    let opcode = header[0] & 0x0F;
    // Invariant: no outbound client frame may have MASK=0.
    assert!(header[1] & 0x80 != 0, "client frame was not masked");

    let mut len = (header[1] & 0x7F) as usize;
    if len == 126 {
        let mut ext = [0u8; 2];
        stream.read_exact(&mut ext).await.unwrap();
        len = u16::from_be_bytes(ext) as usize;
    } else if len == 127 {
        let mut ext = [0u8; 8];
        stream.read_exact(&mut ext).await.unwrap();
        len = u64::from_be_bytes(ext) as usize;
    }
    let mut mask = [0u8; 4];
    stream.read_exact(&mut mask).await.unwrap();
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
    ClientFrame {
        fin,
        rsv,
        opcode,
        payload,
    }
}

fn close_code_of(frame: &ClientFrame) -> u16 {
    assert_eq!(frame.opcode, 0x8);
    u16::from_be_bytes([frame.payload[0], frame.payload[1]])
}

// ---------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------

#[test]
fn test_accept_key_reference_vector() {
    assert_eq!(
        generate_websocket_accept_value("dGhlIHNhbXBsZSBub25jZQ=="),
        "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
    );
}

#[tokio::test]
async fn test_handshake_opens_connection() {
    let (transport, mut incoming) = TestTransport::new();
    let server = tokio::spawn(async move {
        let mut stream = incoming.recv().await.unwrap();
        let request = accept_handshake(&mut stream, "").await;
        assert!(request.starts_with("GET /chat?room=1 HTTP/1.1"));
        assert!(request.contains("Sec-WebSocket-Version: 13"));
        assert!(request.contains("Host: example.test:9001"));
        stream
    });

    let conn = WSConnection::connect(
        "ws://example.test:9001/chat?room=1",
        transport.as_ref(),
        test_config(),
    )
    .await
    .unwrap();
    assert_eq!(conn.state(), ConnectionState::Open);
    let _stream = server.await.unwrap();
    conn.abort();
}

#[tokio::test]
async fn test_handshake_rejects_bad_accept_key() {
    let (transport, mut incoming) = TestTransport::new();
    tokio::spawn(async move {
        let mut stream = incoming.recv().await.unwrap();
        let _ = read_request(&mut stream).await;
        stream
            .write_all(upgrade_response("bm90IHRoZSByaWdodCBrZXk=", "").as_bytes())
            .await
            .unwrap();
        stream
    });

    let err = WSConnection::connect("ws://example.test/", transport.as_ref(), test_config())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidAcceptKey));
}

#[tokio::test]
async fn test_handshake_surfaces_rejection_body() {
    let (transport, mut incoming) = TestTransport::new();
    tokio::spawn(async move {
        let mut stream = incoming.recv().await.unwrap();
        let _ = read_request(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 9\r\n\r\nforbidden")
            .await
            .unwrap();
        stream
    });

    let err = WSConnection::connect("ws://example.test/", transport.as_ref(), test_config())
        .await
        .unwrap_err();
    match err {
        Error::HandshakeFailed { status, body } => {
            assert_eq!(status, 403);
            assert!(body.contains("forbidden"));
        }
        other => panic!("expected HandshakeFailed, got {other}"),
    }
}

#[tokio::test]
async fn test_subprotocol_must_be_offered() {
    let (transport, mut incoming) = TestTransport::new();
    tokio::spawn(async move {
        let mut stream = incoming.recv().await.unwrap();
        let request = read_request(&mut stream).await;
        let accept = generate_websocket_accept_value(&key_from_request(&request));
        stream
            .write_all(
                upgrade_response(&accept, "Sec-WebSocket-Protocol: sneaky\r\n").as_bytes(),
            )
            .await
            .unwrap();
        stream
    });

    let mut config = test_config();
    config.sub_protocols = vec!["chat".into()];
    let err = WSConnection::connect("ws://example.test/", transport.as_ref(), config)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidSubProtocol(_)));
}

#[tokio::test]
async fn test_prefetched_frame_after_headers() {
    let (transport, mut incoming) = TestTransport::new();
    tokio::spawn(async move {
        let mut stream = incoming.recv().await.unwrap();
        let request = read_request(&mut stream).await;
        let accept = generate_websocket_accept_value(&key_from_request(&request));
        // The 101 head and the first frame arrive in one segment.
        let mut bytes = upgrade_response(&accept, "").into_bytes();
        bytes.extend_from_slice(&[0x81, 0x05, b'e', b'a', b'r', b'l', b'y']);
        stream.write_all(&bytes).await.unwrap();
        stream
    });

    let conn = WSConnection::connect("ws://example.test/", transport.as_ref(), test_config())
        .await
        .unwrap();
    let message = timeout(Duration::from_secs(1), conn.receive())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message, Message::Text("early".into()));
    conn.abort();
}

// ---------------------------------------------------------------------
// Receive path
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_fragmented_text_reassembles() {
    let (transport, mut incoming) = TestTransport::new();
    tokio::spawn(async move {
        let mut stream = incoming.recv().await.unwrap();
        accept_handshake(&mut stream, "").await;
        send_server_frame(&mut stream, false, 0, 0x1, b"Hel").await;
        send_server_frame(&mut stream, false, 0, 0x0, b"lo, ").await;
        send_server_frame(&mut stream, true, 0, 0x0, b"World").await;
        stream
    });

    let conn = WSConnection::connect("ws://example.test/", transport.as_ref(), test_config())
        .await
        .unwrap();
    let message = timeout(Duration::from_secs(1), conn.receive())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message, Message::Text("Hello, World".into()));
    conn.abort();
}

#[tokio::test]
async fn test_unsolicited_continuation_closes_1002() {
    let (transport, mut incoming) = TestTransport::new();
    let server = tokio::spawn(async move {
        let mut stream = incoming.recv().await.unwrap();
        accept_handshake(&mut stream, "").await;
        send_server_frame(&mut stream, true, 0, 0x0, b"abc").await;
        let close = read_client_frame(&mut stream).await;
        assert_eq!(close_code_of(&close), 1002);
        stream
    });

    let conn = WSConnection::connect("ws://example.test/", transport.as_ref(), test_config())
        .await
        .unwrap();
    let err = timeout(Duration::from_secs(1), conn.receive())
        .await
        .unwrap()
        .unwrap_err();
    match err {
        Error::ConnectionClosed(cause) => {
            assert!(matches!(*cause, Error::UnexpectedContinuation))
        }
        other => panic!("expected ConnectionClosed, got {other}"),
    }
    server.await.unwrap();
}

#[tokio::test]
async fn test_oversized_frame_closes_1009() {
    let (transport, mut incoming) = TestTransport::new();
    let server = tokio::spawn(async move {
        let mut stream = incoming.recv().await.unwrap();
        accept_handshake(&mut stream, "").await;
        // Header declares 2048 bytes; no payload needs to follow.
        stream.write_all(&[0x82, 126, 0x08, 0x00]).await.unwrap();
        let close = read_client_frame(&mut stream).await;
        assert_eq!(close_code_of(&close), 1009);
        stream
    });

    let mut config = test_config();
    config.max_frame_size = 1024;
    config.fragmentation_threshold = 1024;
    config.max_message_size = 512 * 1024;
    let conn = WSConnection::connect("ws://example.test/", transport.as_ref(), config)
        .await
        .unwrap();
    conn.wait_closed().await;
    assert!(matches!(
        conn.terminal_error().as_deref(),
        Some(Error::FrameTooLarge { size: 2048, .. })
    ));
    server.await.unwrap();
}

#[tokio::test]
async fn test_masked_server_frame_rejected() {
    let (transport, mut incoming) = TestTransport::new();
    tokio::spawn(async move {
        let mut stream = incoming.recv().await.unwrap();
        accept_handshake(&mut stream, "").await;
        // Invariant: no inbound frame is accepted with MASK=1.
        stream
            .write_all(&[0x81, 0x83, 1, 2, 3, 4, b'a' ^ 1, b'b' ^ 2, b'c' ^ 3])
            .await
            .unwrap();
        stream
    });

    let conn = WSConnection::connect("ws://example.test/", transport.as_ref(), test_config())
        .await
        .unwrap();
    conn.wait_closed().await;
    assert!(matches!(
        conn.terminal_error().as_deref(),
        Some(Error::MaskedServerFrame)
    ));
}

#[tokio::test]
async fn test_invalid_utf8_text_closes_1007() {
    let (transport, mut incoming) = TestTransport::new();
    let server = tokio::spawn(async move {
        let mut stream = incoming.recv().await.unwrap();
        accept_handshake(&mut stream, "").await;
        send_server_frame(&mut stream, true, 0, 0x1, &[0xFF, 0xFE, 0xFD]).await;
        let close = read_client_frame(&mut stream).await;
        assert_eq!(close_code_of(&close), 1007);
        stream
    });

    let conn = WSConnection::connect("ws://example.test/", transport.as_ref(), test_config())
        .await
        .unwrap();
    conn.wait_closed().await;
    assert!(matches!(
        conn.terminal_error().as_deref(),
        Some(Error::InvalidUtf8)
    ));
    server.await.unwrap();
}

#[tokio::test]
async fn test_single_byte_close_payload_rejected() {
    let (transport, mut incoming) = TestTransport::new();
    let server = tokio::spawn(async move {
        let mut stream = incoming.recv().await.unwrap();
        accept_handshake(&mut stream, "").await;
        send_server_frame(&mut stream, true, 0, 0x8, &[0x03]).await;
        let close = read_client_frame(&mut stream).await;
        assert_eq!(close_code_of(&close), 1002);
        stream
    });

    let conn = WSConnection::connect("ws://example.test/", transport.as_ref(), test_config())
        .await
        .unwrap();
    conn.wait_closed().await;
    assert!(matches!(
        conn.terminal_error().as_deref(),
        Some(Error::InvalidClosePayload)
    ));
    server.await.unwrap();
}

#[tokio::test]
async fn test_server_ping_echoed_as_pong() {
    let (transport, mut incoming) = TestTransport::new();
    let server = tokio::spawn(async move {
        let mut stream = incoming.recv().await.unwrap();
        accept_handshake(&mut stream, "").await;
        send_server_frame(&mut stream, true, 0, 0x9, b"marco").await;
        let pong = read_client_frame(&mut stream).await;
        assert_eq!(pong.opcode, 0xA);
        assert_eq!(pong.payload, b"marco");
        stream
    });

    let conn = WSConnection::connect("ws://example.test/", transport.as_ref(), test_config())
        .await
        .unwrap();
    server.await.unwrap();
    conn.abort();
}

#[tokio::test]
async fn test_concurrent_receives_rejected() {
    let (transport, mut incoming) = TestTransport::new();
    tokio::spawn(async move {
        let mut stream = incoming.recv().await.unwrap();
        accept_handshake(&mut stream, "").await;
        stream
    });

    let conn = Arc::new(
        WSConnection::connect("ws://example.test/", transport.as_ref(), test_config())
            .await
            .unwrap(),
    );
    let blocked = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.receive().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished());

    // Invariant: concurrent Receive calls never both observe an item.
    let err = conn.receive().await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
    let err = conn.receive_all().map(|_| ()).unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));

    conn.abort();
    let _ = blocked.await.unwrap();
}

// ---------------------------------------------------------------------
// Send path
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_send_text_masked_on_wire() {
    let (transport, mut incoming) = TestTransport::new();
    let server = tokio::spawn(async move {
        let mut stream = incoming.recv().await.unwrap();
        accept_handshake(&mut stream, "").await;
        let frame = read_client_frame(&mut stream).await;
        assert!(frame.fin);
        assert_eq!(frame.opcode, 0x1);
        assert_eq!(frame.payload, b"ahoy");
        stream
    });

    let conn = WSConnection::connect("ws://example.test/", transport.as_ref(), test_config())
        .await
        .unwrap();
    conn.send_text("ahoy").await.unwrap();
    server.await.unwrap();

    let metrics = conn.metrics();
    assert_eq!(metrics.messages_sent, 1);
    assert_eq!(metrics.frames_sent, 1);
    assert!(metrics.bytes_sent > 4);
    conn.abort();
}

#[tokio::test]
async fn test_large_send_fragments_with_continuations() {
    let (transport, mut incoming) = TestTransport::new();
    let server = tokio::spawn(async move {
        let mut stream = incoming.recv().await.unwrap();
        accept_handshake(&mut stream, "").await;
        let first = read_client_frame(&mut stream).await;
        assert!(!first.fin);
        assert_eq!(first.opcode, 0x2);
        let middle = read_client_frame(&mut stream).await;
        assert!(!middle.fin);
        assert_eq!(middle.opcode, 0x0);
        let last = read_client_frame(&mut stream).await;
        assert!(last.fin);
        assert_eq!(last.opcode, 0x0);
        let mut all = first.payload;
        all.extend_from_slice(&middle.payload);
        all.extend_from_slice(&last.payload);
        all
    });

    let mut config = test_config();
    config.fragmentation_threshold = 1000;
    let conn = WSConnection::connect("ws://example.test/", transport.as_ref(), config)
        .await
        .unwrap();
    let data: Vec<u8> = (0..2500u32).map(|i| i as u8).collect();
    conn.send_binary(data.clone()).await.unwrap();
    let reassembled = server.await.unwrap();
    assert_eq!(reassembled, data);
    conn.abort();
}

#[tokio::test]
async fn test_send_rejected_after_close() {
    let (transport, mut incoming) = TestTransport::new();
    tokio::spawn(async move {
        let mut stream = incoming.recv().await.unwrap();
        accept_handshake(&mut stream, "").await;
        stream
    });

    let conn = WSConnection::connect("ws://example.test/", transport.as_ref(), test_config())
        .await
        .unwrap();
    conn.abort();
    let err = conn.send_text("late").await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
}

// ---------------------------------------------------------------------
// Close handshake & keepalive
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_graceful_close_round_trip() {
    let (transport, mut incoming) = TestTransport::new();
    let server = tokio::spawn(async move {
        let mut stream = incoming.recv().await.unwrap();
        accept_handshake(&mut stream, "").await;
        let close = read_client_frame(&mut stream).await;
        assert_eq!(close.opcode, 0x8);
        assert_eq!(close.payload, vec![0x03, 0xE8, b'b', b'y', b'e']);
        // Reply with our own close status.
        let mut reply = vec![0x03, 0xE8];
        reply.extend_from_slice(b"ok");
        send_server_frame(&mut stream, true, 0, 0x8, &reply).await;
        // No further frame may arrive; the client tears the stream down.
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest).await;
        rest
    });

    let conn = WSConnection::connect("ws://example.test/", transport.as_ref(), test_config())
        .await
        .unwrap();
    conn.close(1000, "bye").await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Closed);

    // The remote status wins the close-status race.
    let status = conn.close_status().unwrap();
    assert_eq!(status.code(), 1000);
    assert_eq!(status.reason(), "ok");

    let rest = server.await.unwrap();
    assert!(rest.is_empty(), "exactly one close frame expected");
}

#[tokio::test]
async fn test_close_rejects_invalid_code() {
    let (transport, mut incoming) = TestTransport::new();
    tokio::spawn(async move {
        let mut stream = incoming.recv().await.unwrap();
        accept_handshake(&mut stream, "").await;
        stream
    });

    let conn = WSConnection::connect("ws://example.test/", transport.as_ref(), test_config())
        .await
        .unwrap();
    let err = conn.close(1005, "nope").await.unwrap_err();
    assert!(matches!(err, Error::InvalidCloseCode(1005)));
    conn.abort();
}

#[tokio::test]
async fn test_peer_close_receives_reciprocal_1000() {
    let (transport, mut incoming) = TestTransport::new();
    let server = tokio::spawn(async move {
        let mut stream = incoming.recv().await.unwrap();
        accept_handshake(&mut stream, "").await;
        let mut payload = vec![0x03, 0xE9]; // 1001 going away
        payload.extend_from_slice(b"brb");
        send_server_frame(&mut stream, true, 0, 0x8, &payload).await;
        let reply = read_client_frame(&mut stream).await;
        assert_eq!(close_code_of(&reply), 1000);
        stream
    });

    let conn = WSConnection::connect("ws://example.test/", transport.as_ref(), test_config())
        .await
        .unwrap();
    conn.wait_closed().await;
    let status = conn.close_status().unwrap();
    assert_eq!(status.code(), 1001);
    assert_eq!(status.reason(), "brb");
    assert!(matches!(
        conn.terminal_error().as_deref(),
        Some(Error::PeerClosed(_))
    ));
    server.await.unwrap();
}

#[tokio::test]
async fn test_pong_timeout_finalizes() {
    let (transport, mut incoming) = TestTransport::new();
    tokio::spawn(async move {
        let mut stream = incoming.recv().await.unwrap();
        accept_handshake(&mut stream, "").await;
        // Swallow the pings, never answer.
        loop {
            let mut sink = [0u8; 256];
            if stream.read(&mut sink).await.unwrap_or(0) == 0 {
                break;
            }
        }
    });

    let mut config = test_config();
    config.ping_interval = Duration::from_millis(100);
    config.pong_timeout = Duration::from_millis(200);
    let conn = WSConnection::connect("ws://example.test/", transport.as_ref(), config)
        .await
        .unwrap();
    timeout(Duration::from_secs(2), conn.wait_closed())
        .await
        .expect("connection should close within ping+pong budget");
    assert!(matches!(
        conn.terminal_error().as_deref(),
        Some(Error::PongTimeout)
    ));
}

#[tokio::test]
async fn test_keepalive_ping_carries_counter_and_pong_satisfies() {
    let (transport, mut incoming) = TestTransport::new();
    let server = tokio::spawn(async move {
        let mut stream = incoming.recv().await.unwrap();
        accept_handshake(&mut stream, "").await;
        let ping = read_client_frame(&mut stream).await;
        assert_eq!(ping.opcode, 0x9);
        assert_eq!(ping.payload, 1u64.to_be_bytes());
        send_server_frame(&mut stream, true, 0, 0xA, &ping.payload).await;
        let second = read_client_frame(&mut stream).await;
        assert_eq!(second.payload, 2u64.to_be_bytes());
        send_server_frame(&mut stream, true, 0, 0xA, &second.payload).await;
        stream
    });

    let mut config = test_config();
    config.ping_interval = Duration::from_millis(80);
    config.pong_timeout = Duration::from_millis(400);
    let conn = WSConnection::connect("ws://example.test/", transport.as_ref(), config)
        .await
        .unwrap();
    let _stream = server.await.unwrap();
    // Give the client a beat to process the second pong.
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(conn.state(), ConnectionState::Open);
    let metrics = conn.metrics();
    assert!(metrics.pings_sent >= 2);
    assert!(metrics.pongs_received >= 2);
    conn.abort();
}

#[tokio::test]
async fn test_idle_timeout_without_messages() {
    let (transport, mut incoming) = TestTransport::new();
    tokio::spawn(async move {
        let mut stream = incoming.recv().await.unwrap();
        accept_handshake(&mut stream, "").await;
        stream
    });

    let mut config = test_config();
    config.idle_timeout = Duration::from_millis(150);
    let conn = WSConnection::connect("ws://example.test/", transport.as_ref(), config)
        .await
        .unwrap();
    timeout(Duration::from_secs(2), conn.wait_closed())
        .await
        .expect("idle timeout should fire");
    assert!(matches!(
        conn.terminal_error().as_deref(),
        Some(Error::IdleTimeout)
    ));
}

// ---------------------------------------------------------------------
// Compression end to end
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_permessage_deflate_round_trip() {
    let (transport, mut incoming) = TestTransport::new();
    let server = tokio::spawn(async move {
        let mut stream = incoming.recv().await.unwrap();
        let request =
            accept_handshake(&mut stream, "Sec-WebSocket-Extensions: permessage-deflate\r\n")
                .await;
        assert!(request.contains("permessage-deflate"));

        let frame = read_client_frame(&mut stream).await;
        assert!(frame.fin);
        assert_eq!(frame.opcode, 0x1);
        assert_eq!(frame.rsv, RSV1);
        // Compressed: the wire payload must undercut the 4096 raw bytes.
        assert!(frame.payload.len() < 4096);
        // Echo the compressed payload back unmodified.
        send_server_frame(&mut stream, true, RSV1, 0x1, &frame.payload).await;
        stream
    });

    let mut config = test_config();
    config.extensions = vec![Arc::new(
        PerMessageDeflate::new(DeflateOptions::default()).unwrap(),
    )];
    let conn = WSConnection::connect("ws://example.test/", transport.as_ref(), config)
        .await
        .unwrap();

    let text = "A".repeat(4096);
    conn.send_text(text.clone()).await.unwrap();
    let message = timeout(Duration::from_secs(1), conn.receive())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message, Message::Text(text));

    let metrics = conn.metrics();
    assert_eq!(metrics.uncompressed_bytes_sent, 4096);
    assert!(metrics.compressed_bytes_sent < 4096);
    assert!(metrics.compressed_bytes_received > 0);
    let _stream = server.await.unwrap();
    conn.abort();
}

#[tokio::test]
async fn test_require_negotiated_extensions_fails_with_1010() {
    let (transport, mut incoming) = TestTransport::new();
    let server = tokio::spawn(async move {
        let mut stream = incoming.recv().await.unwrap();
        // Ignore the deflate offer entirely.
        accept_handshake(&mut stream, "").await;
        let close = read_client_frame(&mut stream).await;
        assert_eq!(close_code_of(&close), 1010);
        stream
    });

    let mut config = test_config();
    config.extensions = vec![Arc::new(
        PerMessageDeflate::new(DeflateOptions::default()).unwrap(),
    )];
    config.require_negotiated_extensions = true;
    let err = WSConnection::connect("ws://example.test/", transport.as_ref(), config)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ExtensionNegotiationFailed(_)));
    server.await.unwrap();
}

// ---------------------------------------------------------------------
// Resilient client
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_reconnect_backoff_delays_and_events() {
    let (transport, mut incoming) = TestTransport::new();
    let accepted = Arc::new(AtomicUsize::new(0));
    let server_accepted = accepted.clone();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Some(mut stream) = incoming.recv().await {
            accept_handshake(&mut stream, "").await;
            server_accepted.fetch_add(1, Ordering::SeqCst);
            if server_accepted.load(Ordering::SeqCst) == 1 {
                // First connection dies right away to trigger reconnects.
                drop(stream);
            } else {
                held.push(stream);
            }
        }
    });

    let mut config = test_config();
    config.reconnect = ReconnectPolicy {
        max_retries: 5,
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        multiplier: 2.0,
        jitter: 0.1,
        ..Default::default()
    };
    let (client, mut events) =
        WSClient::connect_with_transport("ws://example.test/", transport.clone(), config)
            .await
            .unwrap();

    // Attempts 1 and 2 are refused; attempt 3 lands.
    transport.fail_next_connects(2);

    let mut reconnecting: Vec<(u32, Duration)> = Vec::new();
    let mut reconnected = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while reconnected == 0 {
        let event = tokio::time::timeout_at(deadline, events.next())
            .await
            .expect("event stream stalled")
            .expect("event stream ended early");
        match event {
            Event::Reconnecting { attempt, delay } => reconnecting.push((attempt, delay)),
            Event::Reconnected(_) => reconnected += 1,
            _ => {}
        }
    }

    assert_eq!(reconnected, 1);
    assert_eq!(
        reconnecting.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    let bounds = [(90u64, 110u64), (180, 220), (360, 440)];
    for ((_, delay), (low, high)) in reconnecting.iter().zip(bounds) {
        assert!(
            (Duration::from_millis(low)..=Duration::from_millis(high)).contains(delay),
            "delay {delay:?} outside [{low}ms, {high}ms]"
        );
    }
    // 1 initial + 2 refused + 1 successful reconnect.
    assert_eq!(transport.attempts(), 4);

    client.close(1000, "done").await.unwrap();
    client.wait_closed().await;
}

#[tokio::test]
async fn test_manual_close_emits_single_closed_event() {
    let (transport, mut incoming) = TestTransport::new();
    let server = tokio::spawn(async move {
        let mut stream = incoming.recv().await.unwrap();
        accept_handshake(&mut stream, "").await;
        let close = read_client_frame(&mut stream).await;
        send_server_frame(&mut stream, true, 0, 0x8, &close.payload).await;
        stream
    });

    let (client, mut events) =
        WSClient::connect_with_transport("ws://example.test/", transport, test_config())
            .await
            .unwrap();
    client.close(1000, "done").await.unwrap();
    client.wait_closed().await;
    server.await.unwrap();
    drop(client);

    let mut closed_events = 0;
    while let Some(event) = events.next().await {
        if let Event::Closed { code, .. } = event {
            closed_events += 1;
            assert_eq!(code, Some(1000));
        }
    }
    assert_eq!(closed_events, 1, "exactly one Closed event per lifetime");
}

#[tokio::test]
async fn test_client_gives_up_after_max_retries() {
    let (transport, mut incoming) = TestTransport::new();
    tokio::spawn(async move {
        // Accept only the first connection, then refuse service.
        if let Some(mut stream) = incoming.recv().await {
            accept_handshake(&mut stream, "").await;
            drop(stream);
        }
    });

    let mut config = test_config();
    config.reconnect = ReconnectPolicy {
        max_retries: 2,
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        multiplier: 2.0,
        jitter: 0.0,
        ..Default::default()
    };
    let (client, mut events) =
        WSClient::connect_with_transport("ws://example.test/", transport.clone(), config)
            .await
            .unwrap();
    transport.fail_next_connects(usize::MAX);

    timeout(Duration::from_secs(5), client.wait_closed())
        .await
        .expect("client should give up");

    let mut saw_closed = false;
    while let Ok(Some(event)) = timeout(Duration::from_millis(100), events.next()).await {
        if matches!(event, Event::Closed { .. }) {
            saw_closed = true;
        }
    }
    assert!(saw_closed);
    // Initial connect + 2 retry attempts.
    assert_eq!(transport.attempts(), 3);
}

// ---------------------------------------------------------------------
// Frame header boundaries
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_header_length_classes_on_write() {
    for (len, expected_class) in [
        (0usize, 0u8),
        (125, 0),
        (126, 126),
        (65535, 126),
        (65536, 127),
    ] {
        let (client, mut server) = tokio::io::duplex(1 << 20);
        let mut writer = FrameWriter::new(client, usize::MAX);
        let payload = vec![0x55u8; len];
        writer
            .write_frame(true, OpCode::Binary, 0, &payload)
            .await
            .unwrap();

        let mut header = [0u8; 2];
        server.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], 0x82);
        let len7 = header[1] & 0x7F;
        match expected_class {
            0 => assert_eq!(len7 as usize, len),
            126 => {
                assert_eq!(len7, 126);
                let mut ext = [0u8; 2];
                server.read_exact(&mut ext).await.unwrap();
                assert_eq!(u16::from_be_bytes(ext) as usize, len);
            }
            _ => {
                assert_eq!(len7, 127);
                let mut ext = [0u8; 8];
                server.read_exact(&mut ext).await.unwrap();
                assert_eq!(u64::from_be_bytes(ext) as usize, len);
            }
        }
    }
}

#[tokio::test]
async fn test_reader_parses_63_bit_length_and_rejects_overflow() {
    // 2^31-1 parses into the 64-bit class and trips the size limit.
    let (mut sender, receiver) = tokio::io::duplex(64);
    let mut header = vec![0x82u8, 127];
    header.extend_from_slice(&((1u64 << 31) - 1).to_be_bytes());
    sender.write_all(&header).await.unwrap();
    let mut reader = FrameReader::new(receiver, 0, 1 << 20);
    let err = reader.read_frame(false).await.unwrap_err();
    assert!(matches!(
        err,
        Error::FrameTooLarge {
            size,
            ..
        } if size == (1usize << 31) - 1
    ));

    // The high bit set in the 64-bit length is an overflow, not a size.
    let (mut sender, receiver) = tokio::io::duplex(64);
    let mut header = vec![0x82u8, 127];
    header.extend_from_slice(&(1u64 << 63).to_be_bytes());
    sender.write_all(&header).await.unwrap();
    let mut reader = FrameReader::new(receiver, 0, 1 << 20);
    let err = reader.read_frame(false).await.unwrap_err();
    assert!(matches!(err, Error::PayloadLengthOverflow));
}

#[tokio::test]
async fn test_reader_clean_eof_vs_truncated_frame() {
    let (sender, receiver) = tokio::io::duplex(64);
    drop(sender);
    let mut reader = FrameReader::new(receiver, 0, 1 << 20);
    assert!(reader.read_frame(false).await.unwrap().is_none());

    let (mut sender, receiver) = tokio::io::duplex(64);
    sender.write_all(&[0x81]).await.unwrap();
    drop(sender);
    let mut reader = FrameReader::new(receiver, 0, 1 << 20);
    assert!(matches!(
        reader.read_frame(false).await.unwrap_err(),
        Error::ReceiveFailed(_)
    ));
}

// ---------------------------------------------------------------------
// Close codes and reasons
// ---------------------------------------------------------------------

#[test]
fn test_close_code_wire_validity_table() {
    let cases = [
        (999, false),
        (1000, true),
        (1004, false),
        (1005, false),
        (1006, false),
        (1015, false),
        (1016, false),
        (2999, false),
        (3000, true),
        (4999, true),
        (5000, false),
    ];
    for (code, valid) in cases {
        assert_eq!(is_valid_wire_code(code), valid, "code {code}");
    }
}

#[test]
fn test_close_reason_truncation_at_boundary() {
    let exact = "a".repeat(123);
    assert_eq!(truncate_reason(&exact), exact);

    let over = "a".repeat(124);
    assert_eq!(truncate_reason(&over).len(), 123);

    // 41 three-byte codepoints = 123 bytes; one more must not be split.
    let multibyte = "\u{20AC}".repeat(42); // 126 bytes of euro signs
    let truncated = truncate_reason(&multibyte);
    assert_eq!(truncated.len(), 123);
    assert!(truncated.chars().all(|c| c == '\u{20AC}'));

    // Idempotent.
    assert_eq!(truncate_reason(truncated), truncated);
}

// ---------------------------------------------------------------------
// Reconnect policy math
// ---------------------------------------------------------------------

#[test]
fn test_backoff_monotone_until_cap() {
    let policy = ReconnectPolicy {
        max_retries: -1,
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        multiplier: 2.0,
        jitter: 0.1,
        ..Default::default()
    };
    let mut previous = Duration::ZERO;
    for attempt in 1..=10 {
        let delay = policy.base_delay(attempt);
        assert!(delay >= previous);
        assert!(delay <= policy.max_delay);
        previous = delay;
    }
    assert_eq!(policy.base_delay(1), Duration::from_millis(100));
    assert_eq!(policy.base_delay(2), Duration::from_millis(200));
    assert_eq!(policy.base_delay(10), Duration::from_secs(1));

    // Jitter stays inside the clamp.
    let jittered_high = policy.apply_jitter(Duration::from_secs(1), 0.1);
    assert!(jittered_high <= policy.max_delay);
    let jittered_low = policy.apply_jitter(Duration::from_millis(100), -0.1);
    assert_eq!(jittered_low, Duration::from_millis(90));
}

#[test]
fn test_default_reconnect_code_gate() {
    let policy = ReconnectPolicy::default();
    assert!(policy.should_reconnect(None));
    assert!(policy.should_reconnect(Some(1001)));
    assert!(policy.should_reconnect(Some(1006)));
    assert!(policy.should_reconnect(Some(1011)));
    assert!(!policy.should_reconnect(Some(1000)));
    assert!(!policy.should_reconnect(Some(1002)));
}
