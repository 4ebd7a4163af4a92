use crate::config::WebSocketConfig;
use crate::error::Error;
use crate::extensions::{build_offers, parse_extensions_header, ExtensionEntry};
use crate::request::construct_http_request;
use crate::utils::{constant_time_eq, generate_websocket_accept_value, generate_websocket_key};
use bytes::BytesMut;
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};
use url::Url;

const HTTP_RESPONSE_DELIMITER: &[u8] = b"\r\n\r\n";

// Limit the amount of head we accept to prevent a hostile server from
// feeding us an endless header section.
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

// On a rejected upgrade, up to this much of the response body is captured
// for the error the caller sees.
const MAX_ERROR_BODY: usize = 4 * 1024;

/// What a successful upgrade produced: the selected subprotocol, the
/// server's extension entries in header order, and any bytes that arrived
/// past the header terminator. Those bytes belong to the frame stream and
/// must be replayed before reading the socket again.
pub struct HandshakeOutcome {
    pub protocol: Option<String>,
    pub extension_entries: Vec<ExtensionEntry>,
    pub prefetched: BytesMut,
}

/// Performs the client side of the HTTP/1.1 Upgrade: writes the request,
/// reads a bounded response head and validates the 101 per RFC 6455.
pub async fn perform_client_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    url: &Url,
    config: &WebSocketConfig,
) -> Result<HandshakeOutcome, Error> {
    let key = generate_websocket_key();
    let offers = build_offers(&config.extensions);
    let request = construct_http_request(
        url,
        &key,
        &config.sub_protocols,
        &offers,
        &config.custom_headers,
    )?;

    debug!("sending upgrade request to {}", url);
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let (head, prefetched) = read_response_head(stream).await?;
    validate_response(stream, &head, prefetched, &key, config).await
}

// Reads until CRLF CRLF, returning the head (terminator included) and any
// surplus bytes already pulled off the socket.
async fn read_response_head<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<(BytesMut, BytesMut), Error> {
    let mut buffer = BytesMut::with_capacity(1024);
    loop {
        if let Some(end) = find_delimiter(&buffer) {
            let mut head = buffer;
            let rest = head.split_off(end + HTTP_RESPONSE_DELIMITER.len());
            return Ok((head, rest));
        }
        if buffer.len() >= MAX_RESPONSE_HEAD {
            return Err(Error::ResponseHeadTooLarge);
        }

        let mut tmp_buf = [0u8; 1024];
        let n = stream.read(&mut tmp_buf).await?;
        if n == 0 {
            return Err(Error::IncompleteHTTPResponse);
        }
        buffer.extend_from_slice(&tmp_buf[..n]);
    }
}

fn find_delimiter(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(HTTP_RESPONSE_DELIMITER.len())
        .position(|window| window == HTTP_RESPONSE_DELIMITER)
}

async fn validate_response<S: AsyncRead + Unpin>(
    stream: &mut S,
    head: &[u8],
    prefetched: BytesMut,
    key: &str,
    config: &WebSocketConfig,
) -> Result<HandshakeOutcome, Error> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut headers);
    if response.parse(head)?.is_partial() {
        return Err(Error::IncompleteHTTPResponse);
    }

    let status = response.code.ok_or(Error::IncompleteHTTPResponse)?;
    if status != 101 {
        let body = capture_error_body(stream, prefetched).await;
        return Err(Error::HandshakeFailed { status, body });
    }

    let mut upgrade_ok = false;
    let mut connection_ok = false;
    let mut accept_ok = false;
    let mut protocol: Option<String> = None;
    let mut extension_entries: Vec<ExtensionEntry> = Vec::new();
    let expected_accept = generate_websocket_accept_value(key);

    for header in response.headers.iter() {
        let value = String::from_utf8_lossy(header.value);
        if header.name.eq_ignore_ascii_case("upgrade") {
            upgrade_ok = contains_token(&value, "websocket");
        } else if header.name.eq_ignore_ascii_case("connection") {
            connection_ok = contains_token(&value, "upgrade");
        } else if header.name.eq_ignore_ascii_case("sec-websocket-accept") {
            accept_ok = constant_time_eq(value.trim().as_bytes(), expected_accept.as_bytes());
        } else if header.name.eq_ignore_ascii_case("sec-websocket-protocol") {
            let token = value.trim().to_owned();
            if protocol.is_some() {
                return Err(Error::InvalidSubProtocol(token));
            }
            protocol = Some(token);
        } else if header.name.eq_ignore_ascii_case("sec-websocket-extensions") {
            extension_entries.extend(parse_extensions_header(&value));
        }
    }

    if !upgrade_ok {
        return Err(Error::NoUpgrade);
    }
    if !connection_ok {
        return Err(Error::NoConnectionHeaderPresent);
    }
    if !accept_ok {
        return Err(Error::InvalidAcceptKey);
    }

    // The server may select exactly one of the protocols we offered; a
    // token we never sent (or a list) is a failed handshake.
    if let Some(token) = &protocol {
        let valid = !token.contains(',')
            && config
                .sub_protocols
                .iter()
                .any(|offered| offered.trim() == token);
        if !valid {
            return Err(Error::InvalidSubProtocol(token.clone()));
        }
    }

    debug!(
        "handshake complete, protocol {:?}, {} extension entries, {} prefetched bytes",
        protocol,
        extension_entries.len(),
        prefetched.len()
    );
    Ok(HandshakeOutcome {
        protocol,
        extension_entries,
        prefetched,
    })
}

// Collects whatever body bytes we can for the diagnostic without stalling:
// what was already read plus short opportunistic reads up to the cap.
async fn capture_error_body<S: AsyncRead + Unpin>(stream: &mut S, prefetched: BytesMut) -> String {
    let mut body = prefetched;
    let mut tmp_buf = [0u8; 1024];
    while body.len() < MAX_ERROR_BODY {
        match timeout(Duration::from_millis(250), stream.read(&mut tmp_buf)).await {
            Ok(Ok(n)) if n > 0 => body.extend_from_slice(&tmp_buf[..n]),
            _ => break,
        }
    }
    body.truncate(MAX_ERROR_BODY);
    String::from_utf8_lossy(&body).into_owned()
}

fn contains_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|entry| entry.trim().eq_ignore_ascii_case(token))
}
