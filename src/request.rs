use crate::error::Error;
use url::Url;

const WEBSOCKET_VERSION: &str = "13";

// Request headers owned by the handshake itself; a custom header colliding
// with one of these is rejected instead of silently duplicated.
const RESERVED_HEADERS: [&str; 7] = [
    "host",
    "upgrade",
    "connection",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-protocol",
    "sec-websocket-extensions",
];

/// Parses and validates a ws/wss URL, returning the URL plus the
/// `host:port` pair used to open the TCP connection.
pub fn parse_ws_url(ws_url: &str) -> Result<(Url, String, u16, bool), Error> {
    let parsed_url = Url::parse(ws_url)?;

    // Clause just to validate the user has passed the proper URL scheme,
    // and to pick the default port when the URL carries none.
    let (default_port, use_tls) = match parsed_url.scheme() {
        "ws" => (80, false),
        "wss" => (443, true),
        _ => return Err(Error::InvalidSchemeURL),
    };

    let host = parsed_url.host_str().ok_or(Error::URLNoHost)?.to_owned();
    let port = parsed_url.port().unwrap_or(default_port);

    Ok((parsed_url, host, port, use_tls))
}

/// Host header value: the host as serialized by the URL (IPv6 hosts keep
/// their brackets), with the port appended only when it differs from the
/// scheme default.
pub fn host_header_value(url: &Url) -> Result<String, Error> {
    let host = url.host_str().ok_or(Error::URLNoHost)?;
    let default_port = match url.scheme() {
        "ws" => 80,
        "wss" => 443,
        _ => return Err(Error::InvalidSchemeURL),
    };
    match url.port() {
        Some(port) if port != default_port => Ok(format!("{}:{}", host, port)),
        _ => Ok(host.to_owned()),
    }
}

fn request_path(url: &Url) -> String {
    let path = if url.path().is_empty() { "/" } else { url.path() };
    match url.query() {
        Some(query) => format!("{}?{}", path, query),
        None => path.to_string(),
    }
}

fn validate_custom_header(name: &str, value: &str) -> Result<(), Error> {
    if RESERVED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
        return Err(Error::ReservedHeader(name.to_owned()));
    }
    let clean = |s: &str| s.is_ascii() && !s.contains(['\r', '\n', '\0']);
    if name.is_empty() || !clean(name) || name.contains(':') || !clean(value) {
        return Err(Error::InvalidHeaderValue(name.to_owned()));
    }
    Ok(())
}

// Normalizes a token list to deduplicated entries, first occurrence wins,
// preserving the caller's order.
fn dedup_tokens(tokens: &[String]) -> Vec<&str> {
    let mut seen: Vec<&str> = Vec::new();
    for token in tokens {
        let token = token.trim();
        if !token.is_empty() && !seen.iter().any(|s| s.eq_ignore_ascii_case(token)) {
            seen.push(token);
        }
    }
    seen
}

/// Builds the HTTP/1.1 Upgrade request. Since we already have all the info,
/// it isn't worth converting everything to an HTTP request type; we simply
/// assemble the string and convert it to bytes when writing to the server.
pub fn construct_http_request(
    url: &Url,
    key: &str,
    sub_protocols: &[String],
    extension_offers: &[String],
    custom_headers: &[(String, String)],
) -> Result<String, Error> {
    let mut request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: {}\r\nSec-WebSocket-Version: {}\r\n",
        request_path(url),
        host_header_value(url)?,
        key,
        WEBSOCKET_VERSION,
    );

    let protocols = dedup_tokens(sub_protocols);
    if !protocols.is_empty() {
        request.push_str(&format!(
            "Sec-WebSocket-Protocol: {}\r\n",
            protocols.join(", ")
        ));
    }

    if !extension_offers.is_empty() {
        request.push_str(&format!(
            "Sec-WebSocket-Extensions: {}\r\n",
            extension_offers.join(", ")
        ));
    }

    for (name, value) in custom_headers {
        validate_custom_header(name, value)?;
        request.push_str(&format!("{}: {}\r\n", name, value.trim()));
    }

    request.push_str("\r\n");
    Ok(request)
}
