use crate::close::CloseStatus;
use httparse::Error as HttpParseError;
use pki_types::InvalidDnsNameError;
use std::io;
use std::string::FromUtf8Error;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::error::Elapsed;
use url::ParseError;

#[derive(Error, Debug)]
pub enum Error {
    // General Errors
    #[error("{source}")]
    Timeout {
        #[from]
        source: Elapsed,
    },

    #[error("IO Error happened: {source}")]
    IOError {
        #[from]
        source: io::Error,
    },

    #[error("{source}")]
    FromUtf8Error {
        #[from]
        source: FromUtf8Error,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("operation not valid in the current connection state: {0}")]
    InvalidState(&'static str),

    // Handshake Errors
    #[error("handshake rejected with status {status}: {body}")]
    HandshakeFailed { status: u16, body: String },

    #[error("server didn't upgrade the connection")]
    NoUpgrade,

    #[error("Connection: Upgrade header missing in the response")]
    NoConnectionHeaderPresent,

    #[error("server didn't send a valid Sec-WebSocket-Accept key")]
    InvalidAcceptKey,

    #[error("server selected an unoffered or malformed subprotocol: {0}")]
    InvalidSubProtocol(String),

    #[error("response head exceeded the maximum allowed size")]
    ResponseHeadTooLarge,

    #[error("incomplete HTTP response")]
    IncompleteHTTPResponse,

    #[error("extension negotiation failed: {0}")]
    ExtensionNegotiationFailed(String),

    // Framing / Protocol Errors
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),

    #[error("reserved opcode: {0:#x}")]
    ReservedOpcode(u8),

    #[error("invalid continuation frame: no fragmented message to continue")]
    UnexpectedContinuation,

    #[error("incoming data frame but a fragmented message is already in progress")]
    FragmentedInProgress,

    #[error("64-bit payload length with the high bit set")]
    PayloadLengthOverflow,

    #[error("frame payload of {size} bytes exceeds the maximum of {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("message of {size} bytes exceeds the maximum of {limit}")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("message fragment count exceeds the maximum of {limit}")]
    FragmentCountExceeded { limit: usize },

    #[error("text payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("close code {0} is not valid on the wire")]
    InvalidCloseCode(u16),

    #[error("close frame payload must be empty or at least 2 bytes")]
    InvalidClosePayload,

    #[error("received a masked frame from the server")]
    MaskedServerFrame,

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    // Compression / Decompression Errors
    #[error("compression failed: {0}")]
    CompressionFailed(String),

    #[error("decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("decompressed message exceeds the maximum message size of {limit}")]
    DecompressedMessageTooLarge { limit: usize },

    #[error("max_window_bits should be a value between 8 and 15")]
    InvalidMaxWindowBits,

    // Transport Errors
    #[error("send failed: {source}")]
    SendFailed { source: io::Error },

    #[error("receive failed: {0}")]
    ReceiveFailed(&'static str),

    #[error("connection closed: {0}")]
    ConnectionClosed(Arc<Error>),

    #[error("closed by peer: {0}")]
    PeerClosed(CloseStatus),

    #[error("connection aborted")]
    Aborted,

    // Proxy errors, surfaced by transports that tunnel through CONNECT.
    #[error("could not reach the proxy: {0}")]
    ProxyConnectionFailed(String),

    #[error("proxy refused the tunnel: {0}")]
    ProxyTunnelFailed(String),

    #[error("proxy requires authentication")]
    ProxyAuthenticationRequired,

    // Timing Errors
    #[error("no pong received within the pong timeout")]
    PongTimeout,

    #[error("no application messages received within the idle timeout")]
    IdleTimeout,

    // HTTP / URL Errors
    #[error("{source}")]
    URLParseError {
        #[from]
        source: ParseError,
    },

    #[error("invalid scheme in WebSocket URL")]
    InvalidSchemeURL,

    #[error("URL has no host")]
    URLNoHost,

    #[error("{source}")]
    HttpParseError {
        #[from]
        source: HttpParseError,
    },

    #[error("header `{0}` is reserved and cannot be overridden")]
    ReservedHeader(String),

    #[error("header `{0}` contains non-ASCII or control characters")]
    InvalidHeaderValue(String),

    // Domain addr parsing error
    #[error("{source}")]
    DomainError {
        #[from]
        source: InvalidDnsNameError,
    },
}

impl Error {
    /// Close code to put on the wire when this error tears the connection
    /// down. `None` means the connection is dropped without a close frame.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Error::InvalidFrame(_)
            | Error::ReservedOpcode(_)
            | Error::UnexpectedContinuation
            | Error::FragmentedInProgress
            | Error::PayloadLengthOverflow
            | Error::MaskedServerFrame
            | Error::InvalidCloseCode(_)
            | Error::InvalidClosePayload
            | Error::ProtocolViolation(_)
            | Error::CompressionFailed(_)
            | Error::DecompressionFailed(_) => Some(1002),
            Error::InvalidUtf8 | Error::FromUtf8Error { .. } => Some(1007),
            Error::FrameTooLarge { .. }
            | Error::MessageTooLarge { .. }
            | Error::FragmentCountExceeded { .. }
            | Error::DecompressedMessageTooLarge { .. } => Some(1009),
            Error::ExtensionNegotiationFailed(_) => Some(1010),
            _ => None,
        }
    }

    /// Whether the resilient client may try a fresh connection after
    /// observing this error. Handshake, protocol and compression failures
    /// would fail again identically, so they are terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::IOError { .. }
            | Error::SendFailed { .. }
            | Error::ReceiveFailed(_)
            | Error::ProxyConnectionFailed(_)
            | Error::ProxyTunnelFailed(_)
            | Error::PongTimeout
            | Error::IdleTimeout
            | Error::Timeout { .. } => true,
            Error::PeerClosed(status) => status.code() != 1000,
            Error::ConnectionClosed(cause) => cause.is_retryable(),
            _ => false,
        }
    }
}
