//! Resilient client-side WebSockets engine for the Tokio stack.
//!
//! This library implements the client half of the
//! [WebSocket Protocol RFC](https://datatracker.ietf.org/doc/html/rfc6455)
//! plus [permessage-deflate compression](https://datatracker.ietf.org/doc/html/rfc7692):
//! it performs the HTTP upgrade handshake, negotiates subprotocols and
//! extensions, then exchanges masked frames over a TCP or TLS stream, with
//! keepalive pings, idle detection, a graceful close handshake and bounded
//! memory under hostile input.
//!
//! Two entry points exist. [`WSConnection`] is one connection: connect,
//! send, receive, close. [`WSClient`] layers reconnection with exponential
//! backoff on top and reports everything (messages, errors, reconnects,
//! metrics, link quality) through an [`EventStream`].

pub mod assembler;
pub mod client;
pub mod close;
pub mod config;
pub mod connection;
pub mod deflate;
pub mod error;
pub mod event;
pub mod extensions;
pub mod frame;
pub mod handshake;
pub mod message;
pub mod metrics;
pub mod queue;
mod read;
pub mod request;
pub mod stream;
pub mod transport;
mod utils;
mod write;

#[cfg(test)]
mod tests;

pub use client::WSClient;
pub use close::CloseStatus;
pub use config::{DeflateOptions, ReconnectPolicy, WebSocketConfig};
pub use connection::{ConnectionState, MessageStream, WSConnection};
pub use deflate::PerMessageDeflate;
pub use error::Error;
pub use event::{Event, EventStream};
pub use message::Message;
pub use metrics::{ConnectionQuality, HealthSnapshot, MetricsSnapshot};
pub use transport::{TcpTransport, Transport};
