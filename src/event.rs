use crate::error::Error;
use crate::message::Message;
use crate::metrics::{ConnectionQuality, MetricsSnapshot};
use futures::Stream;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc::Receiver;
use uuid::Uuid;

pub type ID = Uuid;

// Connection ids are random v8 UUIDs; they only exist to correlate events
// and log lines across reconnects.
pub fn generate_connection_id() -> Uuid {
    let mut rng = StdRng::from_rng(&mut rand::rng());
    let buf = rng.random::<[u8; 16]>();

    Uuid::new_v8(buf)
}

/// Everything observable about a client connection, delivered in order
/// through the `EventStream`.
#[derive(Debug)]
pub enum Event {
    /// A connection attempt started.
    Connecting,
    /// The handshake completed and the connection is open.
    Connected(ID),
    /// An unexpected disconnect is being retried after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// A retry succeeded; traffic flows again.
    Reconnected(ID),
    /// An application message arrived.
    Message(ID, Message),
    /// A terminal error was observed; a `Reconnecting` or `Closed` event
    /// follows.
    Error(Arc<Error>),
    MetricsUpdated(ID, MetricsSnapshot),
    QualityChanged(ID, ConnectionQuality),
    /// The connection reached its terminal state. Raised exactly once per
    /// client lifetime.
    Closed {
        code: Option<u16>,
        reason: String,
    },
}

// This struct implements the Stream trait, so the end-user doesn't need to
// interact with the mpsc tokio channel directly
pub struct EventStream {
    receiver: Receiver<Event>,
}

impl EventStream {
    pub fn new(receiver: Receiver<Event>) -> Self {
        Self { receiver }
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.receiver).poll_recv(cx)
    }
}
