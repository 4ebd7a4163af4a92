use crate::config::WebSocketConfig;
use crate::connection::{ConnectionState, WSConnection};
use crate::error::Error;
use crate::event::{Event, EventStream};
use crate::metrics::{HealthSnapshot, MetricsSnapshot};
use crate::transport::{TcpTransport, Transport};
use futures::StreamExt;
use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, Sender};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;

const EVENT_CHANNEL_CAPACITY: usize = 256;

struct ClientInner {
    url: String,
    config: WebSocketConfig,
    transport: Arc<dyn Transport>,
    conn: Mutex<Option<Arc<WSConnection>>>,
    events_tx: Sender<Event>,
    // Manual close/abort preempts the reconnect loop, including a backoff
    // sleep in progress.
    manual_close_tx: watch::Sender<bool>,
    closed_tx: watch::Sender<bool>,
}

/// A client that keeps a logical connection alive across failures: it owns
/// the URL and options from the first connect, and on an unexpected
/// disconnect replays them through the reconnect policy with exponential
/// backoff and jitter. All observable behavior is delivered through the
/// `EventStream` returned at connect.
pub struct WSClient {
    inner: Arc<ClientInner>,
    supervisor: JoinHandle<()>,
}

impl WSClient {
    /// Connects over the default TCP/TLS transport.
    pub async fn connect(
        url: &str,
        config: WebSocketConfig,
    ) -> Result<(WSClient, EventStream), Error> {
        Self::connect_with_transport(url, Arc::new(TcpTransport::new()), config).await
    }

    /// Connects over a caller-provided transport. The first connect is not
    /// retried; its errors surface directly to the caller.
    pub async fn connect_with_transport(
        url: &str,
        transport: Arc<dyn Transport>,
        config: WebSocketConfig,
    ) -> Result<(WSClient, EventStream), Error> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let _ = events_tx.send(Event::Connecting).await;
        let conn = Arc::new(
            WSConnection::connect_with_events(
                url,
                transport.as_ref(),
                config.clone(),
                Some(events_tx.clone()),
            )
            .await?,
        );
        let _ = events_tx.send(Event::Connected(conn.id())).await;

        let inner = Arc::new(ClientInner {
            url: url.to_owned(),
            config,
            transport,
            conn: Mutex::new(Some(conn.clone())),
            events_tx,
            manual_close_tx: watch::channel(false).0,
            closed_tx: watch::channel(false).0,
        });
        let supervisor = tokio::spawn(supervise(inner.clone(), conn));

        Ok((
            WSClient {
                inner,
                supervisor,
            },
            EventStream::new(events_rx),
        ))
    }

    async fn current(&self) -> Result<Arc<WSConnection>, Error> {
        self.inner
            .conn
            .lock()
            .await
            .clone()
            .ok_or(Error::InvalidState("not connected"))
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), Error> {
        self.current().await?.send_text(text).await
    }

    pub async fn send(&self, data: Vec<u8>) -> Result<(), Error> {
        self.current().await?.send(data).await
    }

    pub async fn send_binary(&self, data: Vec<u8>) -> Result<(), Error> {
        self.current().await?.send_binary(data).await
    }

    pub async fn state(&self) -> ConnectionState {
        match self.inner.conn.lock().await.as_ref() {
            Some(conn) => conn.state(),
            None => ConnectionState::Closed,
        }
    }

    pub async fn metrics(&self) -> Option<MetricsSnapshot> {
        self.inner
            .conn
            .lock()
            .await
            .as_ref()
            .map(|conn| conn.metrics())
    }

    pub async fn health(&self) -> Option<HealthSnapshot> {
        self.inner
            .conn
            .lock()
            .await
            .as_ref()
            .map(|conn| conn.health())
    }

    /// Graceful close. Marks the close as manual so the supervisor never
    /// tries to resurrect the connection.
    pub async fn close(&self, code: u16, reason: &str) -> Result<(), Error> {
        let _ = self.inner.manual_close_tx.send(true);
        if let Some(conn) = self.inner.conn.lock().await.clone() {
            conn.close(code, reason).await?;
        }
        Ok(())
    }

    /// Abrupt teardown, also manual.
    pub async fn abort(&self) {
        let _ = self.inner.manual_close_tx.send(true);
        if let Some(conn) = self.inner.conn.lock().await.clone() {
            conn.abort();
        }
    }

    /// Resolves once the client has given up for good and emitted `Closed`.
    pub async fn wait_closed(&self) {
        let mut closed = self.inner.closed_tx.subscribe();
        let _ = closed.wait_for(|done| *done).await;
    }
}

impl Drop for WSClient {
    fn drop(&mut self) {
        let _ = self.inner.manual_close_tx.send(true);
        self.supervisor.abort();
    }
}

/// The supervisor: pumps messages from the live connection into the event
/// stream, and when the connection dies decides between giving up and
/// dialing again.
async fn supervise(inner: Arc<ClientInner>, mut conn: Arc<WSConnection>) {
    let policy = inner.config.reconnect.clone();
    let mut rng = StdRng::from_rng(&mut rand::rng());

    'connection: loop {
        pump_messages(&inner, &conn).await;
        conn.wait_closed().await;

        let status = conn.close_status();
        let terminal = conn.terminal_error();
        *inner.conn.lock().await = None;

        if *inner.manual_close_tx.borrow() {
            emit_closed(&inner, status).await;
            break;
        }

        let cause = terminal.unwrap_or_else(|| Arc::new(Error::Aborted));
        let _ = inner.events_tx.send(Event::Error(cause.clone())).await;

        let close_code = status.as_ref().map(|s| s.code());
        if !cause.is_retryable() || !policy.should_reconnect(close_code) {
            debug!(
                "not reconnecting: cause {} close code {:?}",
                cause, close_code
            );
            emit_closed(&inner, status).await;
            break;
        }

        // Backoff loop: delay, dial, repeat until success or retries are
        // spent.
        let mut attempt: u32 = 1;
        loop {
            if policy.max_retries >= 0 && attempt > policy.max_retries as u32 {
                warn!("giving up after {} reconnect attempts", attempt - 1);
                emit_closed(&inner, status).await;
                break 'connection;
            }

            let base = policy.base_delay(attempt);
            let factor = if policy.jitter > 0.0 {
                rng.random_range(-policy.jitter..=policy.jitter)
            } else {
                0.0
            };
            let delay = policy.apply_jitter(base, factor);
            let _ = inner
                .events_tx
                .send(Event::Reconnecting { attempt, delay })
                .await;
            debug!("reconnect attempt {} in {:?}", attempt, delay);

            if sleep_unless_closed(&inner, delay).await {
                emit_closed(&inner, status).await;
                break 'connection;
            }

            match WSConnection::connect_with_events(
                &inner.url,
                inner.transport.as_ref(),
                inner.config.clone(),
                Some(inner.events_tx.clone()),
            )
            .await
            {
                Ok(new_conn) => {
                    let new_conn = Arc::new(new_conn);
                    *inner.conn.lock().await = Some(new_conn.clone());
                    let _ = inner
                        .events_tx
                        .send(Event::Reconnected(new_conn.id()))
                        .await;
                    conn = new_conn;
                    continue 'connection;
                }
                Err(e) => {
                    warn!("reconnect attempt {} failed: {}", attempt, e);
                    let _ = inner.events_tx.send(Event::Error(Arc::new(e))).await;
                    attempt += 1;
                }
            }
        }
    }

    let _ = inner.closed_tx.send(true);
}

async fn pump_messages(inner: &Arc<ClientInner>, conn: &Arc<WSConnection>) {
    let mut stream = match conn.receive_all() {
        Ok(stream) => stream,
        Err(_) => return,
    };
    while let Some(item) = stream.next().await {
        match item {
            Ok(message) => {
                if inner
                    .events_tx
                    .send(Event::Message(conn.id(), message))
                    .await
                    .is_err()
                {
                    // Event consumer is gone; stop pumping.
                    return;
                }
            }
            // Terminal; the supervisor reads the cause off the connection.
            Err(_) => return,
        }
    }
}

// Waits out a backoff delay, cutting it short when the user closes the
// client. Returns whether the close preempted the wait.
async fn sleep_unless_closed(inner: &Arc<ClientInner>, delay: Duration) -> bool {
    let mut manual = inner.manual_close_tx.subscribe();
    tokio::select! {
        _ = sleep(delay) => *inner.manual_close_tx.borrow(),
        _ = manual.wait_for(|closed| *closed) => true,
    }
}

async fn emit_closed(inner: &Arc<ClientInner>, status: Option<crate::close::CloseStatus>) {
    let (code, reason) = match status {
        Some(status) => (Some(status.code()), status.reason().to_owned()),
        None => (None, String::new()),
    };
    let _ = inner.events_tx.send(Event::Closed { code, reason }).await;
}
