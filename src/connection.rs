use crate::assembler::{Assembly, MessageAssembler};
use crate::close::CloseStatus;
use crate::config::WebSocketConfig;
use crate::error::Error;
use crate::event::{generate_connection_id, Event, ID};
use crate::extensions::{negotiate, ActiveExtensions};
use crate::frame::OpCode;
use crate::handshake::perform_client_handshake;
use crate::message::Message;
use crate::metrics::{HealthMonitor, HealthSnapshot, MetricsCollector, MetricsGate, MetricsSnapshot};
use crate::queue::BoundedQueue;
use crate::read::FrameReader;
use crate::request::parse_ws_url;
use crate::stream::PrefetchStream;
use crate::transport::{BoxedStream, Transport};
use crate::write::FrameWriter;
use bytes::BytesMut;
use futures::future::BoxFuture;
use futures::{FutureExt, Stream};
use log::{debug, warn};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc::Sender;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use url::Url;

type ConnStream = PrefetchStream<BoxedStream>;
type ConnWriter = FrameWriter<WriteHalf<ConnStream>>;
type ConnReader = FrameReader<ReadHalf<ConnStream>>;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    None = 0,
    Connecting = 1,
    Open = 2,
    Closing = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> ConnectionState {
        match value {
            0 => ConnectionState::None,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Open,
            3 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

// Forward moves only, plus the collapse of any state to Closed on abort.
fn transition_allowed(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;
    matches!(
        (from, to),
        (None, Connecting) | (Connecting, Open) | (Open, Closing)
    ) || (to == Closed && from != Closed)
}

/// The connection state word. All mutation goes through a compare-and-swap
/// against the allowed-transition table, so concurrent movers can never
/// skip a state or resurrect a closed connection.
struct AtomicState(AtomicU8);

impl AtomicState {
    fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        transition_allowed(from, to)
            && self
                .0
                .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    fn force_closed(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.swap(ConnectionState::Closed as u8, Ordering::SeqCst))
    }
}

#[derive(Default)]
struct PingState {
    outstanding_ping: Option<Instant>,
    last_pong_at: Option<Instant>,
}

pub(crate) struct ConnectionInner {
    id: ID,
    config: WebSocketConfig,
    state: AtomicState,
    writer: Mutex<Option<ConnWriter>>,
    extensions: StdMutex<ActiveExtensions>,
    queue: BoundedQueue<Message>,
    close_sent: AtomicBool,
    finalized: AtomicBool,
    receiving: AtomicBool,
    close_status: StdMutex<Option<CloseStatus>>,
    terminal: StdMutex<Option<Arc<Error>>>,
    selected_protocol: Option<String>,
    // Watches instead of back-pointers: the receive loop, the keepalive
    // loop and public waiters all observe these without referencing each
    // other.
    closed_tx: watch::Sender<bool>,
    remote_close_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<bool>,
    // Monotonic activity clocks, in milliseconds since `epoch`.
    epoch: Instant,
    last_activity_ms: AtomicU64,
    last_message_ms: AtomicU64,
    ping_state: StdMutex<PingState>,
    pong_notify: Notify,
    metrics: MetricsCollector,
    health: StdMutex<HealthMonitor>,
    last_throughput: StdMutex<f64>,
    events: Option<Sender<Event>>,
}

/// A live client connection: owns the stream, the receive loop and the
/// keepalive loop. Cheap to share by reference; all operations take
/// `&self`. Dropping the value aborts the connection.
pub struct WSConnection {
    inner: Arc<ConnectionInner>,
    recv_handle: JoinHandle<()>,
    keepalive_handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for WSConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WSConnection")
            .field("id", &self.inner.id)
            .finish()
    }
}

impl WSConnection {
    /// Opens a connection: transport connect, HTTP upgrade and extension
    /// negotiation, all bounded by `handshake_timeout`. On success the
    /// receive and keepalive loops are running and the state is Open.
    pub async fn connect(
        url: &str,
        transport: &dyn Transport,
        config: WebSocketConfig,
    ) -> Result<WSConnection, Error> {
        Self::connect_with_events(url, transport, config, None).await
    }

    pub(crate) async fn connect_with_events(
        url: &str,
        transport: &dyn Transport,
        config: WebSocketConfig,
        events: Option<Sender<Event>>,
    ) -> Result<WSConnection, Error> {
        config.validate()?;
        let (parsed_url, _, _, _) = parse_ws_url(url)?;

        let state = AtomicState::new(ConnectionState::None);
        state.transition(ConnectionState::None, ConnectionState::Connecting);

        let (stream, outcome) = timeout(
            config.handshake_timeout,
            open_and_upgrade(transport, &parsed_url, &config),
        )
        .await??;

        let active = negotiate(&config.extensions, &outcome.extension_entries)?;
        let stream = PrefetchStream::new(outcome.prefetched, stream);

        if config.require_negotiated_extensions && active.is_empty() {
            refuse_for_missing_extensions(stream, &config).await;
            return Err(Error::ExtensionNegotiationFailed(
                "negotiation yielded no active extension".into(),
            ));
        }

        let (read_half, write_half) = tokio::io::split(stream);
        let writer = FrameWriter::new(write_half, config.fragmentation_threshold);
        let reader = FrameReader::new(read_half, active.rsv_union(), config.max_frame_size);

        let id = generate_connection_id();
        let epoch = Instant::now();
        let inner = Arc::new(ConnectionInner {
            id,
            state,
            writer: Mutex::new(Some(writer)),
            extensions: StdMutex::new(active),
            queue: BoundedQueue::new(config.receive_queue_capacity),
            close_sent: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            receiving: AtomicBool::new(false),
            close_status: StdMutex::new(None),
            terminal: StdMutex::new(None),
            selected_protocol: outcome.protocol,
            closed_tx: watch::channel(false).0,
            remote_close_tx: watch::channel(false).0,
            shutdown_tx: watch::channel(false).0,
            epoch,
            last_activity_ms: AtomicU64::new(0),
            last_message_ms: AtomicU64::new(0),
            ping_state: StdMutex::new(PingState::default()),
            pong_notify: Notify::new(),
            metrics: MetricsCollector::new(epoch),
            health: StdMutex::new(HealthMonitor::new()),
            last_throughput: StdMutex::new(0.0),
            events,
            config,
        });

        if !inner
            .state
            .transition(ConnectionState::Connecting, ConnectionState::Open)
        {
            return Err(Error::InvalidState("connection was aborted during connect"));
        }
        debug!("connection {} open, protocol {:?}", id, inner.selected_protocol);

        let recv_handle = tokio::spawn(receive_loop(
            inner.clone(),
            reader,
            inner.shutdown_tx.subscribe(),
        ));
        let keepalive_handle = if !inner.config.ping_interval.is_zero()
            || !inner.config.idle_timeout.is_zero()
        {
            Some(tokio::spawn(keepalive_loop(
                inner.clone(),
                inner.shutdown_tx.subscribe(),
            )))
        } else {
            None
        };

        Ok(WSConnection {
            inner,
            recv_handle,
            keepalive_handle,
        })
    }

    pub fn id(&self) -> ID {
        self.inner.id
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.load()
    }

    /// The subprotocol the server selected, if any.
    pub fn protocol(&self) -> Option<&str> {
        self.inner.selected_protocol.as_deref()
    }

    /// Sends a text message. UTF-8 validity is carried by the type.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), Error> {
        self.inner.send_message(Message::Text(text.into())).await
    }

    /// Sends raw bytes as a text message, validating them as UTF-8 first.
    pub async fn send(&self, data: Vec<u8>) -> Result<(), Error> {
        let text = String::from_utf8(data).map_err(|_| Error::InvalidUtf8)?;
        self.inner.send_message(Message::Text(text)).await
    }

    pub async fn send_binary(&self, data: Vec<u8>) -> Result<(), Error> {
        self.inner.send_message(Message::Binary(data)).await
    }

    /// Receives the next message. Blocks under backpressure; fails with
    /// `ConnectionClosed` carrying the terminal cause once the connection
    /// finalizes and the queue has drained.
    pub async fn receive(&self) -> Result<Message, Error> {
        let _guard = ReceiveGuard::acquire(&self.inner)?;
        self.inner.check_receive_state()?;
        self.inner
            .queue
            .dequeue()
            .await
            .map_err(Error::ConnectionClosed)
    }

    /// Stream of incoming messages. Mutually exclusive with `receive`; the
    /// stream holds the receive slot until dropped.
    pub fn receive_all(&self) -> Result<MessageStream, Error> {
        let guard = ReceiveGuard::acquire(&self.inner)?;
        self.inner.check_receive_state()?;
        Ok(MessageStream {
            inner: self.inner.clone(),
            fut: None,
            done: false,
            _guard: guard,
        })
    }

    /// Graceful close: sends one close frame (idempotent), then waits for
    /// the close handshake to finish, bounded by `close_handshake_timeout`;
    /// the connection is aborted on expiry.
    pub async fn close(&self, code: u16, reason: &str) -> Result<(), Error> {
        let status = CloseStatus::new(code, reason)?;
        match self.inner.state.load() {
            ConnectionState::Closed => return Ok(()),
            ConnectionState::None | ConnectionState::Connecting => {
                return Err(Error::InvalidState("connection is not open"))
            }
            ConnectionState::Open | ConnectionState::Closing => {}
        }

        self.inner
            .state
            .transition(ConnectionState::Open, ConnectionState::Closing);
        let _ = self.inner.send_close_frame(&status).await;

        let mut closed = self.inner.closed_tx.subscribe();
        let finished = timeout(
            self.inner.config.close_handshake_timeout,
            closed.wait_for(|done| *done),
        )
        .await;
        if finished.is_err() {
            warn!(
                "connection {}: close handshake timed out, aborting",
                self.inner.id
            );
            self.abort();
        }
        Ok(())
    }

    /// Tears the connection down immediately, without a close handshake.
    pub fn abort(&self) {
        self.inner.queue.drain(drop);
        self.inner.finalize(
            Arc::new(Error::Aborted),
            Some(CloseStatus::local(1006, "aborted")),
        );
    }

    /// Resolves once the connection reaches its terminal state.
    pub async fn wait_closed(&self) {
        let mut closed = self.inner.closed_tx.subscribe();
        let _ = closed.wait_for(|done| *done).await;
    }

    /// The final close status, set exactly once at finalization.
    pub fn close_status(&self) -> Option<CloseStatus> {
        self.inner.close_status.lock().unwrap().clone()
    }

    /// The first terminal cause, set exactly once at finalization.
    pub fn terminal_error(&self) -> Option<Arc<Error>> {
        self.inner.terminal.lock().unwrap().clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner
            .metrics
            .snapshot(Instant::now(), self.inner.last_activity())
    }

    pub fn health(&self) -> HealthSnapshot {
        let throughput = *self.inner.last_throughput.lock().unwrap();
        let mut snapshot = self
            .inner
            .health
            .lock()
            .unwrap()
            .snapshot(0, Duration::ZERO);
        snapshot.throughput_bytes_per_sec = throughput;
        snapshot
    }
}

impl Drop for WSConnection {
    fn drop(&mut self) {
        if !self.inner.finalized.load(Ordering::SeqCst) {
            self.abort();
        }
        self.recv_handle.abort();
        if let Some(handle) = &self.keepalive_handle {
            handle.abort();
        }
    }
}

async fn open_and_upgrade(
    transport: &dyn Transport,
    url: &Url,
    config: &WebSocketConfig,
) -> Result<(BoxedStream, crate::handshake::HandshakeOutcome), Error> {
    let mut stream = transport.connect(url).await?;
    let outcome = perform_client_handshake(&mut stream, url, config).await?;
    Ok((stream, outcome))
}

// Required extensions missing: tell the server why we're leaving (1010)
// before the connect call fails.
async fn refuse_for_missing_extensions(stream: ConnStream, config: &WebSocketConfig) {
    let (_read_half, write_half) = tokio::io::split(stream);
    let mut writer = FrameWriter::new(write_half, config.fragmentation_threshold);
    let status = CloseStatus::local(1010, "extension negotiation failed");
    let _ = writer
        .write_frame(true, OpCode::Close, 0, &status.to_payload())
        .await;
    writer.shutdown().await;
}

impl ConnectionInner {
    fn now_ms(&self) -> u64 {
        Instant::now().duration_since(self.epoch).as_millis() as u64
    }

    fn touch_activity(&self) {
        self.last_activity_ms.store(self.now_ms(), Ordering::SeqCst);
    }

    fn touch_message(&self) {
        self.last_message_ms.store(self.now_ms(), Ordering::SeqCst);
    }

    fn last_activity(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_activity_ms.load(Ordering::SeqCst))
    }

    fn last_message(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_message_ms.load(Ordering::SeqCst))
    }

    fn check_receive_state(&self) -> Result<(), Error> {
        match self.state.load() {
            ConnectionState::None | ConnectionState::Connecting => {
                Err(Error::InvalidState("connection is not open"))
            }
            // Closed is fine: the queue drains leftovers, then surfaces
            // the terminal error.
            _ => Ok(()),
        }
    }

    /// All outbound frames funnel through here: one lock, one state
    /// re-check under it, at most one write in flight.
    async fn send_frame_raw(
        &self,
        final_fragment: bool,
        opcode: OpCode,
        rsv: u8,
        payload: &[u8],
        allow_closing: bool,
    ) -> Result<(), Error> {
        let mut guard = self.writer.lock().await;
        self.check_send_state(allow_closing)?;
        let writer = guard
            .as_mut()
            .ok_or(Error::InvalidState("connection is closed"))?;
        let result = writer.write_frame(final_fragment, opcode, rsv, payload).await;
        match result {
            Ok(wire) => {
                drop(guard);
                self.metrics.record_frame_sent(wire, 1);
                self.touch_activity();
                Ok(())
            }
            Err(e) => {
                drop(guard);
                Err(self.fail_send(e))
            }
        }
    }

    async fn send_message(&self, message: Message) -> Result<(), Error> {
        if message.len() > self.config.max_message_size {
            return Err(Error::MessageTooLarge {
                size: message.len(),
                limit: self.config.max_message_size,
            });
        }
        let opcode = message.opcode();
        let payload = BytesMut::from(&message.into_payload()[..]);

        let mut guard = self.writer.lock().await;
        self.check_send_state(false)?;

        // The outbound extension pipeline runs under the send lock so the
        // RSV bits and payload of a message can never interleave with
        // another send.
        let uncompressed_len = payload.len() as u64;
        let encode_result = self.extensions.lock().unwrap().encode(opcode, payload);
        let (payload, rsv) = match encode_result {
            Ok(output) => output,
            Err(e) => {
                drop(guard);
                return Err(self.fail_send(e));
            }
        };
        if rsv != 0 {
            self.metrics
                .record_compression_sent(uncompressed_len, payload.len() as u64);
        }

        let writer = guard
            .as_mut()
            .ok_or(Error::InvalidState("connection is closed"))?;
        match writer.write_message(opcode, rsv, &payload).await {
            Ok((frames, wire)) => {
                drop(guard);
                self.metrics.record_frame_sent(wire, frames as u64);
                self.metrics.record_message_sent();
                self.touch_activity();
                Ok(())
            }
            Err(e) => {
                drop(guard);
                Err(self.fail_send(e))
            }
        }
    }

    fn check_send_state(&self, allow_closing: bool) -> Result<(), Error> {
        match self.state.load() {
            ConnectionState::Open => Ok(()),
            ConnectionState::Closing if allow_closing => Ok(()),
            _ => Err(Error::InvalidState("connection is not open for sending")),
        }
    }

    // A failed write is terminal: finalize with it and hand the shared
    // cause back to the caller.
    fn fail_send(&self, e: Error) -> Error {
        let cause = Arc::new(e);
        self.finalize(cause.clone(), Some(CloseStatus::local(1006, "send failed")));
        Error::ConnectionClosed(cause)
    }

    /// Writes the close frame once; later calls are no-ops. Permitted in
    /// Closing so the reciprocal close of the handshake can go out.
    async fn send_close_frame(&self, status: &CloseStatus) -> Result<(), Error> {
        if self.close_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("connection {}: sending close frame {}", self.id, status);
        self.send_frame_raw(true, OpCode::Close, 0, &status.to_payload(), true)
            .await
    }

    /// The single finalizer: guarded by a CAS so exactly one caller runs
    /// it. Sets the terminal state and cause, completes the queue, stops
    /// the background loops and disposes the writer and extensions.
    fn finalize(&self, cause: Arc<Error>, status: Option<CloseStatus>) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut terminal = self.terminal.lock().unwrap();
            if terminal.is_none() {
                *terminal = Some(cause.clone());
            }
        }
        {
            let mut close_status = self.close_status.lock().unwrap();
            if close_status.is_none() {
                *close_status = status;
            }
        }

        let previous = self.state.force_closed();
        self.metrics.freeze(Instant::now());
        self.queue.complete(cause.clone());
        let _ = self.shutdown_tx.send(true);
        self.pong_notify.notify_one();

        debug!(
            "connection {}: finalized from state {:?}: {}",
            self.id, previous, cause
        );

        // Dispose the writer. Every send path drops the lock before
        // finalizing, so the try_lock only misses when a racing send is
        // mid-write; the stream then closes when the last owner drops.
        if let Ok(mut guard) = self.writer.try_lock() {
            if let Some(mut writer) = guard.take() {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move { writer.shutdown().await });
                }
            }
        }
        self.extensions.lock().unwrap().reset_all();

        let _ = self.closed_tx.send(true);
    }

    fn emit(&self, event: Event) {
        if let Some(events) = &self.events {
            let _ = events.try_send(event);
        }
    }
}

// RAII slot for the single consumer; `Receive` and `receive_all` both
// claim it, so concurrent consumption fails fast instead of racing.
struct ReceiveGuard {
    inner: Arc<ConnectionInner>,
}

impl ReceiveGuard {
    fn acquire(inner: &Arc<ConnectionInner>) -> Result<Self, Error> {
        if inner
            .receiving
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::InvalidState("a receive is already in progress"));
        }
        Ok(Self {
            inner: inner.clone(),
        })
    }
}

impl Drop for ReceiveGuard {
    fn drop(&mut self) {
        self.inner.receiving.store(false, Ordering::SeqCst);
    }
}

/// Ordered stream of incoming messages. Ends cleanly when the peer closes
/// or the connection is aborted; any other terminal cause is yielded as a
/// final error item.
pub struct MessageStream {
    inner: Arc<ConnectionInner>,
    fut: Option<BoxFuture<'static, Result<Message, Arc<Error>>>>,
    done: bool,
    _guard: ReceiveGuard,
}

impl Stream for MessageStream {
    type Item = Result<Message, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        let fut = this.fut.get_or_insert_with(|| {
            let inner = this.inner.clone();
            async move { inner.queue.dequeue().await }.boxed()
        });
        match fut.poll_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(message)) => {
                this.fut = None;
                Poll::Ready(Some(Ok(message)))
            }
            Poll::Ready(Err(cause)) => {
                this.fut = None;
                this.done = true;
                match cause.as_ref() {
                    Error::PeerClosed(_) | Error::Aborted => Poll::Ready(None),
                    _ => Poll::Ready(Some(Err(Error::ConnectionClosed(cause)))),
                }
            }
        }
    }
}

// What ended the receive loop; decides the epilogue.
enum LoopEnd {
    Shutdown,
    Eof,
    Fail(Error),
    PeerClose(BytesMut),
}

/// The one task that reads the stream. Control frames are handled inline
/// (pong echo, RTT sampling, close handshake); data frames flow through
/// the assembler, the inbound extension pipeline, UTF-8 validation and
/// into the bounded queue.
async fn receive_loop(
    inner: Arc<ConnectionInner>,
    mut reader: ConnReader,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut assembler = MessageAssembler::new(
        inner.config.max_message_size,
        inner.config.max_fragment_count,
    );
    let mut gate = MetricsGate::new(
        Instant::now(),
        inner.config.metrics_update_interval,
        inner.config.metrics_update_message_interval,
    );

    let end = loop {
        let before_wire = reader.bytes_read();
        let read = tokio::select! {
            biased;
            _ = shutdown.changed() => break LoopEnd::Shutdown,
            read = reader.read_frame(assembler.in_progress()) => read,
        };

        let frame = match read {
            Err(e) => break LoopEnd::Fail(e),
            Ok(None) => break LoopEnd::Eof,
            Ok(Some(frame)) => frame,
        };
        inner
            .metrics
            .record_frame_received(reader.bytes_read() - before_wire);
        inner.touch_activity();

        match assembler.push(frame) {
            Err(e) => break LoopEnd::Fail(e),
            Ok(Assembly::Partial) => {}
            Ok(Assembly::Control(frame)) => match frame.opcode {
                OpCode::Ping => {
                    // Echo the payload right away, under the send lock.
                    if inner
                        .send_frame_raw(true, OpCode::Pong, 0, &frame.payload, true)
                        .await
                        .is_err()
                    {
                        break LoopEnd::Shutdown;
                    }
                }
                OpCode::Pong => handle_pong(&inner, Instant::now()),
                OpCode::Close => break LoopEnd::PeerClose(frame.payload),
                _ => break LoopEnd::Fail(Error::InvalidFrame("data opcode routed as control")),
            },
            Ok(Assembly::Complete(assembled)) => {
                let compressed_len = if assembled.rsv != 0 {
                    Some(assembled.payload.len() as u64)
                } else {
                    None
                };
                let decode_result = inner.extensions.lock().unwrap().decode(
                    assembled.opcode,
                    assembled.rsv,
                    assembled.payload,
                    inner.config.max_message_size,
                );
                let payload = match decode_result {
                    Ok(payload) => payload,
                    Err(e) => break LoopEnd::Fail(e),
                };
                if let Some(compressed) = compressed_len {
                    inner.metrics.record_compression_received(compressed);
                }

                let message = match Message::from_payload(assembled.opcode, payload) {
                    Ok(message) => message,
                    Err(_) => break LoopEnd::Fail(Error::InvalidUtf8),
                };

                inner.touch_message();
                inner.metrics.record_message_received();
                if let Some((elapsed, bytes)) =
                    gate.on_message(Instant::now(), inner.metrics.bytes_received())
                {
                    publish_metrics(&inner, elapsed, bytes);
                }

                // Backpressure point: blocks until the consumer drains a
                // slot or the queue completes under finalization.
                if inner.queue.enqueue(message).await.is_err() {
                    break LoopEnd::Shutdown;
                }
            }
        }
    };

    assembler.reset();

    match end {
        LoopEnd::Shutdown => {}
        LoopEnd::Eof => {
            inner.finalize(
                Arc::new(Error::ReceiveFailed(
                    "stream ended without a close handshake",
                )),
                Some(CloseStatus::local(1006, "")),
            );
        }
        LoopEnd::Fail(e) => {
            let wire_code = e.close_code();
            let cause = Arc::new(e);
            warn!("connection {}: receive loop failed: {}", inner.id, cause);
            if let Some(code) = wire_code {
                // Best effort: tell the peer why before tearing down.
                let _ = inner
                    .send_close_frame(&CloseStatus::local(code, ""))
                    .await;
            }
            inner.finalize(
                cause,
                Some(CloseStatus::local(wire_code.unwrap_or(1006), "")),
            );
        }
        LoopEnd::PeerClose(payload) => match CloseStatus::from_payload(&payload) {
            Err(e) => {
                let code = e.close_code().unwrap_or(1002);
                let cause = Arc::new(e);
                let _ = inner.send_close_frame(&CloseStatus::local(code, "")).await;
                inner.finalize(cause, Some(CloseStatus::local(code, "")));
            }
            Ok(remote_status) => {
                debug!(
                    "connection {}: peer sent close {:?}",
                    inner.id, remote_status
                );
                inner
                    .state
                    .transition(ConnectionState::Open, ConnectionState::Closing);
                // Reciprocate with a normal closure unless our own close
                // frame already went out.
                let _ = inner.send_close_frame(&CloseStatus::local(1000, "")).await;
                let _ = inner.remote_close_tx.send(true);
                let status = remote_status.unwrap_or_else(|| CloseStatus::local(1005, ""));
                inner.finalize(Arc::new(Error::PeerClosed(status.clone())), Some(status));
            }
        },
    }
}

fn handle_pong(inner: &Arc<ConnectionInner>, now: Instant) {
    inner.metrics.record_pong_received();
    let rtt = {
        let mut ping_state = inner.ping_state.lock().unwrap();
        ping_state.last_pong_at = Some(now);
        ping_state
            .outstanding_ping
            .take()
            .map(|ping_at| now.saturating_duration_since(ping_at))
    };
    inner.pong_notify.notify_one();

    // Unsolicited pongs keep the connection alive but carry no timing
    // information.
    if let Some(rtt) = rtt {
        let band_change = inner.health.lock().unwrap().record_rtt(rtt);
        if let Some(band) = band_change {
            debug!("connection {}: quality now {:?}", inner.id, band);
            inner.emit(Event::QualityChanged(inner.id, band));
        }
    }
}

fn publish_metrics(inner: &Arc<ConnectionInner>, elapsed: Duration, bytes: u64) {
    let throughput = if elapsed.is_zero() {
        0.0
    } else {
        bytes as f64 / elapsed.as_secs_f64()
    };
    *inner.last_throughput.lock().unwrap() = throughput;
    let snapshot = inner.metrics.snapshot(Instant::now(), inner.last_activity());
    inner.emit(Event::MetricsUpdated(inner.id, snapshot));
}

/// Periodic keepalive: pings paced from last activity, each with an
/// 8-byte big-endian counter payload and a pong deadline, plus the idle
/// timeout over application messages.
async fn keepalive_loop(inner: Arc<ConnectionInner>, mut shutdown: watch::Receiver<bool>) {
    let ping_interval = inner.config.ping_interval;
    let idle_timeout = inner.config.idle_timeout;
    let mut counter: u64 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }
        let now = Instant::now();

        let idle_deadline = if idle_timeout.is_zero() {
            None
        } else {
            Some(inner.last_message().max(inner.epoch) + idle_timeout)
        };
        if let Some(deadline) = idle_deadline {
            if now >= deadline {
                warn!("connection {}: idle timeout", inner.id);
                inner.finalize(
                    Arc::new(Error::IdleTimeout),
                    Some(CloseStatus::local(1006, "idle timeout")),
                );
                break;
            }
        }

        let ping_deadline = if ping_interval.is_zero() {
            None
        } else {
            Some(inner.last_activity() + ping_interval)
        };

        let target = match (ping_deadline, idle_deadline) {
            (Some(ping), Some(idle)) => ping.min(idle),
            (Some(ping), None) => ping,
            (None, Some(idle)) => idle,
            (None, None) => break,
        };

        if now < target {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = sleep_until(target) => {}
            }
            // Activity may have moved the deadlines; re-evaluate.
            continue;
        }

        let ping_due = ping_deadline.map(|deadline| now >= deadline).unwrap_or(false);
        if !ping_due {
            continue;
        }
        if inner.state.load() != ConnectionState::Open {
            break;
        }

        counter += 1;
        let payload = counter.to_be_bytes();
        let ping_at = now;
        inner.ping_state.lock().unwrap().outstanding_ping = Some(ping_at);

        if inner
            .send_frame_raw(true, OpCode::Ping, 0, &payload, false)
            .await
            .is_err()
        {
            break;
        }
        inner.metrics.record_ping_sent();
        inner.health.lock().unwrap().record_ping();
        debug!("connection {}: ping #{} sent", inner.id, counter);

        let answered = timeout(inner.config.pong_timeout, wait_for_pong(&inner, ping_at)).await;
        if answered.is_err() {
            if !*shutdown.borrow() {
                warn!("connection {}: pong timeout", inner.id);
                inner.finalize(
                    Arc::new(Error::PongTimeout),
                    Some(CloseStatus::local(1006, "pong timeout")),
                );
            }
            break;
        }
    }
}

// Resolves once a pong stamped at or after `ping_at` has been observed,
// or the connection finalized underneath us.
async fn wait_for_pong(inner: &Arc<ConnectionInner>, ping_at: Instant) {
    loop {
        {
            let ping_state = inner.ping_state.lock().unwrap();
            if matches!(ping_state.last_pong_at, Some(pong_at) if pong_at >= ping_at) {
                return;
            }
        }
        if inner.finalized.load(Ordering::SeqCst) {
            return;
        }
        inner.pong_notify.notified().await;
    }
}
