use crate::error::Error;
use crate::extensions::ExtensionFactory;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct WebSocketConfig {
    /// Inbound frames with a payload larger than this are rejected with
    /// close code 1009.
    pub max_frame_size: usize,
    /// Cap for a reassembled or inflated message, checked before any buffer
    /// growth.
    pub max_message_size: usize,
    /// Cap on the number of fragments a single message may span.
    pub max_fragment_count: usize,
    /// Outbound messages longer than this are split into continuation
    /// frames of at most this size.
    pub fragmentation_threshold: usize,
    /// Capacity of the bounded queue between the receive loop and the
    /// consumer; the receive loop blocks when it is full.
    pub receive_queue_capacity: usize,
    /// Bound for transport connect plus the HTTP upgrade exchange.
    pub handshake_timeout: Duration,
    /// Bound for the graceful close handshake; on expiry the connection is
    /// aborted.
    pub close_handshake_timeout: Duration,
    /// Keepalive ping cadence, measured from last activity. Zero disables
    /// keepalive.
    pub ping_interval: Duration,
    /// Deadline for a pong answering each keepalive ping.
    pub pong_timeout: Duration,
    /// Abnormal close after no application messages for this duration.
    /// Zero disables the idle check.
    pub idle_timeout: Duration,
    /// Subprotocols offered in preference order; the server may select
    /// exactly one.
    pub sub_protocols: Vec<String>,
    /// Extensions offered to the server, in pipeline order.
    pub extensions: Vec<Arc<dyn ExtensionFactory>>,
    /// Fail the connect with close code 1010 when negotiation yields no
    /// active extension.
    pub require_negotiated_extensions: bool,
    /// Extra request headers; reserved WebSocket header names are rejected.
    pub custom_headers: Vec<(String, String)>,
    pub reconnect: ReconnectPolicy,
    /// Publish a metrics snapshot at least this often while messages flow.
    pub metrics_update_interval: Duration,
    /// Publish a metrics snapshot after this many message events.
    pub metrics_update_message_interval: u64,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        WebSocketConfig {
            max_frame_size: 16 << 20,
            max_message_size: 64 << 20,
            max_fragment_count: 1024,
            fragmentation_threshold: 64 * 1024,
            receive_queue_capacity: 64,
            handshake_timeout: Duration::from_secs(10),
            close_handshake_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            idle_timeout: Duration::ZERO,
            sub_protocols: Vec::new(),
            extensions: Vec::new(),
            require_negotiated_extensions: false,
            custom_headers: Vec::new(),
            reconnect: ReconnectPolicy::default(),
            metrics_update_interval: Duration::from_secs(5),
            metrics_update_message_interval: 100,
        }
    }
}

impl WebSocketConfig {
    /// Cross-field validation, run once at connect time.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_frame_size == 0 || self.max_message_size == 0 {
            return Err(Error::InvalidConfig(
                "max_frame_size and max_message_size must be non-zero".into(),
            ));
        }
        if self.fragmentation_threshold == 0 {
            return Err(Error::InvalidConfig(
                "fragmentation_threshold must be non-zero".into(),
            ));
        }
        if self.fragmentation_threshold > self.max_frame_size {
            return Err(Error::InvalidConfig(format!(
                "fragmentation_threshold ({}) can't be greater than max_frame_size ({})",
                self.fragmentation_threshold, self.max_frame_size
            )));
        }
        let assembled_cap = (self.max_frame_size as u128) * (self.max_fragment_count as u128);
        if self.max_message_size as u128 > assembled_cap {
            return Err(Error::InvalidConfig(format!(
                "max_message_size ({}) exceeds max_frame_size * max_fragment_count ({})",
                self.max_message_size, assembled_cap
            )));
        }
        if self.receive_queue_capacity == 0 {
            return Err(Error::InvalidConfig(
                "receive_queue_capacity must be at least 1".into(),
            ));
        }
        if !self.ping_interval.is_zero() && self.pong_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "pong_timeout must be non-zero when keepalive is enabled".into(),
            ));
        }
        self.reconnect.validate()?;
        Ok(())
    }
}

impl fmt::Debug for WebSocketConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketConfig")
            .field("max_frame_size", &self.max_frame_size)
            .field("max_message_size", &self.max_message_size)
            .field("max_fragment_count", &self.max_fragment_count)
            .field("fragmentation_threshold", &self.fragmentation_threshold)
            .field("receive_queue_capacity", &self.receive_queue_capacity)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("close_handshake_timeout", &self.close_handshake_timeout)
            .field("ping_interval", &self.ping_interval)
            .field("pong_timeout", &self.pong_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("sub_protocols", &self.sub_protocols)
            .field(
                "extensions",
                &self
                    .extensions
                    .iter()
                    .map(|e| e.name().to_owned())
                    .collect::<Vec<_>>(),
            )
            .field(
                "require_negotiated_extensions",
                &self.require_negotiated_extensions,
            )
            .field("custom_headers", &self.custom_headers)
            .field("reconnect", &self.reconnect)
            .finish()
    }
}

/// Exponential backoff with symmetric jitter, gated on the observed close
/// code. `max_retries == -1` retries forever.
#[derive(Clone)]
pub struct ReconnectPolicy {
    pub max_retries: i32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Jitter fraction in `[0, 1]`; each delay is perturbed by a uniform
    /// factor in `[-jitter, +jitter]`.
    pub jitter: f64,
    /// Predicate over the remote close code (`None` when the connection
    /// died without one) deciding whether a reconnect should be attempted.
    pub reconnect_on: Arc<dyn Fn(Option<u16>) -> bool + Send + Sync>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            max_retries: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
            reconnect_on: Arc::new(|code| matches!(code, None | Some(1001) | Some(1006) | Some(1011))),
        }
    }
}

impl ReconnectPolicy {
    /// Policy that never reconnects.
    pub fn disabled() -> Self {
        ReconnectPolicy {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.max_retries < -1 {
            return Err(Error::InvalidConfig(
                "max_retries must be -1 (infinite) or non-negative".into(),
            ));
        }
        if self.multiplier < 1.0 {
            return Err(Error::InvalidConfig(
                "reconnect multiplier must be at least 1.0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(Error::InvalidConfig(
                "reconnect jitter must be within [0, 1]".into(),
            ));
        }
        if self.initial_delay > self.max_delay {
            return Err(Error::InvalidConfig(
                "initial_delay can't be greater than max_delay".into(),
            ));
        }
        Ok(())
    }

    /// `min(max_delay, initial_delay * multiplier^(n-1))` for attempt n,
    /// before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let raw = self.initial_delay.as_secs_f64() * exp;
        Duration::from_secs_f64(raw.min(self.max_delay.as_secs_f64()))
    }

    /// Applies a jitter factor drawn from `[-jitter, +jitter]` and clamps
    /// the result to `[0, max_delay]`.
    pub fn apply_jitter(&self, delay: Duration, factor: f64) -> Duration {
        let jittered = delay.as_secs_f64() * (1.0 + factor.clamp(-self.jitter, self.jitter));
        Duration::from_secs_f64(jittered.clamp(0.0, self.max_delay.as_secs_f64()))
    }

    pub fn should_reconnect(&self, close_code: Option<u16>) -> bool {
        (self.reconnect_on)(close_code)
    }
}

impl fmt::Debug for ReconnectPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectPolicy")
            .field("max_retries", &self.max_retries)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("multiplier", &self.multiplier)
            .field("jitter", &self.jitter)
            .finish()
    }
}

/// RFC 7692 parameters offered by this endpoint. Only the v1
/// no-context-takeover mode is implemented, so both takeover flags are
/// always offered; the options control what we demand of the server.
#[derive(Debug, Clone)]
pub struct DeflateOptions {
    /// flate2 compression level, 0-9.
    pub compression_level: u32,
    /// LZ77 window offered for our compressor, 8-15.
    pub client_max_window_bits: u8,
    /// Window we ask the server to compress with, 8-15.
    pub server_max_window_bits: u8,
    /// Fail negotiation unless the server acknowledges
    /// `server_no_context_takeover`.
    pub require_server_no_context_takeover: bool,
    /// Payloads below this many bytes are sent uncompressed.
    pub compression_threshold: usize,
}

impl Default for DeflateOptions {
    fn default() -> Self {
        DeflateOptions {
            compression_level: 6,
            client_max_window_bits: 15,
            server_max_window_bits: 15,
            require_server_no_context_takeover: false,
            compression_threshold: 256,
        }
    }
}

impl DeflateOptions {
    pub fn validate(&self) -> Result<(), Error> {
        if self.compression_level > 9 {
            return Err(Error::InvalidConfig(
                "compression_level must be between 0 and 9".into(),
            ));
        }
        if !(8..=15).contains(&self.client_max_window_bits)
            || !(8..=15).contains(&self.server_max_window_bits)
        {
            return Err(Error::InvalidMaxWindowBits);
        }
        Ok(())
    }
}
