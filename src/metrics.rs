use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Monotone traffic counters for one connection. A plain mutex keeps the
/// 64-bit fields coherent on targets without atomic 64-bit loads.
#[derive(Debug, Default, Clone)]
struct Counters {
    bytes_sent: u64,
    bytes_received: u64,
    frames_sent: u64,
    frames_received: u64,
    messages_sent: u64,
    messages_received: u64,
    pings_sent: u64,
    pongs_received: u64,
    uncompressed_bytes_sent: u64,
    compressed_bytes_sent: u64,
    compressed_bytes_received: u64,
}

/// Point-in-time view of the counters plus connection age information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub pings_sent: u64,
    pub pongs_received: u64,
    pub uncompressed_bytes_sent: u64,
    pub compressed_bytes_sent: u64,
    pub compressed_bytes_received: u64,
    pub uptime: Duration,
    pub last_activity_age: Duration,
}

pub struct MetricsCollector {
    counters: Mutex<Counters>,
    opened_at: Instant,
    frozen_uptime: Mutex<Option<Duration>>,
}

impl MetricsCollector {
    pub fn new(opened_at: Instant) -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            opened_at,
            frozen_uptime: Mutex::new(None),
        }
    }

    pub fn record_frame_sent(&self, wire_bytes: u64, frames: u64) {
        let mut counters = self.counters.lock().unwrap();
        counters.frames_sent += frames;
        counters.bytes_sent += wire_bytes;
    }

    pub fn record_frame_received(&self, wire_bytes: u64) {
        let mut counters = self.counters.lock().unwrap();
        counters.frames_received += 1;
        counters.bytes_received += wire_bytes;
    }

    pub fn record_message_sent(&self) {
        self.counters.lock().unwrap().messages_sent += 1;
    }

    pub fn record_message_received(&self) {
        self.counters.lock().unwrap().messages_received += 1;
    }

    pub fn record_ping_sent(&self) {
        self.counters.lock().unwrap().pings_sent += 1;
    }

    pub fn record_pong_received(&self) {
        self.counters.lock().unwrap().pongs_received += 1;
    }

    pub fn record_compression_sent(&self, uncompressed: u64, compressed: u64) {
        let mut counters = self.counters.lock().unwrap();
        counters.uncompressed_bytes_sent += uncompressed;
        counters.compressed_bytes_sent += compressed;
    }

    pub fn record_compression_received(&self, compressed: u64) {
        self.counters.lock().unwrap().compressed_bytes_received += compressed;
    }

    pub fn ping_counts(&self) -> (u64, u64) {
        let counters = self.counters.lock().unwrap();
        (counters.pings_sent, counters.pongs_received)
    }

    pub fn bytes_received(&self) -> u64 {
        self.counters.lock().unwrap().bytes_received
    }

    /// Freezes the uptime at close; later snapshots keep reporting the
    /// final value.
    pub fn freeze(&self, now: Instant) {
        let mut frozen = self.frozen_uptime.lock().unwrap();
        if frozen.is_none() {
            *frozen = Some(now.duration_since(self.opened_at));
        }
    }

    pub fn snapshot(&self, now: Instant, last_activity: Instant) -> MetricsSnapshot {
        let counters = self.counters.lock().unwrap().clone();
        let uptime = self
            .frozen_uptime
            .lock()
            .unwrap()
            .unwrap_or_else(|| now.duration_since(self.opened_at));
        MetricsSnapshot {
            bytes_sent: counters.bytes_sent,
            bytes_received: counters.bytes_received,
            frames_sent: counters.frames_sent,
            frames_received: counters.frames_received,
            messages_sent: counters.messages_sent,
            messages_received: counters.messages_received,
            pings_sent: counters.pings_sent,
            pongs_received: counters.pongs_received,
            uncompressed_bytes_sent: counters.uncompressed_bytes_sent,
            compressed_bytes_sent: counters.compressed_bytes_sent,
            compressed_bytes_received: counters.compressed_bytes_received,
            uptime,
            last_activity_age: now.saturating_duration_since(last_activity),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionQuality {
    Unknown,
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

/// Derived link health: RTT statistics over a sliding window, ping loss
/// and a banded quality score.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSnapshot {
    pub current_rtt: Option<Duration>,
    pub mean_rtt: Option<Duration>,
    pub jitter: Option<Duration>,
    pub throughput_bytes_per_sec: f64,
    pub quality: ConnectionQuality,
}

pub struct HealthMonitor {
    baseline_samples: Vec<Duration>,
    window: VecDeque<Duration>,
    pings_sent: u64,
    pongs_received: u64,
    last_band: ConnectionQuality,
}

impl HealthMonitor {
    /// RTT samples kept for the windowed mean and jitter.
    pub const WINDOW: usize = 10;
    /// Samples averaged into the baseline RTT.
    pub const BASELINE_SAMPLES: usize = 3;
    /// Score weights for latency degradation vs. ping loss. Tunables, not
    /// derived from a formal model.
    pub const LATENCY_WEIGHT: f64 = 0.6;
    pub const LOSS_WEIGHT: f64 = 0.4;

    pub fn new() -> Self {
        Self {
            baseline_samples: Vec::with_capacity(Self::BASELINE_SAMPLES),
            window: VecDeque::with_capacity(Self::WINDOW),
            pings_sent: 0,
            pongs_received: 0,
            last_band: ConnectionQuality::Unknown,
        }
    }

    pub fn record_ping(&mut self) {
        self.pings_sent += 1;
    }

    /// Feeds one RTT sample; returns the new band when it changed.
    pub fn record_rtt(&mut self, rtt: Duration) -> Option<ConnectionQuality> {
        self.pongs_received += 1;
        if self.baseline_samples.len() < Self::BASELINE_SAMPLES {
            self.baseline_samples.push(rtt);
        }
        if self.window.len() == Self::WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(rtt);

        let band = self.band();
        if band != self.last_band {
            self.last_band = band;
            Some(band)
        } else {
            None
        }
    }

    fn baseline(&self) -> Option<Duration> {
        if self.baseline_samples.is_empty() {
            return None;
        }
        Some(mean(self.baseline_samples.iter()))
    }

    fn windowed_mean(&self) -> Option<Duration> {
        if self.window.is_empty() {
            return None;
        }
        Some(mean(self.window.iter()))
    }

    // Jitter is the standard deviation over the window.
    fn windowed_jitter(&self) -> Option<Duration> {
        if self.window.len() < 2 {
            return None;
        }
        let mean_secs = mean(self.window.iter()).as_secs_f64();
        let variance = self
            .window
            .iter()
            .map(|sample| {
                let diff = sample.as_secs_f64() - mean_secs;
                diff * diff
            })
            .sum::<f64>()
            / self.window.len() as f64;
        Some(Duration::from_secs_f64(variance.sqrt()))
    }

    fn loss_rate(&self) -> f64 {
        if self.pings_sent == 0 {
            return 0.0;
        }
        self.pings_sent.saturating_sub(self.pongs_received) as f64 / self.pings_sent as f64
    }

    /// `0.6 * clamp(baseline/avg, 0, 1) + 0.4 * (1 - loss)`, banded.
    pub fn score(&self) -> Option<f64> {
        let baseline = self.baseline()?.as_secs_f64();
        let avg = self.windowed_mean()?.as_secs_f64();
        if avg <= 0.0 {
            return Some(1.0);
        }
        let latency_factor = (baseline / avg).clamp(0.0, 1.0);
        Some(Self::LATENCY_WEIGHT * latency_factor + Self::LOSS_WEIGHT * (1.0 - self.loss_rate()))
    }

    fn band(&self) -> ConnectionQuality {
        match self.score() {
            None => ConnectionQuality::Unknown,
            Some(score) if score >= 0.9 => ConnectionQuality::Excellent,
            Some(score) if score >= 0.7 => ConnectionQuality::Good,
            Some(score) if score >= 0.5 => ConnectionQuality::Fair,
            Some(score) if score >= 0.3 => ConnectionQuality::Poor,
            Some(_) => ConnectionQuality::Critical,
        }
    }

    pub fn snapshot(&self, bytes_in_interval: u64, interval: Duration) -> HealthSnapshot {
        let throughput = if interval.is_zero() {
            0.0
        } else {
            bytes_in_interval as f64 / interval.as_secs_f64()
        };
        HealthSnapshot {
            current_rtt: self.window.back().copied(),
            mean_rtt: self.windowed_mean(),
            jitter: self.windowed_jitter(),
            throughput_bytes_per_sec: throughput,
            quality: self.last_band,
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn mean<'a>(samples: impl Iterator<Item = &'a Duration>) -> Duration {
    let mut total = Duration::ZERO;
    let mut count = 0u32;
    for sample in samples {
        total += *sample;
        count += 1;
    }
    if count == 0 {
        Duration::ZERO
    } else {
        total / count
    }
}

/// Decides when a metrics snapshot goes out: after N message events or
/// after the publication interval, whichever comes first.
pub struct MetricsGate {
    last_publish: Instant,
    messages_since: u64,
    interval: Duration,
    message_interval: u64,
    bytes_at_last_publish: u64,
}

impl MetricsGate {
    pub fn new(now: Instant, interval: Duration, message_interval: u64) -> Self {
        Self {
            last_publish: now,
            messages_since: 0,
            interval,
            message_interval: message_interval.max(1),
            bytes_at_last_publish: 0,
        }
    }

    /// Records one message event; returns the elapsed interval and byte
    /// delta when a snapshot is due.
    pub fn on_message(&mut self, now: Instant, bytes_received: u64) -> Option<(Duration, u64)> {
        self.messages_since += 1;
        let elapsed = now.duration_since(self.last_publish);
        if self.messages_since >= self.message_interval || elapsed >= self.interval {
            let delta = bytes_received.saturating_sub(self.bytes_at_last_publish);
            self.last_publish = now;
            self.messages_since = 0;
            self.bytes_at_last_publish = bytes_received;
            Some((elapsed, delta))
        } else {
            None
        }
    }
}
