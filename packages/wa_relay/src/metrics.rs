//! Relay metrics for observability

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Relay-wide metrics
#[derive(Debug, Default)]
pub struct RelayMetrics {
    // Push channel metrics
    /// Currently open SSE streams
    pub active_streams: AtomicU64,
    /// Total SSE streams since start
    pub total_streams: AtomicU64,

    // Send metrics
    /// Messages sent on request (send-test and batches)
    pub messages_sent: AtomicU64,
    /// Requested sends that failed
    pub send_failures: AtomicU64,
    /// Batches accepted
    pub batches: AtomicU64,

    // Session metrics
    pub logouts: AtomicU64,
    pub logout_failures: AtomicU64,

    start_time: Option<Instant>,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn stream_opened(&self) {
        self.active_streams.fetch_add(1, Ordering::Relaxed);
        self.total_streams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_closed(&self) {
        self.active_streams.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn send_result(&self, ok: bool) {
        if ok {
            self.messages_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.send_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn batch_sent(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn logout_result(&self, ok: bool) {
        self.logouts.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.logout_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            streams: StreamMetrics {
                active: self.active_streams.load(Ordering::Relaxed),
                total: self.total_streams.load(Ordering::Relaxed),
            },
            sends: SendMetrics {
                sent: self.messages_sent.load(Ordering::Relaxed),
                failed: self.send_failures.load(Ordering::Relaxed),
                batches: self.batches.load(Ordering::Relaxed),
            },
            sessions: SessionMetrics {
                logouts: self.logouts.load(Ordering::Relaxed),
                logout_failures: self.logout_failures.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub streams: StreamMetrics,
    pub sends: SendMetrics,
    pub sessions: SessionMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMetrics {
    pub sent: u64,
    pub failed: u64,
    pub batches: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub logouts: u64,
    pub logout_failures: u64,
}

/// Decrements the active stream count when the SSE stream is dropped.
pub struct StreamGuard {
    metrics: std::sync::Arc<RelayMetrics>,
}

impl StreamGuard {
    pub fn new(metrics: std::sync::Arc<RelayMetrics>) -> Self {
        metrics.stream_opened();
        Self { metrics }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.metrics.stream_closed();
    }
}
