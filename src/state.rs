//! # Bridge Metrics
//!
//! Counters shared between the session controller and `main`.
//!
//! ## Thread Safety Pattern:
//! The counters live behind `Arc<RwLock<..>>` so the dispatcher thread can
//! update them while `main` takes a snapshot for the shutdown log. Cloning
//! `BridgeMetrics` clones the handle, not the numbers.

use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Shared handle to the process-wide counters.
///
/// ## Fields:
/// - **inner**: the counters, updated by the controller after each session
/// - **start_time**: process start, for uptime
///
/// ## Rust Concepts:
/// - `Clone` on the handle shares one `Arc`, so every clone sees the same numbers
/// - `RwLock` lets the shutdown snapshot read while nothing is writing
#[derive(Debug, Clone)]
pub struct BridgeMetrics {
    inner: Arc<RwLock<MetricsData>>,
    start_time: Instant,
}

/// Raw counter values.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetricsData {
    /// Sessions that completed the handshake and started workers
    pub sessions_started: u64,
    /// Sessions stopped because a newer connection arrived
    pub sessions_preempted: u64,
    /// Sessions cleaned up after both workers exited on their own
    pub sessions_reaped: u64,
    /// Connections closed without starting a session
    pub connections_refused: u64,
    pub rx_frames: u64,
    pub tx_frames: u64,
    pub silence_chunks: u64,
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(MetricsData::default())),
            start_time: Instant::now(),
        }
    }

    fn update(&self, f: impl FnOnce(&mut MetricsData)) {
        // A poisoned lock only means a panicking writer; the counters are still usable
        let mut data = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(&mut data);
    }

    pub fn record_session_started(&self) {
        self.update(|m| m.sessions_started += 1);
    }

    pub fn record_preempted(&self) {
        self.update(|m| m.sessions_preempted += 1);
    }

    pub fn record_reaped(&self) {
        self.update(|m| m.sessions_reaped += 1);
    }

    pub fn record_refused(&self) {
        self.update(|m| m.connections_refused += 1);
    }

    /// Fold a finished session's stream counters into the totals.
    pub fn record_traffic(&self, rx_frames: u64, tx_frames: u64, silence_chunks: u64) {
        self.update(|m| {
            m.rx_frames += rx_frames;
            m.tx_frames += tx_frames;
            m.silence_chunks += silence_chunks;
        });
    }

    pub fn snapshot(&self) -> MetricsData {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_counters() {
        let metrics = BridgeMetrics::new();
        let other = metrics.clone();
        metrics.record_session_started();
        other.record_preempted();
        other.record_traffic(10, 20, 5);
        other.record_traffic(1, 2, 0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sessions_started, 1);
        assert_eq!(snapshot.sessions_preempted, 1);
        assert_eq!(snapshot.rx_frames, 11);
        assert_eq!(snapshot.tx_frames, 22);
        assert_eq!(snapshot.silence_chunks, 5);
    }
}
