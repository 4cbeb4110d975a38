//! Per-tool performance metrics
//!
//! Opt-in (`--metrics`) request timing: total counts, a rolling latency
//! window for percentiles, and the most recent slow calls. Memory is fixed
//! regardless of uptime; recording is a couple of atomic bumps plus one
//! short mutex hold.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;

/// Rolling window of recent request latencies for percentile math.
const LATENCY_WINDOW_SIZE: usize = 1000;

/// How many slow calls to keep for `get_stats`.
const MAX_SLOW_CALLS: usize = 10;

/// Calls at or above this duration are tracked as slow.
pub const SLOW_CALL_THRESHOLD_MS: u64 = 100;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SlowCall {
    pub tool: String,
    pub duration_ms: u64,
}

/// Snapshot returned by the `get_stats` tool.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub request_count: u64,
    pub error_count: u64,
    pub slow_call_count: u64,
    pub latency_p50_ms: u64,
    pub latency_p95_ms: u64,
    pub latency_p99_ms: u64,
    pub per_tool_counts: HashMap<String, u64>,
    pub top_slow_calls: Vec<SlowCall>,
    pub uptime_secs: u64,
}

/// Thread-safe request metrics. One per server, shared via `Arc`.
pub struct Metrics {
    request_count: AtomicU64,
    error_count: AtomicU64,
    slow_call_count: AtomicU64,
    latencies_ms: Mutex<VecDeque<u64>>,
    per_tool: Mutex<HashMap<String, u64>>,
    slow_calls: Mutex<VecDeque<SlowCall>>,
    started_at: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            slow_call_count: AtomicU64::new(0),
            latencies_ms: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW_SIZE)),
            per_tool: Mutex::new(HashMap::new()),
            slow_calls: Mutex::new(VecDeque::with_capacity(MAX_SLOW_CALLS)),
            started_at: Instant::now(),
        }
    }

    /// Record one dispatched request.
    pub fn record(&self, tool: &str, duration_ms: u64, is_error: bool) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        if is_error {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }

        {
            let mut latencies = self.latencies_ms.lock().unwrap();
            if latencies.len() == LATENCY_WINDOW_SIZE {
                latencies.pop_front();
            }
            latencies.push_back(duration_ms);
        }

        *self
            .per_tool
            .lock()
            .unwrap()
            .entry(tool.to_string())
            .or_insert(0) += 1;

        if duration_ms >= SLOW_CALL_THRESHOLD_MS {
            self.slow_call_count.fetch_add(1, Ordering::Relaxed);
            let mut slow = self.slow_calls.lock().unwrap();
            if slow.len() == MAX_SLOW_CALLS {
                slow.pop_front();
            }
            slow.push_back(SlowCall {
                tool: tool.to_string(),
                duration_ms,
            });
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut sorted: Vec<u64> = self.latencies_ms.lock().unwrap().iter().copied().collect();
        sorted.sort_unstable();

        MetricsSnapshot {
            request_count: self.request_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            slow_call_count: self.slow_call_count.load(Ordering::Relaxed),
            latency_p50_ms: percentile(&sorted, 50),
            latency_p95_ms: percentile(&sorted, 95),
            latency_p99_ms: percentile(&sorted, 99),
            per_tool_counts: self.per_tool.lock().unwrap().clone(),
            top_slow_calls: self.slow_calls.lock().unwrap().iter().cloned().collect(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn percentile(sorted: &[u64], pct: usize) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (sorted.len() * pct).div_ceil(100);
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

#[cfg(test)]
mod metrics_tests {
    use super::*;

    #[test]
    fn test_counts_and_errors() {
        let metrics = Metrics::new();
        metrics.record("ping", 1, false);
        metrics.record("ping", 2, false);
        metrics.record("list_objects", 3, true);

        let snap = metrics.snapshot();
        assert_eq!(snap.request_count, 3);
        assert_eq!(snap.error_count, 1);
        assert_eq!(snap.per_tool_counts.get("ping"), Some(&2));
        assert_eq!(snap.per_tool_counts.get("list_objects"), Some(&1));
    }

    #[test]
    fn test_percentiles_over_window() {
        let metrics = Metrics::new();
        for ms in 1..=100 {
            metrics.record("op", ms, false);
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.latency_p50_ms, 50);
        assert_eq!(snap.latency_p95_ms, 95);
        assert_eq!(snap.latency_p99_ms, 99);
    }

    #[test]
    fn test_slow_call_ring_is_bounded() {
        let metrics = Metrics::new();
        for i in 0..25 {
            metrics.record("slow_op", SLOW_CALL_THRESHOLD_MS + i, false);
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.slow_call_count, 25);
        assert_eq!(snap.top_slow_calls.len(), MAX_SLOW_CALLS);
        // Oldest entries were evicted; the newest survives.
        assert_eq!(
            snap.top_slow_calls.last().unwrap().duration_ms,
            SLOW_CALL_THRESHOLD_MS + 24
        );
    }

    #[test]
    fn test_empty_percentiles_are_zero() {
        let snap = Metrics::new().snapshot();
        assert_eq!(snap.latency_p50_ms, 0);
        assert_eq!(snap.latency_p99_ms, 0);
    }
}
