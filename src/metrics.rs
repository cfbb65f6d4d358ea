// Copyright (c) 2026 The Trireme developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// In-memory counters shared by an engine and its event loop.
///
/// Counters are plain atomics: incremented from whichever thread observes
/// the event, read concurrently by the `/metrics` route. No global state;
/// every engine owns one `Arc<Metrics>`.
#[derive(Debug, Default)]
pub struct Metrics {
    pub total_connections: AtomicU64,
    pub active_connections: AtomicU64,
    pub total_requests: AtomicU64,
    pub total_responses: AtomicU64,
    pub total_errors: AtomicU64,

    // Event-loop specific.
    pub loop_iterations: AtomicU64,
    pub loop_events: AtomicU64,
    pub tasks_executed: AtomicU64,
    pub timers_fired: AtomicU64,
    pub select_time_micros: AtomicU64,

    // Hybrid specific.
    pub rejected_admissions: AtomicU64,
}

impl Metrics {
    pub fn new() -> Metrics {
        Metrics::default()
    }

    #[inline]
    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn request_received(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn response_written(&self) {
        self.total_responses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn error(&self) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// A point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_responses: self.total_responses.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            loop_iterations: self.loop_iterations.load(Ordering::Relaxed),
            loop_events: self.loop_events.load(Ordering::Relaxed),
            tasks_executed: self.tasks_executed.load(Ordering::Relaxed),
            timers_fired: self.timers_fired.load(Ordering::Relaxed),
            select_time_micros: self.select_time_micros.load(Ordering::Relaxed),
            rejected_admissions: self.rejected_admissions.load(Ordering::Relaxed),
        }
    }

    /// Pushes a snapshot into the given sink.
    pub fn flush_to(&self, sink: &dyn MetricsSink) {
        sink.record(&self.snapshot());
    }
}

/// A frozen copy of the counters, ready for serialization.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_requests: u64,
    pub total_responses: u64,
    pub total_errors: u64,
    pub loop_iterations: u64,
    pub loop_events: u64,
    pub tasks_executed: u64,
    pub timers_fired: u64,
    pub select_time_micros: u64,
    pub rejected_admissions: u64,
}

/// Destination for metric snapshots. The built-in `/metrics` route reads
/// counters directly; sinks exist for pushing the same numbers elsewhere.
pub trait MetricsSink: Send + Sync {
    fn record(&self, snapshot: &MetricsSnapshot);
}

/// A sink that writes snapshots through the `log` crate at debug level.
pub struct LogSink;

impl MetricsSink for LogSink {
    fn record(&self, snapshot: &MetricsSnapshot) {
        log::debug!(
            "connections={}/{} requests={} responses={} errors={}",
            snapshot.active_connections,
            snapshot.total_connections,
            snapshot.total_requests,
            snapshot.total_responses,
            snapshot.total_errors,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::Metrics;

    #[test]
    fn counters_track_lifecycle_events() {
        let metrics = Metrics::new();
        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_closed();
        metrics.request_received();
        metrics.response_written();
        metrics.error();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_connections, 2);
        assert_eq!(snapshot.active_connections, 1);
        assert_eq!(snapshot.total_requests, 1);
        assert_eq!(snapshot.total_responses, 1);
        assert_eq!(snapshot.total_errors, 1);
    }

    #[test]
    fn snapshot_serializes_with_camel_case_keys() {
        let metrics = Metrics::new();
        metrics.connection_opened();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["totalConnections"], 1);
        assert_eq!(json["activeConnections"], 1);
        assert!(json.get("total_connections").is_none());
    }
}
