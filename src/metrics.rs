use std::time::Duration;

use metrics::{Counter, Histogram};

/// Instrumentation points for the message pipeline.
///
/// Handles are no-op until a recorder is installed; the worker carries the
/// instrumentation either way so an exporter can be wired without touching
/// call sites.
pub struct WorkerMetrics {
    pub messages_processed: Counter,
    pub messages_failed: Counter,
    pub messages_skipped: Counter,
    pub stale_takeovers: Counter,
    pub acks_failed: Counter,
    pub render_duration: Histogram,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self {
            messages_processed: Counter::noop(),
            messages_failed: Counter::noop(),
            messages_skipped: Counter::noop(),
            stale_takeovers: Counter::noop(),
            acks_failed: Counter::noop(),
            render_duration: Histogram::noop(),
        }
    }

    pub fn record_processed(&self) {
        self.messages_processed.increment(1);
    }

    pub fn record_failed(&self) {
        self.messages_failed.increment(1);
    }

    pub fn record_skip(&self) {
        self.messages_skipped.increment(1);
    }

    pub fn record_takeover(&self) {
        self.stale_takeovers.increment(1);
    }

    pub fn record_ack_failure(&self) {
        self.acks_failed.increment(1);
    }

    pub fn record_render(&self, duration: Duration) {
        self.render_duration.record(duration.as_secs_f64());
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
