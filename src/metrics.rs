use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::Lazy;

/// Global runtime metrics for the coordinator.
///
/// Purpose:
/// - Track active connectors and streaming sessions
/// - Track throughput (received / accepted / published quotes)
/// - Track filtering and failure counters
///
/// Design:
/// - Lock-free (Atomics)
/// - Safe in async + multithreaded contexts
#[derive(Default)]
pub struct RuntimeMetrics {
    // High-level
    pub connectors_active: AtomicUsize,

    // Streaming sessions
    pub sessions_active: AtomicUsize,
    pub reconnects: AtomicUsize,
    pub commands_sent: AtomicUsize,

    // Throughput
    pub quotes_received: AtomicUsize,
    pub quotes_accepted: AtomicUsize,
    pub derived_calculated: AtomicUsize,
    pub rates_published: AtomicUsize,

    // Filtering / failures
    pub tolerance_rejections: AtomicUsize,
    pub updates_dropped: AtomicUsize,
    pub publish_dropped: AtomicUsize,
    pub parse_errors: AtomicUsize,
    pub fetch_errors: AtomicUsize,
    pub cache_errors: AtomicUsize,
}

impl RuntimeMetrics {
    /// One-line summary used by the periodic reporter.
    pub fn summary(&self) -> String {
        let get = |counter: &AtomicUsize| counter.load(Ordering::Relaxed);

        format!(
            "connectors={} sessions={} recv={} accepted={} derived={} published={} rejected={} dropped={} pub_dropped={} parse_err={} fetch_err={} cache_err={} reconnects={} cmds={}",
            get(&self.connectors_active),
            get(&self.sessions_active),
            get(&self.quotes_received),
            get(&self.quotes_accepted),
            get(&self.derived_calculated),
            get(&self.rates_published),
            get(&self.tolerance_rejections),
            get(&self.updates_dropped),
            get(&self.publish_dropped),
            get(&self.parse_errors),
            get(&self.fetch_errors),
            get(&self.cache_errors),
            get(&self.reconnects),
            get(&self.commands_sent),
        )
    }
}

/// Global metrics registry (singleton)
pub static METRICS: Lazy<Arc<RuntimeMetrics>> =
    Lazy::new(|| Arc::new(RuntimeMetrics::default()));

/// Increments a counter by one.
pub fn incr(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
}
