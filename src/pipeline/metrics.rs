//! Deletion metrics collection.
//!
//! Counters are bumped by every stage as work flows through; only a final
//! snapshot is reported once the pipeline has drained.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Capacity units are accumulated in thousandths so they fit an atomic integer.
fn to_milli_units(units: f64) -> u64 {
    (units.max(0.0) * 1000.0).round() as u64
}

fn from_milli_units(milli: u64) -> f64 {
    milli as f64 / 1000.0
}

/// Metrics for one deletion run.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Query pages fetched
    pub pages_fetched: AtomicU64,

    /// Item keys returned by the query
    pub items_matched: AtomicU64,

    /// Batches written into the request conduit
    pub batches_dispatched: AtomicU64,

    /// Batches whose delete call succeeded
    pub batches_executed: AtomicU64,

    /// Batches queued but never sent to the store
    pub batches_unexecuted: AtomicU64,

    /// Items reported deleted by the store
    pub items_deleted: AtomicU64,

    /// Items handed back unprocessed
    pub items_unprocessed: AtomicU64,

    /// Read capacity consumed by queries (milli-units)
    pub read_capacity_milli: AtomicU64,

    /// Write capacity consumed by batch deletes (milli-units)
    pub write_capacity_milli: AtomicU64,

    /// Failed remote calls
    pub failures: AtomicU64,

    start_time: Option<Instant>,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    /// Record a fetched page and the keys it matched.
    pub fn add_page(&self, items: u64, read_capacity: f64) {
        self.pages_fetched.fetch_add(1, Ordering::Relaxed);
        self.items_matched.fetch_add(items, Ordering::Relaxed);
        self.read_capacity_milli
            .fetch_add(to_milli_units(read_capacity), Ordering::Relaxed);
    }

    pub fn add_batch_dispatched(&self) {
        self.batches_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successfully executed batch.
    pub fn add_batch_executed(&self, deleted: u64, unprocessed: u64, write_capacity: f64) {
        self.batches_executed.fetch_add(1, Ordering::Relaxed);
        self.items_deleted.fetch_add(deleted, Ordering::Relaxed);
        self.items_unprocessed.fetch_add(unprocessed, Ordering::Relaxed);
        self.write_capacity_milli
            .fetch_add(to_milli_units(write_capacity), Ordering::Relaxed);
    }

    pub fn add_batches_unexecuted(&self, count: u64) {
        self.batches_unexecuted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Deleted items per second.
    pub fn items_per_second(&self) -> f64 {
        let items = self.items_deleted.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            items as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            pages_fetched: self.pages_fetched.load(Ordering::Relaxed),
            items_matched: self.items_matched.load(Ordering::Relaxed),
            batches_dispatched: self.batches_dispatched.load(Ordering::Relaxed),
            batches_executed: self.batches_executed.load(Ordering::Relaxed),
            batches_unexecuted: self.batches_unexecuted.load(Ordering::Relaxed),
            items_deleted: self.items_deleted.load(Ordering::Relaxed),
            items_unprocessed: self.items_unprocessed.load(Ordering::Relaxed),
            read_capacity_units: from_milli_units(self.read_capacity_milli.load(Ordering::Relaxed)),
            write_capacity_units: from_milli_units(
                self.write_capacity_milli.load(Ordering::Relaxed),
            ),
            failures: self.failures.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            items_per_second: self.items_per_second(),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub pages_fetched: u64,
    pub items_matched: u64,
    pub batches_dispatched: u64,
    pub batches_executed: u64,
    pub batches_unexecuted: u64,
    pub items_deleted: u64,
    pub items_unprocessed: u64,
    pub read_capacity_units: f64,
    pub write_capacity_units: f64,
    pub failures: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub items_per_second: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pages: {} | Matched: {} | Batches: {} dispatched, {} executed, {} unexecuted | \
             Deleted: {} @ {:.1} items/s | Unprocessed: {} | \
             Capacity: {:.1} RCU, {:.1} WCU | Failures: {} | Elapsed: {:.1}s",
            self.pages_fetched,
            self.items_matched,
            self.batches_dispatched,
            self.batches_executed,
            self.batches_unexecuted,
            self.items_deleted,
            self.items_per_second,
            self.items_unprocessed,
            self.read_capacity_units,
            self.write_capacity_units,
            self.failures,
            self.elapsed.as_secs_f64(),
        )
    }
}
