//! Progress Tracker (spec §4.9).
//!
//! In-memory atomic counters updated by the executor's coordinator as chunk
//! results land, periodically flushed to the metadata store through a
//! `ProgressSink`. Grounded on `postgres_service.rs::get_job_progress_summary`
//! (the read side already exists there); this adds the write side and the
//! coalesced-write throttle the teacher does not need for a single
//! sequential job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::error::OrchestratorResult;
use crate::metadata_store::MetadataStoreGateway;

/// A point-in-time view of a run's progress, cheap to compute from the
/// atomic counters (spec §4.9: "progress-percentage, elapsed, eta,
/// throughput").
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub chunks_completed: u64,
    pub chunks_failed: u64,
    pub chunks_total: u64,
    pub rows_processed: u64,
    pub rows_succeeded: u64,
    pub rows_failed: u64,
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    /// `None` when `chunks_total` is 0 (a NONE-strategy plan has a single
    /// chunk whose size is unknown up front).
    pub fn progress_percentage(&self) -> Option<f64> {
        if self.chunks_total == 0 {
            return None;
        }
        Some((self.chunks_completed + self.chunks_failed) as f64 / self.chunks_total as f64 * 100.0)
    }

    /// Rows processed per second of elapsed wall-clock time.
    pub fn throughput_rows_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.rows_processed as f64 / secs
    }

    /// Linear projection from current throughput; `None` when the total
    /// chunk count or progress so far don't support an estimate.
    pub fn eta(&self) -> Option<Duration> {
        let pct = self.progress_percentage()?;
        if pct <= 0.0 || pct >= 100.0 {
            return None;
        }
        let remaining_fraction = (100.0 - pct) / pct;
        Some(Duration::from_secs_f64(self.elapsed.as_secs_f64() * remaining_fraction))
    }
}

/// Destination for periodic progress writes. The default implementation
/// writes to `run_log`; tests substitute an in-memory sink.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn write(&self, run_id: Uuid, snapshot: ProgressSnapshot) -> OrchestratorResult<()>;
}

/// Writes the running counters onto the `run_log` row for `run_id`. Owns a
/// cloned `MetadataStoreGateway` (cheap — see its doc comment) rather than
/// borrowing one, so it can live inside an `Arc<dyn ProgressSink>` without
/// fighting the trait object's implicit `'static` bound.
pub struct RunLogProgressSink {
    store: MetadataStoreGateway,
}

impl RunLogProgressSink {
    pub fn new(store: MetadataStoreGateway) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ProgressSink for RunLogProgressSink {
    async fn write(&self, run_id: Uuid, snapshot: ProgressSnapshot) -> OrchestratorResult<()> {
        let table = format!(
            "{}.{}",
            self.store.dialect().quote_ident(self.store.schema()),
            self.store.dialect().quote_ident("run_log")
        );
        self.store
            .execute(
                &format!(
                    "UPDATE {table} SET rows_read = $1, rows_succeeded = $2, rows_failed = $3 WHERE run_id = $4"
                ),
                &[
                    &(snapshot.rows_processed as i64),
                    &(snapshot.rows_succeeded as i64),
                    &(snapshot.rows_failed as i64),
                    &run_id,
                ],
            )
            .await?;
        Ok(())
    }
}

/// Fans a single write out to every registered sink (spec §6.2
/// `register-progress-sink`: "optional streaming of Snapshots" alongside the
/// default `run_log` write, not instead of it).
pub struct CompositeProgressSink {
    sinks: Vec<Arc<dyn ProgressSink>>,
}

impl CompositeProgressSink {
    pub fn new(sinks: Vec<Arc<dyn ProgressSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl ProgressSink for CompositeProgressSink {
    async fn write(&self, run_id: Uuid, snapshot: ProgressSnapshot) -> OrchestratorResult<()> {
        for sink in &self.sinks {
            sink.write(run_id, snapshot).await?;
        }
        Ok(())
    }
}

/// Caches the latest snapshot per run in memory, backing the worker-facing
/// `status(request_id)` query's live-progress field (spec §6.2) without a
/// metadata-store round trip.
#[derive(Clone, Default)]
pub struct LiveSnapshotCache {
    snapshots: Arc<AsyncMutex<HashMap<Uuid, ProgressSnapshot>>>,
}

impl LiveSnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, run_id: Uuid) -> Option<ProgressSnapshot> {
        self.snapshots.lock().await.get(&run_id).copied()
    }

    pub async fn clear(&self, run_id: Uuid) {
        self.snapshots.lock().await.remove(&run_id);
    }

    pub fn sink(&self) -> LiveSnapshotSink {
        LiveSnapshotSink { cache: self.clone() }
    }
}

pub struct LiveSnapshotSink {
    cache: LiveSnapshotCache,
}

#[async_trait]
impl ProgressSink for LiveSnapshotSink {
    async fn write(&self, run_id: Uuid, snapshot: ProgressSnapshot) -> OrchestratorResult<()> {
        self.cache.snapshots.lock().await.insert(run_id, snapshot);
        Ok(())
    }
}

/// Lock-free counters for a single run, updated from the coordinator as
/// chunk results are drained (spec §4.9; §5 notes the executor is the sole
/// writer, so `Ordering::Relaxed` is sufficient — there is no
/// read-modify-write race to guard against).
pub struct ProgressTracker {
    chunks_completed: AtomicU64,
    chunks_failed: AtomicU64,
    chunks_total: AtomicU64,
    rows_processed: AtomicU64,
    rows_succeeded: AtomicU64,
    rows_failed: AtomicU64,
    started_at: Instant,
    last_write_at_ms: AtomicI64,
    min_write_interval: Duration,
}

impl ProgressTracker {
    pub fn new(chunks_total: u64, min_write_interval: Duration) -> Self {
        Self {
            chunks_completed: AtomicU64::new(0),
            chunks_failed: AtomicU64::new(0),
            chunks_total: AtomicU64::new(chunks_total),
            rows_processed: AtomicU64::new(0),
            rows_succeeded: AtomicU64::new(0),
            rows_failed: AtomicU64::new(0),
            started_at: Instant::now(),
            last_write_at_ms: AtomicI64::new(i64::MIN),
            min_write_interval,
        }
    }

    pub fn record_chunk_succeeded(&self, rows_read: u64, rows_succeeded: u64, rows_failed: u64) {
        self.chunks_completed.fetch_add(1, Ordering::Relaxed);
        self.rows_processed.fetch_add(rows_read, Ordering::Relaxed);
        self.rows_succeeded.fetch_add(rows_succeeded, Ordering::Relaxed);
        self.rows_failed.fetch_add(rows_failed, Ordering::Relaxed);
    }

    pub fn record_chunk_failed(&self) {
        self.chunks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            chunks_completed: self.chunks_completed.load(Ordering::Relaxed),
            chunks_failed: self.chunks_failed.load(Ordering::Relaxed),
            chunks_total: self.chunks_total.load(Ordering::Relaxed),
            rows_processed: self.rows_processed.load(Ordering::Relaxed),
            rows_succeeded: self.rows_succeeded.load(Ordering::Relaxed),
            rows_failed: self.rows_failed.load(Ordering::Relaxed),
            elapsed: self.started_at.elapsed(),
        }
    }

    /// Coalesced write: at most one write per `min_write_interval`, plus
    /// always allowing a forced final write (spec §4.9: "≤ 1 write per 2s
    /// plus one final write").
    pub async fn maybe_write(&self, sink: &dyn ProgressSink, run_id: Uuid, force: bool) -> OrchestratorResult<()> {
        let now_ms = self.started_at.elapsed().as_millis() as i64;
        let last = self.last_write_at_ms.load(Ordering::Relaxed);
        let due = force || last == i64::MIN || now_ms - last >= self.min_write_interval.as_millis() as i64;
        if !due {
            return Ok(());
        }
        self.last_write_at_ms.store(now_ms, Ordering::Relaxed);
        sink.write(run_id, self.snapshot()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink {
        writes: Mutex<Vec<ProgressSnapshot>>,
    }

    #[async_trait]
    impl ProgressSink for RecordingSink {
        async fn write(&self, _run_id: Uuid, snapshot: ProgressSnapshot) -> OrchestratorResult<()> {
            self.writes.lock().unwrap().push(snapshot);
            Ok(())
        }
    }

    #[test]
    fn progress_percentage_divides_completed_plus_failed_by_total() {
        let tracker = ProgressTracker::new(4, Duration::from_secs(2));
        tracker.record_chunk_succeeded(100, 100, 0);
        tracker.record_chunk_failed();
        let snap = tracker.snapshot();
        assert_eq!(snap.progress_percentage(), Some(50.0));
    }

    #[test]
    fn progress_percentage_is_none_when_total_unknown() {
        let tracker = ProgressTracker::new(0, Duration::from_secs(2));
        assert_eq!(tracker.snapshot().progress_percentage(), None);
    }

    #[test]
    fn throughput_is_zero_with_no_elapsed_time() {
        let snap = ProgressSnapshot {
            chunks_completed: 0,
            chunks_failed: 0,
            chunks_total: 0,
            rows_processed: 1000,
            rows_succeeded: 1000,
            rows_failed: 0,
            elapsed: Duration::from_secs(0),
        };
        assert_eq!(snap.throughput_rows_per_sec(), 0.0);
    }

    #[tokio::test]
    async fn coalesced_write_skips_writes_inside_the_interval() {
        let tracker = ProgressTracker::new(10, Duration::from_secs(3600));
        let sink = RecordingSink {
            writes: Mutex::new(Vec::new()),
        };
        let run_id = Uuid::new_v4();

        tracker.maybe_write(&sink, run_id, false).await.unwrap();
        tracker.record_chunk_succeeded(10, 10, 0);
        tracker.maybe_write(&sink, run_id, false).await.unwrap();

        // Second call falls inside the (intentionally huge) interval, so it
        // is skipped; only the first "due" write lands.
        assert_eq!(sink.writes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn composite_sink_forwards_to_every_registered_sink() {
        let a = Arc::new(RecordingSink { writes: Mutex::new(Vec::new()) });
        let b = Arc::new(RecordingSink { writes: Mutex::new(Vec::new()) });
        let composite = CompositeProgressSink::new(vec![a.clone(), b.clone()]);
        let tracker = ProgressTracker::new(1, Duration::from_secs(0));
        tracker.record_chunk_succeeded(1, 1, 0);

        composite.write(Uuid::new_v4(), tracker.snapshot()).await.unwrap();

        assert_eq!(a.writes.lock().unwrap().len(), 1);
        assert_eq!(b.writes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn live_snapshot_cache_round_trips_and_clears() {
        let cache = LiveSnapshotCache::new();
        let run_id = Uuid::new_v4();
        assert!(cache.get(run_id).await.is_none());

        let tracker = ProgressTracker::new(2, Duration::from_secs(0));
        tracker.record_chunk_succeeded(5, 5, 0);
        cache.sink().write(run_id, tracker.snapshot()).await.unwrap();

        assert_eq!(cache.get(run_id).await.unwrap().rows_processed, 5);

        cache.clear(run_id).await;
        assert!(cache.get(run_id).await.is_none());
    }

    #[tokio::test]
    async fn forced_write_always_lands() {
        let tracker = ProgressTracker::new(10, Duration::from_secs(3600));
        let sink = RecordingSink {
            writes: Mutex::new(Vec::new()),
        };
        let run_id = Uuid::new_v4();

        tracker.maybe_write(&sink, run_id, false).await.unwrap();
        tracker.maybe_write(&sink, run_id, true).await.unwrap();

        assert_eq!(sink.writes.lock().unwrap().len(), 2);
    }
}
