//! Parallel Executor (spec §4.3).
//!
//! Turns a claimed request plus its mapping snapshot into a `ChunkPlan`,
//! runs a bounded worker pool over it, and drains results through a
//! coordinator that commits checkpoints on the highest contiguous prefix of
//! completed chunks. Grounded on
//! `coinbase_historical_ohlcv_job.rs::fetch_coinbase_historical_resumable`'s
//! sequential chunk loop plus its `retry_failed_chunks` pass, generalized
//! from one fixed sequential loop into a worker-pool coordinator per §4.3
//! and §5.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::checkpoint::CheckpointController;
use crate::chunk_planner::{self, PlanRequest, PlanStrategy};
use crate::chunk_processor::{ChunkProcessor, ChunkResult, RowError};
use crate::config::OrchestratorConfig;
use crate::connection_pool::ConnectionPoolManager;
use crate::dialect::Dialect;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::mapping::{EffectiveCheckpointStrategy, LoadMode, MappingDefinition};
use crate::metadata_store::MetadataStoreGateway;
use crate::progress::{CompositeProgressSink, ProgressSink, ProgressTracker, RunLogProgressSink};
use crate::retry;

/// Shared cancellation flag a dispatcher can set in response to a queue-row
/// `CANCELLED` transition (spec §4.1, §4.3).
#[derive(Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    pub chunks_total: u64,
    pub chunks_completed: u64,
    pub chunks_failed: u64,
    pub rows_read: u64,
    pub rows_succeeded: u64,
    pub rows_failed: u64,
    pub row_errors_truncated: bool,
    pub duration: Duration,
}

pub struct ParallelExecutor<'a> {
    pools: Arc<ConnectionPoolManager>,
    store: &'a MetadataStoreGateway,
    dialect: Arc<dyn Dialect>,
    config: &'a OrchestratorConfig,
    extra_sink: Option<Arc<dyn ProgressSink>>,
}

impl<'a> ParallelExecutor<'a> {
    pub fn new(
        pools: Arc<ConnectionPoolManager>,
        store: &'a MetadataStoreGateway,
        dialect: Arc<dyn Dialect>,
        config: &'a OrchestratorConfig,
    ) -> Self {
        Self {
            pools,
            store,
            dialect,
            config,
            extra_sink: None,
        }
    }

    /// Attach an additional destination for progress snapshots alongside the
    /// default `run_log` write (spec §6.2 `register-progress-sink`).
    pub fn with_extra_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.extra_sink = Some(sink);
        self
    }

    /// Run one mapping end to end for an already-claimed request (spec
    /// §4.3). `mapping` must be the immutable snapshot captured at claim
    /// time; the dispatcher is responsible for not re-reading it mid-run.
    pub async fn run(
        &self,
        run_id: Uuid,
        mapping: Arc<MappingDefinition>,
        load_mode: LoadMode,
        cancel: CancelSignal,
    ) -> OrchestratorResult<RunSummary> {
        let started = Instant::now();
        let checkpoint_ctl = CheckpointController::new(self.store);
        let effective_strategy = mapping.effective_checkpoint_strategy();

        let mut starting_bound = checkpoint_ctl
            .starting_bound(&mapping.mapping_reference, run_id, effective_strategy)
            .await?;

        let (first_plan, ordinal_open_ended) =
            self.build_plan(&mapping, effective_strategy, starting_bound.as_deref()).await?;

        if first_plan.is_empty() {
            return Ok(RunSummary {
                run_id,
                outcome: RunOutcome::Success,
                chunks_total: 0,
                chunks_completed: 0,
                chunks_failed: 0,
                rows_read: 0,
                rows_succeeded: 0,
                rows_failed: 0,
                row_errors_truncated: false,
                duration: started.elapsed(),
            });
        }

        // An ORDINAL plan with no known total emits exactly one window at a
        // time (chunk_planner::plan_ordinal's `None` branch); chunks_total
        // stays 0 ("unknown", per `Snapshot::progress_percentage`) and the
        // outer loop below keeps requesting further windows until one comes
        // back short (spec §4.4, §8 property 5: no row may be silently
        // dropped just because the estimate was unavailable).
        let chunks_total = if ordinal_open_ended { 0 } else { first_plan.len() as u64 };
        let worker_count = self.worker_count(&mapping, effective_strategy, first_plan.len());
        let tracker = Arc::new(ProgressTracker::new(
            chunks_total,
            Duration::from_millis(self.config.progress_write_min_interval_ms),
        ));
        let sink: Arc<dyn ProgressSink> = match &self.extra_sink {
            Some(extra) => Arc::new(CompositeProgressSink::new(vec![
                Arc::new(RunLogProgressSink::new(self.store.clone())),
                Arc::clone(extra),
            ])),
            None => Arc::new(RunLogProgressSink::new(self.store.clone())),
        };

        let row_error_budget = Arc::new(AtomicUsize::new(self.config.row_error_cap));
        let truncate_load = load_mode == LoadMode::TruncateLoad;
        let truncated_chunk_zero = Arc::new(AtomicBool::new(!truncate_load));
        // Set by `coordinate()` on the first permanent chunk failure so every
        // worker stops pulling new chunks (spec §8 scenario S4: "dispatcher
        // stops; chunk 3 never runs").
        let stop_dispatch = Arc::new(AtomicBool::new(false));

        let mut plan = first_plan;
        let mut outcome = RunOutcome::Success;

        loop {
            let chunks_in_window = plan.chunks.len() as u64;
            let work_queue = Arc::new(Mutex::new(plan.chunks.into_iter().collect::<VecDeque<_>>()));
            let (result_tx, mut result_rx) = mpsc::unbounded_channel::<OrchestratorResult<ChunkResult>>();

            let mut handles = Vec::with_capacity(worker_count);
            for _ in 0..worker_count {
                let pools = Arc::clone(&self.pools);
                let dialect = Arc::clone(&self.dialect);
                let mapping = Arc::clone(&mapping);
                let queue = Arc::clone(&work_queue);
                let tx = result_tx.clone();
                let cancel = cancel.clone();
                let retry_cfg = self.config.retry.clone();
                let row_error_budget = Arc::clone(&row_error_budget);
                let truncated_chunk_zero = Arc::clone(&truncated_chunk_zero);
                let stop_dispatch = Arc::clone(&stop_dispatch);

                handles.push(tokio::spawn(async move {
                    loop {
                        if cancel.is_cancelled() || stop_dispatch.load(Ordering::SeqCst) {
                            return;
                        }
                        let chunk = {
                            let mut q = queue.lock().expect("work queue mutex poisoned");
                            q.pop_front()
                        };
                        let Some(chunk) = chunk else { return };

                        let truncate_first = chunk.chunk_index == 0
                            && truncated_chunk_zero
                                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                                .is_ok();

                        let remaining_cap = row_error_budget.load(Ordering::SeqCst);
                        let cancel_for_retry = cancel.clone();
                        let result = retry::with_retry(&retry_cfg, move || cancel_for_retry.is_cancelled(), || {
                            let pools = Arc::clone(&pools);
                            let dialect = Arc::clone(&dialect);
                            let mapping = Arc::clone(&mapping);
                            let chunk = chunk.clone();
                            async move {
                                let processor = ChunkProcessor::new(pools.as_ref(), dialect.as_ref(), remaining_cap);
                                processor.process_chunk(mapping.as_ref(), &chunk, load_mode, truncate_first).await
                            }
                        })
                        .await;

                        if let Ok(ref r) = result {
                            row_error_budget.fetch_sub(
                                r.row_errors.len().min(row_error_budget.load(Ordering::SeqCst)),
                                Ordering::SeqCst,
                            );
                        }

                        if tx.send(result).is_err() {
                            return;
                        }
                    }
                }));
            }
            drop(result_tx);

            let rows_before_window = tracker.snapshot().rows_processed;

            outcome = self
                .coordinate(
                    run_id,
                    &mapping,
                    effective_strategy,
                    &checkpoint_ctl,
                    &tracker,
                    sink.as_ref(),
                    &mut result_rx,
                    &cancel,
                    &stop_dispatch,
                )
                .await?;

            for handle in handles {
                let _ = handle.await;
            }

            if !ordinal_open_ended || outcome != RunOutcome::Success || chunks_in_window == 0 {
                break;
            }

            let rows_this_window = tracker.snapshot().rows_processed - rows_before_window;
            if rows_this_window < mapping.batch_size as u64 {
                // Short window: the source is exhausted.
                break;
            }

            let previous_cursor = starting_bound.as_deref().and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);
            starting_bound = Some((previous_cursor + rows_this_window).to_string());
            checkpoint_ctl
                .write_checkpoint(run_id, starting_bound.as_deref().expect("just set"))
                .await?;
            let (next_plan, _) = self.build_plan(&mapping, effective_strategy, starting_bound.as_deref()).await?;
            if next_plan.is_empty() {
                break;
            }
            plan = next_plan;
        }

        if outcome == RunOutcome::Success {
            checkpoint_ctl.mark_completed(run_id).await?;
        }

        tracker.maybe_write(sink.as_ref(), run_id, true).await.ok();
        let snap = tracker.snapshot();

        Ok(RunSummary {
            run_id,
            outcome,
            chunks_total: snap.chunks_total,
            chunks_completed: snap.chunks_completed,
            chunks_failed: snap.chunks_failed,
            rows_read: snap.rows_processed,
            rows_succeeded: snap.rows_succeeded,
            rows_failed: snap.rows_failed,
            row_errors_truncated: row_error_budget.load(Ordering::SeqCst) == 0,
            duration: started.elapsed(),
        })
    }

    /// Drain chunk results as they arrive (out of order across workers),
    /// committing the checkpoint only once the lowest-numbered outstanding
    /// chunk has landed, so the checkpoint always reflects a contiguous
    /// prefix (spec §4.3, §8 property 3).
    #[allow(clippy::too_many_arguments)]
    async fn coordinate(
        &self,
        run_id: Uuid,
        mapping: &MappingDefinition,
        strategy: EffectiveCheckpointStrategy,
        checkpoint_ctl: &CheckpointController<'_>,
        tracker: &ProgressTracker,
        sink: &dyn ProgressSink,
        result_rx: &mut mpsc::UnboundedReceiver<OrchestratorResult<ChunkResult>>,
        cancel: &CancelSignal,
        stop_dispatch: &AtomicBool,
    ) -> OrchestratorResult<RunOutcome> {
        let mut pending: BTreeMap<u64, ChunkResult> = BTreeMap::new();
        let mut next_expected = 0u64;
        let mut any_permanent_failure = false;

        while let Some(message) = result_rx.recv().await {
            match message {
                Err(err) => {
                    if matches!(err, OrchestratorError::Cancelled) {
                        return Ok(RunOutcome::Cancelled);
                    }
                    tracker.record_chunk_failed();
                    any_permanent_failure = true;
                    stop_dispatch.store(true, Ordering::SeqCst);
                    continue;
                }
                Ok(chunk_result) => {
                    self.persist_row_errors(run_id, &chunk_result).await?;
                    pending.insert(chunk_result.chunk_index, chunk_result);
                }
            }

            while let Some(result) = pending.remove(&next_expected) {
                tracker.record_chunk_succeeded(result.rows_read, result.rows_succeeded, result.rows_failed);
                if result.rows_failed > 0 {
                    // Row-level failures don't fail the chunk (spec §7); the
                    // chunk still advances the checkpoint.
                }
                if let Some(value) = &result.last_checkpoint_observation {
                    if strategy != EffectiveCheckpointStrategy::None {
                        checkpoint_ctl.write_checkpoint(run_id, value).await?;
                    }
                }
                tracker.maybe_write(sink, run_id, false).await.ok();
                next_expected += 1;
            }

            if cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }
        }

        let _ = mapping;
        if cancel.is_cancelled() {
            // Covers the case where every worker saw the cancellation before
            // producing a single chunk result: the channel closes with an
            // empty `pending` and no message ever set this outcome.
            Ok(RunOutcome::Cancelled)
        } else if any_permanent_failure {
            Ok(RunOutcome::Failed)
        } else {
            // Marking the checkpoint COMPLETED is the caller's job: an
            // ORDINAL run with an unknown total may still have further
            // windows to fetch after this one lands (spec §4.4).
            Ok(RunOutcome::Success)
        }
    }

    async fn persist_row_errors(&self, run_id: Uuid, result: &ChunkResult) -> OrchestratorResult<()> {
        for err in &result.row_errors {
            self.insert_row_error(run_id, err).await?;
        }
        Ok(())
    }

    async fn insert_row_error(&self, run_id: Uuid, err: &RowError) -> OrchestratorResult<()> {
        let table = format!(
            "{}.{}",
            self.dialect.quote_ident(self.store.schema()),
            self.dialect.quote_ident("row_error")
        );
        self.store
            .execute(
                &format!(
                    "INSERT INTO {table} (err_id, run_id, row_ordinal, error_code, error_message, row_data_json) VALUES ($1, $2, $3, $4, $5, $6)"
                ),
                &[
                    &Uuid::new_v4(),
                    &run_id,
                    &(err.row_ordinal as i64),
                    &err.error_code,
                    &err.error_message,
                    &err.row_data_serialized,
                ],
            )
            .await?;
        Ok(())
    }

    /// Returns the plan plus whether it's an ORDINAL window built without a
    /// known total row count — the caller must keep requesting further
    /// windows after this one completes until a short window signals the
    /// source is exhausted (spec §4.4, §8 property 5).
    async fn build_plan(
        &self,
        mapping: &MappingDefinition,
        strategy: EffectiveCheckpointStrategy,
        starting_bound: Option<&str>,
    ) -> OrchestratorResult<(chunk_planner::ChunkPlan, bool)> {
        let plan_strategy = match strategy {
            EffectiveCheckpointStrategy::Key => PlanStrategy::Key,
            EffectiveCheckpointStrategy::Ordinal => PlanStrategy::Ordinal,
            EffectiveCheckpointStrategy::None => PlanStrategy::None,
        };

        let (key_max_value, ordinal_total_rows) = match plan_strategy {
            PlanStrategy::Key => (
                self.estimate_bound(mapping, mapping.checkpoint_column.as_deref()).await?,
                None,
            ),
            PlanStrategy::Ordinal => (None, self.estimate_count(mapping).await?),
            PlanStrategy::None => (None, None),
        };
        let ordinal_open_ended = plan_strategy == PlanStrategy::Ordinal && ordinal_total_rows.is_none();

        let req = PlanRequest {
            source_query: &mapping.source_query,
            strategy: plan_strategy,
            batch_size: mapping.batch_size,
            checkpoint_column: mapping.checkpoint_column.as_deref(),
            key_checkpoint_start: starting_bound,
            key_max_value,
            ordinal_checkpoint_start: starting_bound.and_then(|s| s.parse().ok()).unwrap_or(0),
            ordinal_total_rows,
            estimated_rows: ordinal_total_rows,
        };

        Ok((chunk_planner::plan_chunks(&req, self.dialect.as_ref()), ordinal_open_ended))
    }

    async fn estimate_bound(&self, mapping: &MappingDefinition, column: Option<&str>) -> OrchestratorResult<Option<i64>> {
        let Some(column) = column else { return Ok(None) };
        let conn = self
            .pools
            .acquire(&mapping.source_connection_ref, Duration::from_secs(30))
            .await?;
        let sql = format!(
            "SELECT MAX({column}) AS max_value FROM ({}) bound_source",
            mapping.source_query.trim_end_matches(';').trim_end()
        );
        let row = conn.query_one(sql.as_str(), &[]).await.map_err(OrchestratorError::Postgres)?;
        Ok(row.try_get::<_, Option<i64>>("max_value").unwrap_or(None))
    }

    async fn estimate_count(&self, mapping: &MappingDefinition) -> OrchestratorResult<Option<i64>> {
        let conn = self
            .pools
            .acquire(&mapping.source_connection_ref, Duration::from_secs(30))
            .await?;
        let sql = format!(
            "SELECT COUNT(*) AS row_count FROM ({}) count_source",
            mapping.source_query.trim_end_matches(';').trim_end()
        );
        match conn.query_one(sql.as_str(), &[]).await {
            Ok(row) => Ok(row.try_get::<_, i64>("row_count").ok()),
            // A source query the server can't cheaply COUNT over (e.g. one
            // that already carries a LIMIT) falls back to ORDINAL chunking
            // with an unknown total (spec §4.4).
            Err(_) => Ok(None),
        }
    }

    /// Parallel vs single-worker decision (spec §4.3): NONE strategy never
    /// parallelizes (there is exactly one synthetic chunk); otherwise the
    /// estimated row count against `min_rows_for_parallel` decides.
    fn worker_count(&self, mapping: &MappingDefinition, strategy: EffectiveCheckpointStrategy, chunk_count: usize) -> usize {
        if strategy == EffectiveCheckpointStrategy::None || chunk_count <= 1 {
            return 1;
        }
        let estimated_rows = chunk_count as i64 * mapping.batch_size;
        if estimated_rows < self.config.min_rows_for_parallel {
            1
        } else {
            self.config.max_workers.max(1)
        }
    }
}
