//! Dispatcher: the glue between the Job Request Queue and the Parallel
//! Executor (spec §2 data/control flow: "a Dispatcher loop in the queue
//! component atomically claims one request and hands it to the Parallel
//! Executor... on completion or failure the queue row is transitioned to a
//! terminal state and the run log updated").
//!
//! Grounded on `main.rs::run_etl_process`'s top-level orchestration loop,
//! generalized from one hardcoded job call to claim-mapping-execute-settle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::connection_pool::ConnectionPoolManager;
use crate::dialect::Dialect;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::executor::{CancelSignal, ParallelExecutor, RunOutcome};
use crate::mapping::{ColumnMapping, LoadMode, MappingDefinition};
use crate::metadata_store::MetadataStoreGateway;
use crate::progress::{CompositeProgressSink, LiveSnapshotCache, ProgressSink, ProgressSnapshot};
use crate::queue::{JobRequest, JobRequestQueue, RequestStatus};

/// Worker-facing view of a request's status (spec §6.2 `status(request_id)`).
#[derive(Debug, Clone)]
pub struct RequestStatusView {
    pub status: RequestStatus,
    pub last_run_id: Option<Uuid>,
    pub snapshot: Option<ProgressSnapshot>,
}

/// Load the immutable mapping snapshot for a request's mapping-reference
/// (spec §3: "captured into an immutable in-memory snapshot for the
/// duration of the run").
pub async fn load_mapping_snapshot(store: &MetadataStoreGateway, mapping_ref: &str) -> OrchestratorResult<MappingDefinition> {
    let mapping_table = format!(
        "{}.{}",
        store.dialect().quote_ident(store.schema()),
        store.dialect().quote_ident("mapping_def")
    );
    let column_table = format!(
        "{}.{}",
        store.dialect().quote_ident(store.schema()),
        store.dialect().quote_ident("column_mapping")
    );

    let mapping_row = store
        .query_opt(
            &format!("SELECT * FROM {mapping_table} WHERE mapping_ref = $1"),
            &[&mapping_ref],
        )
        .await?
        .ok_or_else(|| OrchestratorError::other(format!("no mapping definition for '{mapping_ref}'")))?;

    let column_rows = store
        .query(
            &format!("SELECT * FROM {column_table} WHERE mapping_ref = $1 ORDER BY execution_sequence"),
            &[&mapping_ref],
        )
        .await?;

    let column_list: Vec<ColumnMapping> = column_rows
        .iter()
        .map(|row| -> OrchestratorResult<ColumnMapping> {
            let target_type_str: String = row.get("target_type");
            let audit_role_str: Option<String> = row.get("audit_role");
            Ok(ColumnMapping {
                source_column: row.get("source_column"),
                target_column: row.get("target_column"),
                target_type: parse_target_type(&target_type_str)?,
                key_flag: row.get("key_flag"),
                key_sequence: row.get::<_, Option<i32>>("key_sequence").map(|v| v as u32),
                derivation_expression: row.get("derivation_expression"),
                required_flag: row.get("required_flag"),
                audit_role: audit_role_str.as_deref().map(parse_audit_role).transpose()?,
                execution_sequence: row.get::<_, i32>("execution_sequence") as u32,
            })
        })
        .collect::<OrchestratorResult<_>>()?;

    let load_mode_str: String = mapping_row.get("load_mode_default");
    let checkpoint_strategy_str: String = mapping_row.get("checkpoint_strategy");

    let mapping = MappingDefinition {
        mapping_reference: mapping_row.get("mapping_ref"),
        source_connection_ref: mapping_row.get("source_connection_ref"),
        source_query: mapping_row.get("source_query"),
        target_connection_ref: mapping_row.get("target_connection_ref"),
        target_schema: mapping_row.get("target_schema"),
        target_table: mapping_row.get("target_table"),
        column_list,
        load_mode_default: parse_load_mode(&load_mode_str)?,
        checkpoint_strategy: parse_checkpoint_strategy(&checkpoint_strategy_str)?,
        checkpoint_column: mapping_row.get("checkpoint_column"),
        batch_size: mapping_row.get("batch_size"),
        truncate_flag: mapping_row.get("truncate_flag"),
    };

    mapping.validate().map_err(OrchestratorError::Config)
}

fn parse_target_type(s: &str) -> OrchestratorResult<crate::mapping::TargetType> {
    use crate::mapping::TargetType::*;
    Ok(match s {
        "INTEGER" => Integer,
        "DECIMAL" => Decimal,
        "TEXT_BOUNDED" => TextBounded,
        "TIMESTAMP" => Timestamp,
        "BOOLEAN" => Boolean,
        "BINARY" => Binary,
        other => return Err(OrchestratorError::other(format!("unknown target type '{other}'"))),
    })
}

fn parse_audit_role(s: &str) -> OrchestratorResult<crate::mapping::AuditRole> {
    use crate::mapping::AuditRole::*;
    Ok(match s {
        "CREATED_BY" => CreatedBy,
        "CREATED_AT" => CreatedAt,
        "UPDATED_BY" => UpdatedBy,
        "UPDATED_AT" => UpdatedAt,
        other => return Err(OrchestratorError::other(format!("unknown audit role '{other}'"))),
    })
}

fn parse_load_mode(s: &str) -> OrchestratorResult<LoadMode> {
    Ok(match s {
        "INSERT" => LoadMode::Insert,
        "TRUNCATE_LOAD" => LoadMode::TruncateLoad,
        "UPSERT" => LoadMode::Upsert,
        other => return Err(OrchestratorError::other(format!("unknown load mode '{other}'"))),
    })
}

fn parse_checkpoint_strategy(s: &str) -> OrchestratorResult<crate::mapping::CheckpointStrategy> {
    use crate::mapping::CheckpointStrategy::*;
    Ok(match s {
        "AUTO" => Auto,
        "KEY" => Key,
        "ORDINAL" => Ordinal,
        "NONE" => None,
        other => return Err(OrchestratorError::other(format!("unknown checkpoint strategy '{other}'"))),
    })
}

/// One pass: claim up to `batch` NEW requests, run each to completion,
/// settle the queue row. Active cancellations are tracked by request-id so
/// a `cancel` call from another task can reach an in-flight run.
pub struct Dispatcher<'a> {
    store: &'a MetadataStoreGateway,
    pools: Arc<ConnectionPoolManager>,
    dialect: Arc<dyn Dialect>,
    config: &'a OrchestratorConfig,
    owner: String,
    in_flight: tokio::sync::Mutex<HashMap<Uuid, CancelSignal>>,
    request_runs: tokio::sync::Mutex<HashMap<Uuid, Uuid>>,
    live_snapshots: LiveSnapshotCache,
    external_sinks: tokio::sync::Mutex<Vec<Arc<dyn ProgressSink>>>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        store: &'a MetadataStoreGateway,
        pools: Arc<ConnectionPoolManager>,
        dialect: Arc<dyn Dialect>,
        config: &'a OrchestratorConfig,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            store,
            pools,
            dialect,
            config,
            owner: owner.into(),
            in_flight: tokio::sync::Mutex::new(HashMap::new()),
            request_runs: tokio::sync::Mutex::new(HashMap::new()),
            live_snapshots: LiveSnapshotCache::new(),
            external_sinks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Request cancellation of a running request, if this dispatcher
    /// instance currently owns it (spec §4.3 cancellation handling).
    pub async fn request_cancel(&self, request_id: Uuid) {
        if let Some(signal) = self.in_flight.lock().await.get(&request_id) {
            signal.cancel();
        }
    }

    /// Register an additional destination for progress snapshots across
    /// every run this dispatcher drives (spec §6.2 `register-progress-sink`).
    pub async fn register_progress_sink(&self, sink: Arc<dyn ProgressSink>) {
        self.external_sinks.lock().await.push(sink);
    }

    /// Worker-facing status lookup (spec §6.2): current queue status, the
    /// most recent run-id for this request, and a live in-memory snapshot if
    /// a run is currently in flight.
    pub async fn status(&self, request_id: Uuid) -> OrchestratorResult<RequestStatusView> {
        let table = format!(
            "{}.{}",
            self.dialect.quote_ident(self.store.schema()),
            self.dialect.quote_ident("request_queue")
        );
        let row = self
            .store
            .query_one(&format!("SELECT status FROM {table} WHERE request_id = $1"), &[&request_id])
            .await?;
        let status_str: String = row.get("status");
        let status = RequestStatus::from_str(&status_str)
            .ok_or_else(|| OrchestratorError::other(format!("unknown request status '{status_str}'")))?;

        let last_run_id = self.request_runs.lock().await.get(&request_id).copied();
        let snapshot = match last_run_id {
            Some(run_id) => self.live_snapshots.get(run_id).await,
            None => None,
        };

        Ok(RequestStatusView { status, last_run_id, snapshot })
    }

    /// Claim and run up to `batch` requests, returning how many were
    /// processed (spec §2 data/control flow).
    pub async fn run_once(&self, batch: i64) -> OrchestratorResult<usize> {
        let queue = JobRequestQueue::new(self.store);
        let claimed = queue
            .claim(&self.owner, batch, self.config.lease_duration_s as i64)
            .await?;

        for request in &claimed {
            self.process_one(&queue, request).await;
        }

        Ok(claimed.len())
    }

    async fn process_one(&self, queue: &JobRequestQueue<'_>, request: &JobRequest) {
        if let Err(e) = queue
            .transition(request.request_id, RequestStatus::Claimed, RequestStatus::Processing)
            .await
        {
            warn!("request {} could not move to PROCESSING: {e}", request.request_id);
            return;
        }

        let cancel = CancelSignal::new();
        self.in_flight.lock().await.insert(request.request_id, cancel.clone());

        let outcome = self.execute(request, cancel).await;

        self.in_flight.lock().await.remove(&request.request_id);

        let (to_status, level_ok) = match &outcome {
            Ok(RunOutcome::Success) => (RequestStatus::Done, true),
            Ok(RunOutcome::Cancelled) => (RequestStatus::Cancelled, true),
            Ok(RunOutcome::Failed) | Err(_) => (RequestStatus::Failed, false),
        };

        if let Err(e) = outcome {
            error!("request {} failed: {e}", request.request_id);
        } else if !level_ok {
            warn!("request {} finished with row failures", request.request_id);
        } else {
            info!("request {} finished: {to_status:?}", request.request_id);
        }

        if let Err(e) = queue
            .transition(request.request_id, RequestStatus::Processing, to_status)
            .await
        {
            error!("request {} could not settle to {to_status:?}: {e}", request.request_id);
        }
    }

    async fn execute(&self, request: &JobRequest, cancel: CancelSignal) -> OrchestratorResult<RunOutcome> {
        let mapping = load_mapping_snapshot(self.store, &request.mapping_ref).await?;
        let run_id = Uuid::new_v4();
        self.request_runs.lock().await.insert(request.request_id, run_id);

        let mut sinks: Vec<Arc<dyn ProgressSink>> = vec![Arc::new(self.live_snapshots.sink())];
        sinks.extend(self.external_sinks.lock().await.iter().cloned());
        let extra_sink: Arc<dyn ProgressSink> = if sinks.len() == 1 {
            sinks.remove(0)
        } else {
            Arc::new(CompositeProgressSink::new(sinks))
        };

        let executor = ParallelExecutor::new(Arc::clone(&self.pools), self.store, Arc::clone(&self.dialect), self.config)
            .with_extra_sink(extra_sink);
        self.insert_run_log_row(run_id, request).await?;
        let summary = executor
            .run(run_id, Arc::new(mapping.clone()), mapping.load_mode_default, cancel)
            .await?;
        self.finalize_run_log_row(run_id, &summary).await?;
        self.live_snapshots.clear(run_id).await;
        Ok(summary.outcome)
    }

    async fn insert_run_log_row(&self, run_id: Uuid, request: &JobRequest) -> OrchestratorResult<()> {
        let table = format!(
            "{}.{}",
            self.dialect.quote_ident(self.store.schema()),
            self.dialect.quote_ident("run_log")
        );
        self.store
            .execute(
                &format!(
                    "INSERT INTO {table} (run_id, request_id, mapping_ref, status) VALUES ($1, $2, $3, 'IN_PROGRESS')"
                ),
                &[&run_id, &request.request_id, &request.mapping_ref],
            )
            .await?;
        Ok(())
    }

    async fn finalize_run_log_row(&self, run_id: Uuid, summary: &crate::executor::RunSummary) -> OrchestratorResult<()> {
        let table = format!(
            "{}.{}",
            self.dialect.quote_ident(self.store.schema()),
            self.dialect.quote_ident("run_log")
        );
        let status = match summary.outcome {
            RunOutcome::Success => "SUCCESS",
            RunOutcome::Failed => "FAILED",
            RunOutcome::Cancelled => "CANCELLED",
        };
        self.store
            .execute(
                &format!(
                    "UPDATE {table} SET status = $1, rows_read = $2, rows_succeeded = $3, rows_failed = $4,
                     row_errors_truncated = $5, ended_at = NOW() WHERE run_id = $6"
                ),
                &[
                    &status,
                    &(summary.rows_read as i64),
                    &(summary.rows_succeeded as i64),
                    &(summary.rows_failed as i64),
                    &summary.row_errors_truncated,
                    &run_id,
                ],
            )
            .await?;
        Ok(())
    }

    /// Periodic background loop: reclaim expired claims, then claim and run
    /// a fresh batch, sleeping between passes (spec §4.1, §5).
    pub async fn run_forever(&self, batch: i64, poll_interval: Duration) {
        let queue = JobRequestQueue::new(self.store);
        loop {
            if let Err(e) = queue.reclaim_expired().await {
                error!("reclaim_expired failed: {e}");
            }
            match self.run_once(batch).await {
                Ok(0) => tokio::time::sleep(poll_interval).await,
                Ok(_) => {}
                Err(e) => {
                    error!("dispatcher pass failed: {e}");
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    }
}
