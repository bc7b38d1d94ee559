//! Checkpoint / Restart Controller (spec §4.6).
//!
//! Grounded on `postgres_service.rs`'s `get_pending_chunks` /
//! `mark_chunk_completed` / `mark_chunk_failed` /
//! `get_job_progress_summary` family: the teacher already tracks chunk
//! status durably and resumes from it, keyed by `(job_id, chunk_start,
//! chunk_end)`. This generalizes that to the single `run_log.
//! checkpoint_value` resume marker spec'd in §3/§4.6, keyed by
//! `mapping_ref`.

use uuid::Uuid;

use crate::mapping::EffectiveCheckpointStrategy;
use crate::metadata_store::MetadataStoreGateway;
use crate::error::OrchestratorResult;

pub const COMPLETED_SENTINEL: &str = "COMPLETED";

pub struct CheckpointController<'a> {
    store: &'a MetadataStoreGateway,
}

impl<'a> CheckpointController<'a> {
    pub fn new(store: &'a MetadataStoreGateway) -> Self {
        Self { store }
    }

    /// Read the resume marker for a mapping (spec §4.6).
    ///
    /// - The `checkpoint_value` of the most recent `IN_PROGRESS` run-log row
    ///   is the resume marker.
    /// - `"COMPLETED"` on the most recent `SUCCESS` row with no newer
    ///   `IN_PROGRESS` row means "start from scratch".
    /// - No rows at all also means "start from scratch".
    ///
    /// `current_run_id` is excluded from the search: the dispatcher inserts
    /// the new run's own `IN_PROGRESS` row before handing off to the
    /// executor, so without the exclusion that empty row would always be
    /// "the most recent" and shadow the previous run's checkpoint.
    pub async fn read_checkpoint(&self, mapping_ref: &str, current_run_id: Uuid) -> OrchestratorResult<Option<String>> {
        let table = format!(
            "{}.{}",
            self.store.dialect().quote_ident(self.store.schema()),
            self.store.dialect().quote_ident("run_log")
        );

        let row = self
            .store
            .query_opt(
                &format!(
                    "SELECT status, checkpoint_value FROM {table}
                     WHERE mapping_ref = $1 AND run_id != $2
                     ORDER BY started_at DESC
                     LIMIT 1"
                ),
                &[&mapping_ref, &current_run_id],
            )
            .await?;

        match row {
            None => Ok(None),
            Some(row) => {
                let status: String = row.get("status");
                let checkpoint: Option<String> = row.get("checkpoint_value");
                if status == "IN_PROGRESS" {
                    Ok(checkpoint.filter(|v| v != COMPLETED_SENTINEL))
                } else {
                    // SUCCESS/FAILED/CANCELLED: only a stale value matters,
                    // and COMPLETED (or no value) both mean scratch.
                    Ok(checkpoint.filter(|v| v != COMPLETED_SENTINEL))
                }
            }
        }
    }

    /// Resolve the effective strategy and fetch the appropriate starting
    /// bound for the Chunk Planner.
    pub async fn starting_bound(
        &self,
        mapping_ref: &str,
        current_run_id: Uuid,
        strategy: EffectiveCheckpointStrategy,
    ) -> OrchestratorResult<Option<String>> {
        match strategy {
            EffectiveCheckpointStrategy::None => Ok(None),
            EffectiveCheckpointStrategy::Key | EffectiveCheckpointStrategy::Ordinal => {
                self.read_checkpoint(mapping_ref, current_run_id).await
            }
        }
    }

    /// Write protocol (spec §4.6): called by the executor's coordinator
    /// after the highest contiguous prefix of committed chunks advances.
    /// KEY writes the checkpoint-column value of the last row of that
    /// chunk; ORDINAL writes the cumulative processed-row count. Both are
    /// written to the latest `IN_PROGRESS` run-log row.
    pub async fn write_checkpoint(&self, run_id: Uuid, value: &str) -> OrchestratorResult<()> {
        let table = format!(
            "{}.{}",
            self.store.dialect().quote_ident(self.store.schema()),
            self.store.dialect().quote_ident("run_log")
        );
        self.store
            .execute(
                &format!(
                    "UPDATE {table} SET checkpoint_value = $1 WHERE run_id = $2 AND status = 'IN_PROGRESS'"
                ),
                &[&value, &run_id],
            )
            .await?;
        Ok(())
    }

    /// Mark a run's checkpoint as `"COMPLETED"` at SUCCESS, so a fresh run
    /// does not resume from a stale point (spec §4.6).
    pub async fn mark_completed(&self, run_id: Uuid) -> OrchestratorResult<()> {
        self.write_checkpoint(run_id, COMPLETED_SENTINEL).await
    }
}
