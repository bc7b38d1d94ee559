//! Job Request Queue (spec §4.1, §6.1).
//!
//! Durable, crash-recoverable request queue with an atomic claim so at most
//! one worker ever holds a given request. Grounded on
//! codetriever's `chunk_queue.rs::dequeue_chunks` `WITH claimed AS (... FOR
//! UPDATE SKIP LOCKED) UPDATE ... FROM claimed` CTE, translated from sqlx
//! bind-parameter syntax to `tokio-postgres`'s positional `$n` placeholders,
//! and on `postgres_service.rs::mark_chunk_in_progress` for the
//! compare-and-swap transition shape.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{ConcurrentTransitionError, OrchestratorError, OrchestratorResult};
use crate::metadata_store::MetadataStoreGateway;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    New,
    Claimed,
    Processing,
    Done,
    Failed,
    Cancelled,
}

impl RequestStatus {
    fn as_str(self) -> &'static str {
        match self {
            RequestStatus::New => "NEW",
            RequestStatus::Claimed => "CLAIMED",
            RequestStatus::Processing => "PROCESSING",
            RequestStatus::Done => "DONE",
            RequestStatus::Failed => "FAILED",
            RequestStatus::Cancelled => "CANCELLED",
        }
    }

    pub(crate) fn from_str(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(RequestStatus::New),
            "CLAIMED" => Some(RequestStatus::Claimed),
            "PROCESSING" => Some(RequestStatus::Processing),
            "DONE" => Some(RequestStatus::Done),
            "FAILED" => Some(RequestStatus::Failed),
            "CANCELLED" => Some(RequestStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states never accept another transition (spec §4.1 invariant
    /// "terminal immutability").
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Done | RequestStatus::Failed | RequestStatus::Cancelled)
    }
}

#[derive(Debug, Clone)]
pub struct JobRequest {
    pub request_id: Uuid,
    pub mapping_ref: String,
    pub status: RequestStatus,
    pub claim_owner: Option<String>,
    pub claim_deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub parameters_json: JsonValue,
}

fn row_to_request(row: &tokio_postgres::Row) -> OrchestratorResult<JobRequest> {
    let status_str: String = row.get("status");
    let status = RequestStatus::from_str(&status_str)
        .ok_or_else(|| OrchestratorError::other(format!("unknown request status '{status_str}'")))?;
    Ok(JobRequest {
        request_id: row.get("request_id"),
        mapping_ref: row.get("mapping_ref"),
        status,
        claim_owner: row.get("claim_owner"),
        claim_deadline: row.get("claim_deadline"),
        created_at: row.get("created_at"),
        parameters_json: row.get("parameters_json"),
    })
}

pub struct JobRequestQueue<'a> {
    store: &'a MetadataStoreGateway,
}

impl<'a> JobRequestQueue<'a> {
    pub fn new(store: &'a MetadataStoreGateway) -> Self {
        Self { store }
    }

    fn table(&self) -> String {
        format!(
            "{}.{}",
            self.store.dialect().quote_ident(self.store.schema()),
            self.store.dialect().quote_ident("request_queue")
        )
    }

    /// Insert a new request in state NEW (spec §4.1). Deduplication against
    /// an existing in-flight request for the same mapping is the caller's
    /// responsibility (Design Notes §9, Open Question 3).
    pub async fn enqueue(&self, mapping_ref: &str, parameters_json: JsonValue) -> OrchestratorResult<Uuid> {
        let request_id = Uuid::new_v4();
        let table = self.table();
        self.store
            .execute(
                &format!(
                    "INSERT INTO {table} (request_id, mapping_ref, status, parameters_json) VALUES ($1, $2, 'NEW', $3)"
                ),
                &[&request_id, &mapping_ref, &parameters_json],
            )
            .await?;
        Ok(request_id)
    }

    /// Atomically claim up to `limit` NEW requests for `owner`, using a
    /// `SELECT ... FOR UPDATE SKIP LOCKED` CTE so concurrent claimants never
    /// double-claim the same row (spec §4.1, §8 property 1).
    pub async fn claim(&self, owner: &str, limit: i64, lease_duration_s: i64) -> OrchestratorResult<Vec<JobRequest>> {
        let table = self.table();
        let sql = format!(
            "WITH claimed AS (
                SELECT request_id
                FROM {table}
                WHERE status = 'NEW'
                ORDER BY created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {table}
            SET status = 'CLAIMED',
                claim_owner = $2,
                claim_deadline = NOW() + ($3 || ' seconds')::interval,
                started_at = NOW()
            FROM claimed
            WHERE {table}.request_id = claimed.request_id
            RETURNING {table}.request_id, {table}.mapping_ref, {table}.status,
                      {table}.claim_owner, {table}.claim_deadline, {table}.created_at,
                      {table}.parameters_json"
        );
        let rows = self
            .store
            .query(&sql, &[&limit, &owner, &lease_duration_s.to_string()])
            .await?;
        rows.iter().map(row_to_request).collect()
    }

    /// Compare-and-swap status transition (spec §4.1, §7
    /// `ConcurrentTransitionError`): succeeds only if the row is currently in
    /// `from_status`; otherwise returns `ConcurrentTransitionError` without
    /// mutating anything.
    pub async fn transition(&self, request_id: Uuid, from: RequestStatus, to: RequestStatus) -> OrchestratorResult<()> {
        let table = self.table();
        let finished_clause = if to.is_terminal() { ", finished_at = NOW()" } else { "" };
        let sql = format!(
            "UPDATE {table} SET status = $1{finished_clause} WHERE request_id = $2 AND status = $3"
        );
        let affected = self
            .store
            .execute(&sql, &[&to.as_str(), &request_id, &from.as_str()])
            .await?;
        if affected == 0 {
            return Err(OrchestratorError::ConcurrentTransition(ConcurrentTransitionError {
                request_id,
                expected: from.as_str().to_string(),
            }));
        }
        Ok(())
    }

    /// Refresh a claimed request's lease so `reclaim_expired` does not treat
    /// a still-alive worker as dead (spec §4.1, §5).
    pub async fn heartbeat(&self, request_id: Uuid, lease_duration_s: i64) -> OrchestratorResult<()> {
        let table = self.table();
        self.store
            .execute(
                &format!(
                    "UPDATE {table} SET claim_deadline = NOW() + ($1 || ' seconds')::interval WHERE request_id = $2 AND status IN ('CLAIMED', 'PROCESSING')"
                ),
                &[&lease_duration_s.to_string(), &request_id],
            )
            .await?;
        Ok(())
    }

    /// Return expired claims (`claim_deadline` in the past, still in
    /// `CLAIMED`/`PROCESSING`) to `NEW` so another worker can claim them
    /// (spec §4.1, §8 property 8 "reclaim liveness").
    pub async fn reclaim_expired(&self) -> OrchestratorResult<u64> {
        let table = self.table();
        self.store
            .execute(
                &format!(
                    "UPDATE {table} SET status = 'NEW', claim_owner = NULL, claim_deadline = NULL
                     WHERE status IN ('CLAIMED', 'PROCESSING') AND claim_deadline < NOW()"
                ),
                &[],
            )
            .await
    }

    /// Cancel a request from any non-terminal state (spec §4.1: "CANCELLED
    /// is reachable from any non-terminal state").
    pub async fn cancel(&self, request_id: Uuid) -> OrchestratorResult<()> {
        let table = self.table();
        let affected = self
            .store
            .execute(
                &format!(
                    "UPDATE {table} SET status = 'CANCELLED', finished_at = NOW()
                     WHERE request_id = $1 AND status NOT IN ('DONE', 'FAILED', 'CANCELLED')"
                ),
                &[&request_id],
            )
            .await?;
        if affected == 0 {
            return Err(OrchestratorError::other(format!(
                "request {request_id} is already in a terminal state"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_recognized() {
        assert!(RequestStatus::Done.is_terminal());
        assert!(RequestStatus::Failed.is_terminal());
        assert!(RequestStatus::Cancelled.is_terminal());
        assert!(!RequestStatus::New.is_terminal());
        assert!(!RequestStatus::Claimed.is_terminal());
        assert!(!RequestStatus::Processing.is_terminal());
    }

    #[test]
    fn status_round_trips_through_its_string_form() {
        for status in [
            RequestStatus::New,
            RequestStatus::Claimed,
            RequestStatus::Processing,
            RequestStatus::Done,
            RequestStatus::Failed,
            RequestStatus::Cancelled,
        ] {
            assert_eq!(RequestStatus::from_str(status.as_str()), Some(status));
        }
    }

    #[test]
    fn unknown_status_string_does_not_parse() {
        assert_eq!(RequestStatus::from_str("BOGUS"), None);
    }
}
