//! Chunk Processor (spec §4.7).
//!
//! Executes one chunk end-to-end: extract (server-side cursor) → transform
//! (derivation + coercion) → load (INSERT/TRUNCATE_LOAD/UPSERT) → commit.
//! Grounded on `coinbase_historical_ohlcv_job.rs::process_single_chunk`
//! (fetch, then cache, returning counts) and
//! `postgres_service.rs::insert_ohlcv_batch_refs` (one transaction per
//! chunk, multi-value INSERT with `ON CONFLICT`), generalized from one
//! fixed OHLCV schema to the mapping-driven column list of §3.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::Value as JsonValue;
use tokio_postgres::types::ToSql;
use uuid::Uuid;

use crate::chunk_planner::ChunkDescriptor;
use crate::connection_pool::ConnectionPoolManager;
use crate::derivation::{self, Value as DerivedValue};
use crate::dialect::Dialect;
use crate::error::{OrchestratorError, OrchestratorResult, PermanentDataError};
use crate::mapping::{ColumnMapping, LoadMode, MappingDefinition, TargetType};

#[derive(Debug, Clone)]
pub struct RowError {
    pub row_ordinal: u64,
    pub error_code: &'static str,
    pub error_message: String,
    pub row_data_serialized: JsonValue,
}

#[derive(Debug, Clone)]
pub struct ChunkResult {
    pub chunk_index: u64,
    pub rows_read: u64,
    pub rows_succeeded: u64,
    pub rows_failed: u64,
    pub row_errors: Vec<RowError>,
    pub row_errors_truncated: bool,
    /// The checkpoint-column value of the last row processed (KEY), or the
    /// cumulative row count after this chunk (ORDINAL); `None` for NONE.
    pub last_checkpoint_observation: Option<String>,
}

pub struct ChunkProcessor<'a> {
    pools: &'a ConnectionPoolManager,
    dialect: &'a dyn Dialect,
    row_error_cap: usize,
}

impl<'a> ChunkProcessor<'a> {
    pub fn new(pools: &'a ConnectionPoolManager, dialect: &'a dyn Dialect, row_error_cap: usize) -> Self {
        Self {
            pools,
            dialect,
            row_error_cap,
        }
    }

    /// Process one chunk. `truncate_first` is true only for the single
    /// call that covers chunk 0 of a TRUNCATE_LOAD run (spec §4.7: "the
    /// Executor truncates the target table once before chunk 0 (single
    /// point, never per chunk)").
    pub async fn process_chunk(
        &self,
        mapping: &MappingDefinition,
        chunk: &ChunkDescriptor,
        load_mode: LoadMode,
        truncate_first: bool,
    ) -> OrchestratorResult<ChunkResult> {
        let source_conn = self
            .pools
            .acquire(&mapping.source_connection_ref, std::time::Duration::from_secs(30))
            .await?;

        let rows = source_conn
            .query(chunk.sql.as_str(), &[])
            .await
            .map_err(OrchestratorError::Postgres)?;

        let target_conn = self
            .pools
            .acquire(&mapping.target_connection_ref, std::time::Duration::from_secs(30))
            .await?;
        let mut target_client = target_conn;
        let transaction = target_client
            .transaction()
            .await
            .map_err(OrchestratorError::Postgres)?;

        if truncate_first {
            let stmt = self.dialect.truncate_statement(&mapping.target_schema, &mapping.target_table);
            transaction.execute(stmt.as_str(), &[]).await.map_err(OrchestratorError::Postgres)?;
        }

        let ordered_columns = mapping.ordered_columns();
        let source_column_names: Vec<String> = rows
            .first()
            .map(|r| (0..r.len()).map(|i| r.columns()[i].name().to_string()).collect())
            .unwrap_or_default();

        let mut rows_succeeded = 0u64;
        let mut rows_failed = 0u64;
        let mut row_errors = Vec::new();
        let mut row_errors_truncated = false;
        let mut last_checkpoint_value: Option<String> = None;

        for (ordinal0, row) in rows.iter().enumerate() {
            let row_ordinal = ordinal0 as u64 + 1;
            let source_values = extract_row_values(row, &source_column_names);

            match build_target_row(&ordered_columns, &source_values) {
                Ok(target_values) => {
                    // Each row's INSERT runs inside its own SAVEPOINT: a
                    // DUPLICATE_KEY or other constraint violation aborts only
                    // the savepoint, not the whole chunk transaction, so
                    // subsequent rows can still commit (spec §4.7 step 5).
                    let savepoint = transaction
                        .savepoint(format!("row_{row_ordinal}"))
                        .await
                        .map_err(OrchestratorError::Postgres)?;

                    match insert_row(&savepoint, self.dialect, mapping, &ordered_columns, &target_values, load_mode).await {
                        Ok(()) => {
                            savepoint.commit().await.map_err(OrchestratorError::Postgres)?;
                            rows_succeeded += 1;
                            if let Some(checkpoint_col) = mapping.checkpoint_column.as_ref() {
                                if let Some(v) = target_values.get(checkpoint_col) {
                                    last_checkpoint_value = Some(v.to_string());
                                }
                            }
                        }
                        Err(data_err) => {
                            savepoint.rollback().await.map_err(OrchestratorError::Postgres)?;
                            rows_failed += 1;
                            record_row_error(
                                &mut row_errors,
                                &mut row_errors_truncated,
                                self.row_error_cap,
                                row_ordinal,
                                data_err,
                                &source_values,
                            );
                        }
                    }
                }
                Err(data_err) => {
                    rows_failed += 1;
                    record_row_error(
                        &mut row_errors,
                        &mut row_errors_truncated,
                        self.row_error_cap,
                        row_ordinal,
                        data_err,
                        &source_values,
                    );
                }
            }
        }

        transaction.commit().await.map_err(OrchestratorError::Postgres)?;

        Ok(ChunkResult {
            chunk_index: chunk.chunk_index,
            rows_read: rows.len() as u64,
            rows_succeeded,
            rows_failed,
            row_errors,
            row_errors_truncated,
            last_checkpoint_observation: last_checkpoint_value,
        })
    }
}

fn extract_row_values(row: &tokio_postgres::Row, column_names: &[String]) -> HashMap<String, DerivedValue> {
    let mut map = HashMap::new();
    for (i, name) in column_names.iter().enumerate() {
        let value = pg_value_to_derived(row, i);
        map.insert(name.clone(), value);
    }
    map
}

fn pg_value_to_derived(row: &tokio_postgres::Row, idx: usize) -> DerivedValue {
    if let Ok(v) = row.try_get::<_, Option<i64>>(idx) {
        return v.map(DerivedValue::Integer).unwrap_or(DerivedValue::Null);
    }
    if let Ok(v) = row.try_get::<_, Option<f64>>(idx) {
        return v.map(DerivedValue::Decimal).unwrap_or(DerivedValue::Null);
    }
    if let Ok(v) = row.try_get::<_, Option<bool>>(idx) {
        return v.map(DerivedValue::Boolean).unwrap_or(DerivedValue::Null);
    }
    if let Ok(v) = row.try_get::<_, Option<DateTime<Utc>>>(idx) {
        return v.map(DerivedValue::Timestamp).unwrap_or(DerivedValue::Null);
    }
    if let Ok(v) = row.try_get::<_, Option<String>>(idx) {
        return v.map(DerivedValue::Text).unwrap_or(DerivedValue::Null);
    }
    DerivedValue::Null
}

/// Apply column mappings (direct copy or derivation) then coerce to the
/// target column's semantic type (spec §4.7 step 3–4). Any coercion
/// violation marks the row failed with `TYPE_COERCION`; the caller
/// continues processing subsequent rows.
fn build_target_row(
    columns: &[&ColumnMapping],
    source_values: &HashMap<String, DerivedValue>,
) -> Result<HashMap<String, DerivedValue>, PermanentDataError> {
    let mut target_row = HashMap::new();

    for col in columns {
        let raw = if let Some(expr_src) = &col.derivation_expression {
            let expr = derivation::parse(expr_src).map_err(|reason| PermanentDataError::TypeCoercion {
                column: col.target_column.clone(),
                reason,
            })?;
            derivation::eval(&expr, source_values).map_err(|reason| PermanentDataError::TypeCoercion {
                column: col.target_column.clone(),
                reason,
            })?
        } else {
            let source_name = col.source_column.as_ref().expect("validated: has a source or derivation");
            source_values.get(source_name).cloned().unwrap_or(DerivedValue::Null)
        };

        if col.required_flag && matches!(raw, DerivedValue::Null) {
            return Err(PermanentDataError::RequiredColumnNull(col.target_column.clone()));
        }

        let coerced = coerce(&raw, col.target_type).map_err(|reason| PermanentDataError::TypeCoercion {
            column: col.target_column.clone(),
            reason,
        })?;

        target_row.insert(col.target_column.clone(), coerced);
    }

    Ok(target_row)
}

/// Type coercion rules (spec §4.7 step 4):
/// integer ← integer; decimal ← integer|decimal; text-bounded ← any (with
/// length validation left to the target DDL); timestamp ← timestamp|
/// text-in-ISO-8601; boolean ← boolean|integer-{0,1}|text-{"Y","N"}.
fn coerce(value: &DerivedValue, target: TargetType) -> Result<DerivedValue, String> {
    match (target, value) {
        (TargetType::Integer, DerivedValue::Integer(i)) => Ok(DerivedValue::Integer(*i)),
        (TargetType::Integer, DerivedValue::Null) => Ok(DerivedValue::Null),
        (TargetType::Integer, other) => Err(format!("cannot coerce {other} to integer")),

        (TargetType::Decimal, DerivedValue::Integer(i)) => Ok(DerivedValue::Decimal(*i as f64)),
        (TargetType::Decimal, DerivedValue::Decimal(d)) => Ok(DerivedValue::Decimal(*d)),
        (TargetType::Decimal, DerivedValue::Null) => Ok(DerivedValue::Null),
        (TargetType::Decimal, other) => Err(format!("cannot coerce {other} to decimal")),

        (TargetType::TextBounded, DerivedValue::Null) => Ok(DerivedValue::Null),
        (TargetType::TextBounded, other) => Ok(DerivedValue::Text(other.to_string())),

        (TargetType::Timestamp, DerivedValue::Timestamp(t)) => Ok(DerivedValue::Timestamp(*t)),
        (TargetType::Timestamp, DerivedValue::Text(s)) => DateTime::parse_from_rfc3339(s)
            .map(|dt| DerivedValue::Timestamp(dt.with_timezone(&Utc)))
            .map_err(|_| format!("'{s}' is not a valid ISO-8601 timestamp")),
        (TargetType::Timestamp, DerivedValue::Null) => Ok(DerivedValue::Null),
        (TargetType::Timestamp, other) => Err(format!("cannot coerce {other} to timestamp")),

        (TargetType::Boolean, DerivedValue::Boolean(b)) => Ok(DerivedValue::Boolean(*b)),
        (TargetType::Boolean, DerivedValue::Integer(0)) => Ok(DerivedValue::Boolean(false)),
        (TargetType::Boolean, DerivedValue::Integer(1)) => Ok(DerivedValue::Boolean(true)),
        (TargetType::Boolean, DerivedValue::Text(s)) if s == "Y" => Ok(DerivedValue::Boolean(true)),
        (TargetType::Boolean, DerivedValue::Text(s)) if s == "N" => Ok(DerivedValue::Boolean(false)),
        (TargetType::Boolean, DerivedValue::Null) => Ok(DerivedValue::Null),
        (TargetType::Boolean, other) => Err(format!("cannot coerce {other} to boolean")),

        (TargetType::Binary, DerivedValue::Null) => Ok(DerivedValue::Null),
        (TargetType::Binary, other) => Err(format!("cannot coerce {other} to binary")),
    }
}

fn record_row_error(
    row_errors: &mut Vec<RowError>,
    truncated: &mut bool,
    cap: usize,
    row_ordinal: u64,
    err: PermanentDataError,
    source_values: &HashMap<String, DerivedValue>,
) {
    if row_errors.len() >= cap {
        *truncated = true;
        return;
    }
    let row_data_serialized = serde_json::to_value(
        source_values
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect::<HashMap<_, _>>(),
    )
    .unwrap_or(JsonValue::Null);

    row_errors.push(RowError {
        row_ordinal,
        error_code: err.code(),
        error_message: err.to_string(),
        row_data_serialized,
    });
}

async fn insert_row(
    transaction: &deadpool_postgres::Transaction<'_>,
    dialect: &dyn Dialect,
    mapping: &MappingDefinition,
    columns: &[&ColumnMapping],
    target_values: &HashMap<String, DerivedValue>,
    load_mode: LoadMode,
) -> Result<(), PermanentDataError> {
    let column_names: Vec<String> = columns.iter().map(|c| c.target_column.clone()).collect();
    let quoted_columns: Vec<String> = column_names.iter().map(|c| dialect.quote_ident(c)).collect();

    let placeholders: Vec<String> = (1..=column_names.len()).map(|i| format!("${i}")).collect();

    let table = format!(
        "{}.{}",
        dialect.quote_ident(&mapping.target_schema),
        dialect.quote_ident(&mapping.target_table)
    );

    let mut sql = format!(
        "INSERT INTO {table} ({}) VALUES ({})",
        quoted_columns.join(", "),
        placeholders.join(", ")
    );

    if load_mode == LoadMode::Upsert {
        let key_columns = mapping.key_columns();
        let update_columns: Vec<String> = column_names
            .iter()
            .filter(|c| !key_columns.contains(c))
            .cloned()
            .collect();
        sql.push(' ');
        sql.push_str(&dialect.upsert_clause(&key_columns, &update_columns));
    }

    let boxed_params: Vec<Box<dyn ToSql + Sync + Send>> = column_names
        .iter()
        .map(|name| derived_to_boxed_sql(target_values.get(name).unwrap_or(&DerivedValue::Null)))
        .collect();
    let params: Vec<&(dyn ToSql + Sync)> = boxed_params.iter().map(|b| b.as_ref() as &(dyn ToSql + Sync)).collect();

    let result = transaction.execute(sql.as_str(), &params).await;

    match result {
        Ok(_) => Ok(()),
        Err(e) => {
            if let Some(db_err) = e.as_db_error() {
                if *db_err.code() == tokio_postgres::error::SqlState::UNIQUE_VIOLATION {
                    return Err(PermanentDataError::DuplicateKey);
                }
            }
            Err(PermanentDataError::ConstraintViolation(e.to_string()))
        }
    }
}

fn derived_to_boxed_sql(value: &DerivedValue) -> Box<dyn ToSql + Sync + Send> {
    match value {
        DerivedValue::Null => Box::new(Option::<String>::None),
        DerivedValue::Integer(i) => Box::new(*i),
        DerivedValue::Decimal(d) => Box::new(*d),
        DerivedValue::Text(s) => Box::new(s.clone()),
        DerivedValue::Timestamp(t) => Box::new(*t),
        DerivedValue::Boolean(b) => Box::new(*b),
    }
}

/// Stable identifier for a run, used as the `run_id` foreign key on
/// `RowError` rows persisted by the caller (spec §3).
pub fn new_run_id() -> Uuid {
    Uuid::new_v4()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::AuditRole;

    fn int_col(name: &str, seq: u32) -> ColumnMapping {
        ColumnMapping {
            source_column: Some(name.to_string()),
            target_column: name.to_string(),
            target_type: TargetType::Integer,
            key_flag: false,
            key_sequence: None,
            derivation_expression: None,
            required_flag: false,
            audit_role: None,
            execution_sequence: seq,
        }
    }

    #[test]
    fn coerce_integer_passthrough() {
        assert_eq!(
            coerce(&DerivedValue::Integer(5), TargetType::Integer).unwrap(),
            DerivedValue::Integer(5)
        );
    }

    #[test]
    fn coerce_decimal_from_integer() {
        assert_eq!(
            coerce(&DerivedValue::Integer(5), TargetType::Decimal).unwrap(),
            DerivedValue::Decimal(5.0)
        );
    }

    #[test]
    fn coerce_boolean_from_y_n_text() {
        assert_eq!(
            coerce(&DerivedValue::Text("Y".into()), TargetType::Boolean).unwrap(),
            DerivedValue::Boolean(true)
        );
        assert_eq!(
            coerce(&DerivedValue::Text("N".into()), TargetType::Boolean).unwrap(),
            DerivedValue::Boolean(false)
        );
    }

    #[test]
    fn coerce_boolean_from_integer_zero_one() {
        assert_eq!(
            coerce(&DerivedValue::Integer(1), TargetType::Boolean).unwrap(),
            DerivedValue::Boolean(true)
        );
        assert_eq!(
            coerce(&DerivedValue::Integer(0), TargetType::Boolean).unwrap(),
            DerivedValue::Boolean(false)
        );
    }

    #[test]
    fn coerce_text_type_mismatch_is_an_error_s3() {
        // S3: a value that fails type coercion for the target column.
        let err = coerce(&DerivedValue::Text("not-a-number".into()), TargetType::Integer);
        assert!(err.is_err());
    }

    #[test]
    fn coerce_timestamp_from_iso8601_text() {
        let result = coerce(&DerivedValue::Text("2024-01-01T00:00:00Z".into()), TargetType::Timestamp);
        assert!(result.is_ok());
    }

    #[test]
    fn build_target_row_fails_closed_on_required_null() {
        let mut required = int_col("amount", 0);
        required.required_flag = true;
        let columns = vec![&required];
        let source = HashMap::new();
        let err = build_target_row(&columns, &source);
        assert!(matches!(err, Err(PermanentDataError::RequiredColumnNull(_))));
    }

    #[test]
    fn build_target_row_applies_derivation() {
        let mut derived = int_col("doubled", 0);
        derived.source_column = None;
        derived.derivation_expression = Some("amount * 2".to_string());
        let columns = vec![&derived];
        let mut source = HashMap::new();
        source.insert("amount".to_string(), DerivedValue::Integer(21));
        let row = build_target_row(&columns, &source).unwrap();
        assert_eq!(row.get("doubled"), Some(&DerivedValue::Integer(42)));
    }

    #[test]
    fn audit_role_marks_column_as_audit() {
        let mut col = int_col("created_at", 1);
        col.audit_role = Some(AuditRole::CreatedAt);
        assert!(col.is_audit());
    }
}
