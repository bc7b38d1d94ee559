//! Database dialect capability interface (Design Notes §9).
//!
//! The Metadata Store Gateway and the Chunk Processor are polymorphic over
//! `Dialect`; neither branches on a dialect tag inline. Only `Postgres` is
//! implemented here — the teacher's own stack (`tokio-postgres`) only talks
//! to Postgres — but the trait boundary is kept so a future dialect slots in
//! without touching call sites, per Design Notes §9.

use crate::mapping::{LoadMode, TargetType};

/// Capability surface a SQL dialect must provide.
pub trait Dialect: Send + Sync {
    /// Quote an identifier (table, column) for safe interpolation.
    fn quote_ident(&self, ident: &str) -> String;

    /// The clause appended to a claim-style `SELECT ... FOR UPDATE` to allow
    /// concurrent workers to skip rows already locked by another claimant
    /// (spec §4.1, §6.1).
    fn skip_locked_clause(&self) -> &'static str;

    /// Row-position windowing clause for the ORDINAL chunk strategy
    /// (spec §4.4). Returns the full `OFFSET ... FETCH ...` / `LIMIT ...
    /// OFFSET ...` suffix for the given window.
    fn offset_fetch(&self, offset: i64, fetch: i64) -> String;

    /// Upsert fragment for the UPSERT load mode (spec §4.7), appended after
    /// the `INSERT INTO ... VALUES (...)` clause. `key_columns` identifies
    /// the conflict target; `update_columns` lists the non-key columns to
    /// refresh on conflict.
    fn upsert_clause(&self, key_columns: &[String], update_columns: &[String]) -> String;

    /// The literal SQL type used for a target's semantic type, used only
    /// when the gateway creates a target table from a mapping definition
    /// (not required when the table already exists, which is the common
    /// case).
    fn sql_type(&self, target_type: TargetType) -> &'static str;

    fn truncate_statement(&self, schema: &str, table: &str) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Postgres;

impl Dialect for Postgres {
    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn skip_locked_clause(&self) -> &'static str {
        "FOR UPDATE SKIP LOCKED"
    }

    fn offset_fetch(&self, offset: i64, fetch: i64) -> String {
        format!("OFFSET {offset} FETCH NEXT {fetch} ROWS ONLY")
    }

    fn upsert_clause(&self, key_columns: &[String], update_columns: &[String]) -> String {
        if update_columns.is_empty() {
            return format!(
                "ON CONFLICT ({}) DO NOTHING",
                key_columns
                    .iter()
                    .map(|c| self.quote_ident(c))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        let conflict_cols = key_columns
            .iter()
            .map(|c| self.quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let sets = update_columns
            .iter()
            .map(|c| {
                let q = self.quote_ident(c);
                format!("{q} = EXCLUDED.{q}")
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("ON CONFLICT ({conflict_cols}) DO UPDATE SET {sets}")
    }

    fn sql_type(&self, target_type: TargetType) -> &'static str {
        match target_type {
            TargetType::Integer => "BIGINT",
            TargetType::Decimal => "NUMERIC",
            TargetType::TextBounded => "VARCHAR",
            TargetType::Timestamp => "TIMESTAMP WITH TIME ZONE",
            TargetType::Boolean => "BOOLEAN",
            TargetType::Binary => "BYTEA",
        }
    }

    fn truncate_statement(&self, schema: &str, table: &str) -> String {
        format!(
            "TRUNCATE TABLE {}.{}",
            self.quote_ident(schema),
            self.quote_ident(table)
        )
    }
}

/// Whether a load mode ever needs an upsert clause, used by the Chunk
/// Processor to decide whether to build one (spec §4.7).
pub fn load_mode_needs_upsert(mode: LoadMode) -> bool {
    matches!(mode, LoadMode::Upsert)
}
