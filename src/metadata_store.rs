//! Metadata Store Gateway (spec §4, §6.1).
//!
//! Typed access to the request queue, run log, checkpoint column, schedule
//! rows, and mapping definitions, hiding dialect differences behind
//! `Dialect`. Grounded directly on `postgres_service.rs::NeonConnection`'s
//! `query`/`query_one`/`query_opt`/`execute`/`execute_batch` wrappers and
//! its `create_etl_progress_table`-style schema bootstrap, generalized from
//! one bespoke ETL-progress table to the full §6.1 schema.
//!
//! No global mutable state: the schema prefix that used to be an ambient
//! environment-variable read (Design Notes §9) is instead a field on this
//! struct, supplied once at construction via `OrchestratorConfig`.

use std::sync::Arc;

use deadpool_postgres::{Config as PoolConfig, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;
use tokio_postgres_rustls::MakeRustlsConnect;

use crate::config::DatabaseConnectionConfig;
use crate::dialect::{Dialect, Postgres};
use crate::error::{OrchestratorError, OrchestratorResult};

/// Cheap to clone: `Pool` and the `Dialect` trait object are both
/// `Arc`-backed internally, and the schema prefix is a short `String`. Used
/// by sinks and other callbacks that must outlive the borrow of whoever
/// constructed them (e.g. `RunLogProgressSink`, stored behind `Arc<dyn
/// ProgressSink>`, which by default requires `'static`).
#[derive(Clone)]
pub struct MetadataStoreGateway {
    pool: Pool,
    schema: String,
    dialect: Arc<dyn Dialect>,
}

impl MetadataStoreGateway {
    /// Build a gateway from a connection config, the same TLS/pool wiring
    /// shape as `NeonConnection::with_config`.
    pub async fn connect(conn: &DatabaseConnectionConfig, schema: impl Into<String>) -> OrchestratorResult<Self> {
        let mut pool_config = PoolConfig::new();
        pool_config.host = Some(conn.host.clone());
        pool_config.port = Some(conn.port);
        pool_config.dbname = Some(conn.database.clone());
        pool_config.user = Some(conn.username.clone());
        pool_config.password = Some(conn.password.clone());
        pool_config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let tls = MakeRustlsConnect::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(rustls::RootCertStore::from_iter(
                    webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
                ))
                .with_no_client_auth(),
        );

        let pool = pool_config.create_pool(Some(Runtime::Tokio1), tls)?;

        Ok(Self {
            pool,
            schema: schema.into(),
            dialect: Arc::new(Postgres),
        })
    }

    pub fn from_pool(pool: Pool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
            dialect: Arc::new(Postgres),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.dialect.as_ref()
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", self.dialect.quote_ident(&self.schema), self.dialect.quote_ident(table))
    }

    pub async fn get_client(&self) -> OrchestratorResult<deadpool_postgres::Client> {
        Ok(self.pool.get().await?)
    }

    pub async fn query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> OrchestratorResult<Vec<Row>> {
        let client = self.get_client().await?;
        Ok(client.query(sql, params).await?)
    }

    pub async fn query_one(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> OrchestratorResult<Row> {
        let client = self.get_client().await?;
        Ok(client.query_one(sql, params).await?)
    }

    pub async fn query_opt(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> OrchestratorResult<Option<Row>> {
        let client = self.get_client().await?;
        Ok(client.query_opt(sql, params).await?)
    }

    pub async fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> OrchestratorResult<u64> {
        let client = self.get_client().await?;
        Ok(client.execute(sql, params).await?)
    }

    /// Create every table named in spec §6.1 if absent, schema-qualified.
    /// Mirrors `create_etl_progress_table`'s `CREATE TABLE IF NOT EXISTS`
    /// plus index-creation shape, generalized to the full schema.
    pub async fn ensure_schema(&self) -> OrchestratorResult<()> {
        let schema_ident = self.dialect.quote_ident(&self.schema);
        self.execute(&format!("CREATE SCHEMA IF NOT EXISTS {schema_ident}"), &[])
            .await?;

        self.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    request_id UUID PRIMARY KEY,
                    mapping_ref VARCHAR(200) NOT NULL,
                    status VARCHAR(20) NOT NULL DEFAULT 'NEW',
                    claim_owner VARCHAR(200),
                    claim_deadline TIMESTAMP WITH TIME ZONE,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    started_at TIMESTAMP WITH TIME ZONE,
                    finished_at TIMESTAMP WITH TIME ZONE,
                    parameters_json JSONB NOT NULL DEFAULT '{{}}'::jsonb
                )",
                self.qualified("request_queue")
            ),
            &[],
        )
        .await?;
        self.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_request_queue_status_created ON {} (status, created_at)",
                self.qualified("request_queue")
            ),
            &[],
        )
        .await?;

        self.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    run_id UUID PRIMARY KEY,
                    request_id UUID NOT NULL,
                    mapping_ref VARCHAR(200) NOT NULL,
                    status VARCHAR(20) NOT NULL DEFAULT 'IN_PROGRESS',
                    rows_read BIGINT NOT NULL DEFAULT 0,
                    rows_succeeded BIGINT NOT NULL DEFAULT 0,
                    rows_failed BIGINT NOT NULL DEFAULT 0,
                    row_errors_truncated BOOLEAN NOT NULL DEFAULT FALSE,
                    started_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    ended_at TIMESTAMP WITH TIME ZONE,
                    checkpoint_value TEXT
                )",
                self.qualified("run_log")
            ),
            &[],
        )
        .await?;
        self.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_run_log_mapping_status_started ON {} (mapping_ref, status, started_at DESC)",
                self.qualified("run_log")
            ),
            &[],
        )
        .await?;

        self.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    err_id UUID PRIMARY KEY,
                    run_id UUID NOT NULL,
                    row_ordinal BIGINT NOT NULL,
                    error_code VARCHAR(64) NOT NULL,
                    error_message TEXT NOT NULL,
                    row_data_json JSONB
                )",
                self.qualified("row_error")
            ),
            &[],
        )
        .await?;

        self.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    schedule_id UUID PRIMARY KEY,
                    mapping_ref VARCHAR(200) NOT NULL,
                    frequency VARCHAR(20) NOT NULL,
                    time_param VARCHAR(20) NOT NULL,
                    start_date TIMESTAMP WITH TIME ZONE NOT NULL,
                    end_date TIMESTAMP WITH TIME ZONE,
                    next_run_at TIMESTAMP WITH TIME ZONE NOT NULL,
                    last_run_at TIMESTAMP WITH TIME ZONE,
                    status VARCHAR(20) NOT NULL DEFAULT 'ACTIVE'
                )",
                self.qualified("schedule")
            ),
            &[],
        )
        .await?;
        self.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_schedule_status_next_run ON {} (status, next_run_at)",
                self.qualified("schedule")
            ),
            &[],
        )
        .await?;

        self.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    mapping_ref VARCHAR(200) PRIMARY KEY,
                    source_connection_ref VARCHAR(200) NOT NULL,
                    source_query TEXT NOT NULL,
                    target_connection_ref VARCHAR(200) NOT NULL,
                    target_schema VARCHAR(200) NOT NULL,
                    target_table VARCHAR(200) NOT NULL,
                    load_mode_default VARCHAR(20) NOT NULL DEFAULT 'INSERT',
                    batch_size BIGINT NOT NULL DEFAULT 1000,
                    truncate_flag BOOLEAN NOT NULL DEFAULT FALSE,
                    checkpoint_strategy VARCHAR(20) NOT NULL DEFAULT 'AUTO',
                    checkpoint_column VARCHAR(200),
                    checkpoint_enabled BOOLEAN NOT NULL DEFAULT TRUE
                )",
                self.qualified("mapping_def")
            ),
            &[],
        )
        .await?;

        self.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    mapping_ref VARCHAR(200) NOT NULL REFERENCES {} (mapping_ref),
                    source_column VARCHAR(200),
                    target_column VARCHAR(200) NOT NULL,
                    target_type VARCHAR(20) NOT NULL,
                    key_flag BOOLEAN NOT NULL DEFAULT FALSE,
                    key_sequence INTEGER,
                    derivation_expression TEXT,
                    required_flag BOOLEAN NOT NULL DEFAULT FALSE,
                    audit_role VARCHAR(20),
                    execution_sequence INTEGER NOT NULL,
                    PRIMARY KEY (mapping_ref, target_column)
                )",
                self.qualified("column_mapping"),
                self.qualified("mapping_def")
            ),
            &[],
        )
        .await?;

        Ok(())
    }
}
