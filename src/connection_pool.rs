//! Connection Pool Manager (spec §4.8).
//!
//! One logical pool per registered database (identified by a
//! connection-reference). Pools are created lazily on first `acquire` and
//! shared-read/serialized-write as described in spec §5. Grounded directly
//! on `postgres_service.rs::NeonConnection::with_config`'s pool/TLS wiring,
//! generalized from one hardcoded Neon connection to a named map of pools.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use deadpool_postgres::{Config as PoolConfig, ManagerConfig, Object, Pool, RecyclingMethod, Runtime};
use tokio::sync::RwLock;
use tokio_postgres_rustls::MakeRustlsConnect;

use crate::config::DatabaseConnectionConfig;
use crate::error::{OrchestratorError, OrchestratorResult};

/// A borrowed connection. Returned to its pool automatically on drop
/// (`deadpool_postgres::Object`'s own `Drop` impl) — "returned via
/// `release(handle)` on all exit paths, including errors" (spec §4.8) is
/// satisfied structurally rather than by a manual release call.
pub type ConnectionHandle = Object;

/// Registry of named connection pools, lazily created, independent even
/// when two connection-refs point at the same physical database (spec
/// §4.8: "Pools are created lazily on first acquire; pools for target and
/// source are independent even when they reference the same physical
/// database").
pub struct ConnectionPoolManager {
    pools: RwLock<HashMap<String, Pool>>,
    registry: HashMap<String, DatabaseConnectionConfig>,
}

impl ConnectionPoolManager {
    pub fn new(registry: HashMap<String, DatabaseConnectionConfig>) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            registry,
        }
    }

    pub fn register(&mut self, connection_ref: impl Into<String>, config: DatabaseConnectionConfig) {
        self.registry.insert(connection_ref.into(), config);
    }

    async fn pool_for(&self, connection_ref: &str) -> OrchestratorResult<Pool> {
        if let Some(pool) = self.pools.read().await.get(connection_ref) {
            return Ok(pool.clone());
        }

        let mut pools = self.pools.write().await;
        if let Some(pool) = pools.get(connection_ref) {
            return Ok(pool.clone());
        }

        let conn = self
            .registry
            .get(connection_ref)
            .ok_or_else(|| OrchestratorError::other(format!("unregistered connection-ref '{connection_ref}'")))?;

        let mut pool_config = PoolConfig::new();
        pool_config.host = Some(conn.host.clone());
        pool_config.port = Some(conn.port);
        pool_config.dbname = Some(conn.database.clone());
        pool_config.user = Some(conn.username.clone());
        pool_config.password = Some(conn.password.clone());
        pool_config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Verified,
        });

        let tls = MakeRustlsConnect::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(rustls::RootCertStore::from_iter(
                    webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
                ))
                .with_no_client_auth(),
        );

        let pool = pool_config.create_pool(Some(Runtime::Tokio1), tls)?;
        pools.insert(connection_ref.to_string(), pool.clone());
        Ok(pool)
    }

    /// Lend a connection from the named pool, blocking up to `timeout` for
    /// a free slot (spec §4.8). The pool's own recycling runs a real test
    /// query against an idle connection before lending it back out
    /// (deadpool-postgres's `RecyclingMethod::Verified`), so a connection
    /// that went stale while idle is caught and replaced instead of handed
    /// to a worker.
    pub async fn acquire(&self, connection_ref: &str, timeout: Duration) -> OrchestratorResult<ConnectionHandle> {
        let pool = self.pool_for(connection_ref).await?;
        let fut = pool.get();
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(OrchestratorError::other(format!(
                "timed out acquiring a connection for '{connection_ref}' after {timeout:?}"
            ))),
        }
    }

    /// Sizing guideline from spec §4.8 (informational only — not enforced
    /// by the pool itself).
    pub fn recommended_pool_size(max_workers: usize, metadata_overhead: usize, buffer: usize) -> usize {
        max_workers * 2 + metadata_overhead + buffer
    }
}

pub type SharedConnectionPoolManager = Arc<ConnectionPoolManager>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recommended_pool_size_matches_spec_formula() {
        assert_eq!(ConnectionPoolManager::recommended_pool_size(8, 2, 5), 23);
    }

    #[tokio::test]
    async fn acquire_on_unregistered_ref_errors() {
        let mgr = ConnectionPoolManager::new(HashMap::new());
        let result = mgr.acquire("does-not-exist", Duration::from_millis(50)).await;
        assert!(result.is_err());
    }
}
