mod common;

use std::collections::HashMap;
use std::sync::Arc;

use etl_orchestrator_core::config::{DatabaseConnectionConfig, OrchestratorConfig};
use etl_orchestrator_core::connection_pool::ConnectionPoolManager;
use etl_orchestrator_core::dialect::{Dialect, Postgres};
use etl_orchestrator_core::executor::{CancelSignal, ParallelExecutor, RunOutcome};
use etl_orchestrator_core::mapping::{CheckpointStrategy, ColumnMapping, LoadMode, MappingDefinition, TargetType};
use uuid::Uuid;

async fn seed_source_and_target(store: &etl_orchestrator_core::MetadataStoreGateway, rows: i64) {
    store
        .execute("DROP TABLE IF EXISTS exec_test_source", &[])
        .await
        .unwrap();
    store
        .execute(
            "CREATE TABLE exec_test_source (id BIGINT PRIMARY KEY, payload TEXT NOT NULL)",
            &[],
        )
        .await
        .unwrap();
    store
        .execute(
            "INSERT INTO exec_test_source SELECT g, 'row-' || g FROM generate_series(1, $1) AS g",
            &[&rows],
        )
        .await
        .unwrap();

    store
        .execute("DROP TABLE IF EXISTS exec_test_target", &[])
        .await
        .unwrap();
    store
        .execute(
            "CREATE TABLE exec_test_target (id BIGINT PRIMARY KEY, payload TEXT NOT NULL)",
            &[],
        )
        .await
        .unwrap();
}

async fn insert_run_log_row(store: &etl_orchestrator_core::MetadataStoreGateway, run_id: Uuid, mapping_ref: &str) {
    let table = format!(
        "{}.{}",
        store.dialect().quote_ident(store.schema()),
        store.dialect().quote_ident("run_log")
    );
    store
        .execute(
            &format!("INSERT INTO {table} (run_id, request_id, mapping_ref, status) VALUES ($1, $2, $3, 'IN_PROGRESS')"),
            &[&run_id, &Uuid::new_v4(), &mapping_ref],
        )
        .await
        .unwrap();
}

fn demo_mapping() -> MappingDefinition {
    MappingDefinition {
        mapping_reference: "exec.demo".to_string(),
        source_connection_ref: "default".to_string(),
        source_query: "SELECT id, payload FROM exec_test_source ORDER BY id".to_string(),
        target_connection_ref: "default".to_string(),
        target_schema: "public".to_string(),
        target_table: "exec_test_target".to_string(),
        column_list: vec![
            ColumnMapping {
                source_column: Some("id".to_string()),
                target_column: "id".to_string(),
                target_type: TargetType::Integer,
                key_flag: true,
                key_sequence: Some(1),
                derivation_expression: None,
                required_flag: true,
                audit_role: None,
                execution_sequence: 1,
            },
            ColumnMapping {
                source_column: Some("payload".to_string()),
                target_column: "payload".to_string(),
                target_type: TargetType::TextBounded,
                key_flag: false,
                key_sequence: None,
                derivation_expression: None,
                required_flag: true,
                audit_role: None,
                execution_sequence: 2,
            },
        ],
        load_mode_default: LoadMode::Insert,
        checkpoint_strategy: CheckpointStrategy::Key,
        checkpoint_column: Some("id".to_string()),
        batch_size: 10,
        truncate_flag: false,
    }
}

/// Every row placed in the source lands in the target exactly once for a
/// clean run with no transient failures (spec §4.3, §4.7 end to end).
#[tokio::test]
async fn full_run_loads_every_row() {
    let Some(store) = common::connect_test_store("orch_test_exec").await else {
        eprintln!("skipping: no TEST_DATABASE_URL");
        return;
    };
    seed_source_and_target(&store, 25).await;

    let url = std::env::var("TEST_DATABASE_URL").unwrap();
    let conn = DatabaseConnectionConfig::from_url(&url).unwrap();
    let mut registry = HashMap::new();
    registry.insert("default".to_string(), conn);
    let pools = Arc::new(ConnectionPoolManager::new(registry));
    let dialect: Arc<dyn Dialect> = Arc::new(Postgres);
    let config = OrchestratorConfig::default();

    let executor = ParallelExecutor::new(Arc::clone(&pools), &store, Arc::clone(&dialect), &config);
    let mapping = Arc::new(demo_mapping());
    let run_id = Uuid::new_v4();
    insert_run_log_row(&store, run_id, &mapping.mapping_reference).await;
    let summary = executor
        .run(run_id, mapping, LoadMode::Insert, CancelSignal::new())
        .await
        .unwrap();

    assert!(matches!(summary.outcome, RunOutcome::Success));
    assert_eq!(summary.rows_succeeded, 25);
    assert_eq!(summary.rows_failed, 0);

    let count_row = store
        .query_one("SELECT COUNT(*) AS n FROM exec_test_target", &[])
        .await
        .unwrap();
    let n: i64 = count_row.get("n");
    assert_eq!(n, 25);
}

/// A run already marked cancelled before any chunk starts settles as
/// CANCELLED rather than SUCCESS (spec §4.3 cancellation, scenario S5).
#[tokio::test]
async fn pre_cancelled_run_settles_as_cancelled_s5() {
    let Some(store) = common::connect_test_store("orch_test_exec_cancel").await else {
        eprintln!("skipping: no TEST_DATABASE_URL");
        return;
    };
    seed_source_and_target(&store, 25).await;

    let url = std::env::var("TEST_DATABASE_URL").unwrap();
    let conn = DatabaseConnectionConfig::from_url(&url).unwrap();
    let mut registry = HashMap::new();
    registry.insert("default".to_string(), conn);
    let pools = Arc::new(ConnectionPoolManager::new(registry));
    let dialect: Arc<dyn Dialect> = Arc::new(Postgres);
    let config = OrchestratorConfig::default();

    let executor = ParallelExecutor::new(Arc::clone(&pools), &store, Arc::clone(&dialect), &config);
    let mapping = Arc::new(demo_mapping());
    let run_id = Uuid::new_v4();
    insert_run_log_row(&store, run_id, &mapping.mapping_reference).await;

    let cancel = CancelSignal::new();
    cancel.cancel();
    let summary = executor
        .run(run_id, mapping, LoadMode::Insert, cancel)
        .await
        .unwrap();

    assert!(matches!(summary.outcome, RunOutcome::Cancelled));
}

/// A second run against the same mapping resumes from the KEY checkpoint
/// left by the first, instead of reprocessing already-loaded rows (spec §8
/// property 4 "resume correctness").
#[tokio::test]
async fn second_run_resumes_from_key_checkpoint_property_4() {
    let Some(store) = common::connect_test_store("orch_test_exec_resume").await else {
        eprintln!("skipping: no TEST_DATABASE_URL");
        return;
    };
    seed_source_and_target(&store, 10).await;

    let url = std::env::var("TEST_DATABASE_URL").unwrap();
    let conn = DatabaseConnectionConfig::from_url(&url).unwrap();
    let mut registry = HashMap::new();
    registry.insert("default".to_string(), conn);
    let pools = Arc::new(ConnectionPoolManager::new(registry));
    let dialect: Arc<dyn Dialect> = Arc::new(Postgres);
    let config = OrchestratorConfig::default();

    let executor = ParallelExecutor::new(Arc::clone(&pools), &store, Arc::clone(&dialect), &config);
    let mapping = Arc::new(demo_mapping());

    let first_run_id = Uuid::new_v4();
    insert_run_log_row(&store, first_run_id, &mapping.mapping_reference).await;
    let first = executor
        .run(first_run_id, Arc::clone(&mapping), LoadMode::Insert, CancelSignal::new())
        .await
        .unwrap();
    assert_eq!(first.rows_succeeded, 10);

    store
        .execute(
            "INSERT INTO exec_test_source SELECT g, 'row-' || g FROM generate_series(11, 15) AS g",
            &[],
        )
        .await
        .unwrap();

    let second_run_id = Uuid::new_v4();
    insert_run_log_row(&store, second_run_id, &mapping.mapping_reference).await;
    let second = executor
        .run(second_run_id, mapping, LoadMode::Insert, CancelSignal::new())
        .await
        .unwrap();

    // Only the 5 newly appended rows should be picked up on resume.
    assert_eq!(second.rows_succeeded, 5);

    let count_row = store
        .query_one("SELECT COUNT(*) AS n FROM exec_test_target", &[])
        .await
        .unwrap();
    let n: i64 = count_row.get("n");
    assert_eq!(n, 15);
}
