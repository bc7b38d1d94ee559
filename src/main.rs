use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use dotenv::dotenv;
use log::{error, info};

use etl_orchestrator_core::config::{DatabaseConnectionConfig, OrchestratorConfig};
use etl_orchestrator_core::connection_pool::ConnectionPoolManager;
use etl_orchestrator_core::dialect::{Dialect, Postgres};
use etl_orchestrator_core::dispatcher::Dispatcher;
use etl_orchestrator_core::error::{OrchestratorError, OrchestratorResult};
use etl_orchestrator_core::metadata_store::MetadataStoreGateway;
use etl_orchestrator_core::schedule::ScheduleEvaluator;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    dotenv().ok();

    info!("starting ETL orchestrator core");

    if let Err(e) = run_orchestrator().await {
        error!("orchestrator exited with error: {e}");
        return Err(Box::new(e));
    }

    Ok(())
}

/// Process wiring: load config, connect the metadata store, register source/
/// target connection pools, then run the dispatcher and schedule evaluator
/// loops concurrently. Grounded on `main.rs::run_etl_process`'s
/// env_logger/dotenv-then-connect-then-run shape, generalized from one
/// fixed extract/transform/load call into the two standing loops spec §2
/// describes ("a Dispatcher loop... the Schedule Evaluator inserts rows
/// into the queue").
async fn run_orchestrator() -> OrchestratorResult<()> {
    let config = OrchestratorConfig::from_env()?;

    let metadata_url = env::var("DATABASE_URL")
        .or_else(|_| env::var("METADATA_DATABASE_URL"))
        .map_err(|_| OrchestratorError::other("DATABASE_URL or METADATA_DATABASE_URL must be set"))?;
    let metadata_conn = DatabaseConnectionConfig::from_url(&metadata_url)?;
    let store = MetadataStoreGateway::connect(&metadata_conn, config.metadata_schema.clone()).await?;
    store.ensure_schema().await?;

    let registry = load_connection_registry()?;
    let pools = Arc::new(ConnectionPoolManager::new(registry));
    let dialect: Arc<dyn Dialect> = Arc::new(Postgres);

    let tz: Tz = config
        .timezone
        .parse()
        .map_err(|_| OrchestratorError::other(format!("unrecognized timezone '{}'", config.timezone)))?;

    let owner = format!("orchestrator-{}", std::process::id());
    let dispatcher = Dispatcher::new(&store, Arc::clone(&pools), Arc::clone(&dialect), &config, owner);
    let schedule_evaluator = ScheduleEvaluator::new(&store, tz);

    let dispatcher_loop = dispatcher.run_forever(config.max_workers as i64, Duration::from_secs(2));
    let schedule_loop = schedule_tick_loop(&schedule_evaluator, Duration::from_secs(config.schedule_tick_s));

    tokio::join!(dispatcher_loop, schedule_loop);
    Ok(())
}

async fn schedule_tick_loop(evaluator: &ScheduleEvaluator<'_>, interval: Duration) {
    loop {
        match evaluator.tick().await {
            Ok(n) if n > 0 => info!("schedule tick enqueued {n} request(s)"),
            Ok(_) => {}
            Err(e) => error!("schedule tick failed: {e}"),
        }
        tokio::time::sleep(interval).await;
    }
}

/// Every `ORCH_CONN_<REF>` environment variable registers a connection-ref
/// pointing at a Postgres URL, mirroring `NeonConfig::from_env`'s
/// single-connection env-var read but generalized to the named multi-pool
/// registry spec §4.8 requires.
fn load_connection_registry() -> OrchestratorResult<HashMap<String, DatabaseConnectionConfig>> {
    let mut registry = HashMap::new();
    for (key, value) in env::vars() {
        if let Some(connection_ref) = key.strip_prefix("ORCH_CONN_") {
            let config = DatabaseConnectionConfig::from_url(&value)?;
            registry.insert(connection_ref.to_lowercase(), config);
        }
    }
    Ok(registry)
}
