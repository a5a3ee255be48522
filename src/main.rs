use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use oj_exec::config::CliArgs;
use oj_exec::database::{self as db, SqliteSubmissionStore};
use oj_exec::service::ExecutionService;
use oj_exec::store::{ConfigProblemProvider, SubmissionStore};
use oj_exec::web_server::build_server;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let config = cli.to_config().context("Failed to load configuration")?;

    let db_path = db::get_db_path()?;
    if cli.flush_data {
        db::remove_db(&db_path);
    }

    let db_pool = db::init_db(&db_path)
        .await
        .context("Failed to initialize database")?;

    let store: Arc<dyn SubmissionStore> = Arc::new(SqliteSubmissionStore::new(db_pool));
    let problems = Arc::new(ConfigProblemProvider::new(&config));
    let service = Arc::new(ExecutionService::start(
        &config,
        problems,
        store.clone(),
    )?);

    // ======= PREPARATION END, EXECUTION START =======

    let server = build_server(config.server.clone(), service.clone(), store)
        .context("Failed to build server")?;

    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
        Some(res_worker) = service.join_next_worker() => {
            log::error!("A worker terminated unexpectedly: {:?}", res_worker);
        }
    }

    // 1. Stop accepting requests
    server_handle.stop(true).await;

    // 2. Drain the queue, then stop the workers
    service
        .shutdown(Duration::from(config.execution.shutdown_grace))
        .await;

    log::info!("Shutdown complete");
    Ok(())
}
