use std::process::ExitCode;
use std::sync::Arc;

use tokio::sync::mpsc;

use thyme::config::Config;
use thyme::db::HealthDb;
use thyme::scan;
use thyme::scheduler::{JobId, JobRequest, Scheduler};
use thyme::server;
use thyme::weekly;

/// Executor queue depth; one in-flight run plus a small backlog.
const JOB_CHANNEL_SIZE: usize = 4;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            log::error!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Open once at startup so migrations run (and fail) before anything is
    // scheduled.
    if let Err(e) = HealthDb::open(&config.database_path) {
        log::error!("Database open failed: {}", e);
        return ExitCode::FAILURE;
    }

    for job in [JobId::Scan, JobId::Weekly] {
        match thyme::scheduler::next_run_time(job) {
            Ok(next) => log::info!("Next {} run: {}", job.name(), next),
            Err(e) => log::warn!("Could not compute next {} run: {}", job.name(), e),
        }
    }

    let (sender, receiver) = mpsc::channel::<JobRequest>(JOB_CHANNEL_SIZE);

    let scheduler = Scheduler::new(sender.clone());
    let scheduler_handle = tokio::spawn(async move { scheduler.run().await });

    let executor_config = Arc::clone(&config);

    // `run_executor` holds a `HealthDb` (backed by a non-`Sync` rusqlite
    // connection) across await points, so it can't be moved onto its own
    // spawned task. Race it against the HTTP surface on the current task
    // instead; either way it's dropped (cancelled) once the other side ends.
    tokio::select! {
        server_result = server::run(Arc::clone(&config), sender) => {
            if let Err(e) = server_result {
                log::error!("HTTP surface failed: {}", e);
            }
        }
        _ = run_executor(executor_config, receiver) => {}
    }

    scheduler_handle.abort();
    ExitCode::FAILURE
}

/// Drain the job channel, running one orchestrator at a time.
async fn run_executor(config: Arc<Config>, mut receiver: mpsc::Receiver<JobRequest>) {
    while let Some(request) = receiver.recv().await {
        log::info!(
            "Executing {} job (trigger: {:?})",
            request.job.name(),
            request.trigger
        );

        let db = match HealthDb::open(&config.database_path) {
            Ok(db) => db,
            Err(e) => {
                log::error!("Database open failed for {} job: {}", request.job.name(), e);
                continue;
            }
        };

        match request.job {
            JobId::Scan => {
                let report = scan::run_scan(&config, &db).await;
                match serde_json::to_string(&report) {
                    Ok(rendered) => log::info!("Scan report: {}", rendered),
                    Err(_) => log::info!("Scan report: {:?}", report),
                }
            }
            JobId::Weekly => {
                let report = weekly::run_weekly(&config, &db).await;
                match serde_json::to_string(&report) {
                    Ok(rendered) => log::info!("Weekly report: {}", rendered),
                    Err(_) => log::info!("Weekly report: {:?}", report),
                }
            }
        }

        let key = format!("last_{}_run_at", request.job.name());
        if let Err(e) = db.set_config_value(&key, &chrono::Utc::now().to_rfc3339()) {
            log::warn!("Failed to record {}: {}", key, e);
        }
    }
}
