//! SAGAD
//!
//! Daemon wiring for the sagakit engine: configuration, logging, database
//! setup, the outbox worker pool, the acceptance API and the admin
//! commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use sagakit::registry::SagaRegistry;
use sagakit::repository::SagaRepository;
use sagakit::transfer::{transfer_driver, TransferData, TRANSFER_DATA_TYPE};
use sagakit::OutboxWorker;
use sagakit_common::database::{DynSagaDatabase, SagasDatabase};
use sagakit_common::Amount;
use sagakit_sqlite::SagaSqliteDatabase;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

pub mod cli;
pub mod config;
pub mod routes;

use crate::cli::CLIArgs;
use crate::config::Settings;

/// Resolves (and creates if needed) the work directory.
pub async fn get_work_directory(args: &CLIArgs) -> Result<PathBuf> {
    let work_dir = match &args.work_dir {
        Some(work_dir) => work_dir.clone(),
        None => home::home_dir()
            .ok_or_else(|| anyhow!("Could not resolve the home directory"))?
            .join(".sagakit"),
    };
    tokio::fs::create_dir_all(&work_dir).await?;
    Ok(work_dir)
}

/// Installs the tracing subscriber. `filter` overrides `RUST_LOG`.
pub fn setup_tracing(filter: Option<&str>) {
    let env_filter = match filter {
        Some(filter) => EnvFilter::new(filter),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,sagad=debug,sagakit=debug")),
    };

    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

async fn open_database(work_dir: &Path, settings: &Settings) -> Result<DynSagaDatabase> {
    let path = settings.database.resolved_path(work_dir);
    let path = path
        .to_str()
        .ok_or_else(|| anyhow!("Database path is not valid UTF-8"))?;
    let db = SagaSqliteDatabase::new(path).await?;
    Ok(Arc::new(db))
}

fn build_registry(db: DynSagaDatabase, settings: &Settings) -> SagaRegistry {
    let mut registry = SagaRegistry::new(db.clone());
    registry.register(Arc::new(transfer_driver(
        db,
        settings.engine.overdraft(),
        settings.engine.step_lease(),
    )));
    registry
}

/// Runs the worker pool and the acceptance API until ctrl-c.
pub async fn run_start(work_dir: PathBuf, settings: Settings) -> Result<()> {
    let db = open_database(&work_dir, &settings).await?;
    let registry = Arc::new(build_registry(db.clone(), &settings));
    let repository = SagaRepository::new(db.clone());

    let shutdown = CancellationToken::new();
    let mut worker_handles = Vec::with_capacity(settings.engine.workers);
    for _ in 0..settings.engine.workers {
        let worker = OutboxWorker::new(
            db.clone(),
            registry.clone(),
            settings.engine.worker_config(),
        );
        worker_handles.push(tokio::spawn(worker.run(shutdown.clone())));
    }

    let state = routes::ApiState {
        repository,
        registry: registry.clone(),
    };
    let router = routes::create_router(state);

    let addr = format!("{}:{}", settings.info.listen_host, settings.info.listen_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Acceptance API listening on {}", addr);

    let shutdown_signal = {
        let shutdown = shutdown.clone();
        async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for the shutdown signal: {}", err);
            }
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        }
    };

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    for handle in worker_handles {
        if let Err(err) = handle.await {
            tracing::warn!("Worker task ended abnormally: {}", err);
        }
    }

    tracing::info!("sagad stopped");
    Ok(())
}

/// Accepts a new transfer saga and prints its id. The saga is picked up by
/// a running `sagad start` instance.
pub async fn run_create_transfer(
    work_dir: PathBuf,
    settings: Settings,
    from: String,
    to: String,
    amount: i64,
) -> Result<()> {
    let db = open_database(&work_dir, &settings).await?;
    let repository = SagaRepository::new(db);

    let saga_id = Uuid::new_v4();
    let data = TransferData {
        saga_id,
        from_user_id: from,
        to_user_id: to,
        amount: Amount::from(amount),
    };
    repository
        .create_saga(saga_id, &data, TRANSFER_DATA_TYPE)
        .await?;

    println!("{saga_id}");
    Ok(())
}

/// Drives one saga inline, regardless of outbox state. Useful for sagas
/// stuck behind a poisoned message or an operator investigation.
pub async fn run_resume(work_dir: PathBuf, settings: Settings, saga_id: Uuid) -> Result<()> {
    let db = open_database(&work_dir, &settings).await?;
    let registry = build_registry(db.clone(), &settings);

    registry.drive(saga_id, &CancellationToken::new()).await?;

    let snapshot = db
        .get_saga(&saga_id)
        .await?
        .ok_or_else(|| anyhow!("Saga {saga_id} not found"))?;
    println!("{} {}", snapshot.id, snapshot.state);
    Ok(())
}
