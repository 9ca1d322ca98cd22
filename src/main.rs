use anyhow::{Context, Result};
use chrono::{Days, Utc};
use config::{AppConfig, RunMode};
use services::{
    bandwidth_accountant::{BandwidthAccountant, DirLogSource},
    blob_store::{BlobStore, DiskBlobStore},
    lifecycle_worker::{LifecyclePolicy, LifecycleWorker},
    metadata_store::MetadataStore,
    upload_service::UploadLimits,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{
    io::ErrorKind, net::SocketAddr, path::Path, process::ExitCode, str::FromStr, sync::Arc,
    time::Duration,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod middleware;
mod models;
mod routes;
mod services;
mod state;

/// How often idle rate-limit buckets are swept, and how idle they must be.
const SWEEP_EVERY: Duration = Duration::from_secs(5 * 60);
const SWEEP_IDLE: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = config::AppConfig::from_env_and_args()?;
    tracing::info!("Starting image-vault ({:?}) with config: {:?}", mode, cfg);

    // --- Ensure blob directory exists ---
    if !Path::new(&cfg.blob_dir).exists() {
        std::fs::create_dir_all(&cfg.blob_dir)?;
        tracing::info!("Created blob directory at {}", cfg.blob_dir);
    }

    // --- Initialize SQLite connection ---
    let connect = SqliteConnectOptions::from_str(&cfg.database_url)
        .with_context(|| format!("parsing database URL `{}`", cfg.database_url))?
        .create_if_missing(true);
    if let Some(parent) = connect.get_filename().parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect)
            .await
            .context("connecting to SQLite")?,
    );
    let metadata = MetadataStore::new(db);
    let blobs: Arc<dyn BlobStore> = Arc::new(DiskBlobStore::new(&cfg.blob_dir));

    match mode {
        RunMode::Migrate => {
            metadata.migrate().await?;
            tracing::info!("Database migration complete.");
            Ok(ExitCode::SUCCESS)
        }
        RunMode::Serve => serve(&cfg, metadata, blobs).await,
        RunMode::Cleanup { dry_run } => cleanup(&cfg, metadata, blobs, dry_run).await,
        RunMode::Bandwidth { date } => {
            let day = match date {
                Some(day) => day,
                None => Utc::now()
                    .date_naive()
                    .checked_sub_days(Days::new(2))
                    .context("computing default bandwidth day")?,
            };
            let logs = Arc::new(DirLogSource::new(&cfg.log_dir, &cfg.log_prefix));
            let report = BandwidthAccountant::new(metadata, logs).process(day).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.has_failures() {
                tracing::error!(
                    hits_failed = report.hits_failed,
                    records_failed = report.records_failed,
                    "bandwidth accounting finished with failures"
                );
                return Ok(ExitCode::FAILURE);
            }
            Ok(ExitCode::SUCCESS)
        }
        RunMode::SetPlan { api_key, plan } => {
            let account = metadata
                .find_account_by_key(&api_key)
                .await?
                .context("no account with that API key")?;
            metadata.update_plan(account.id, plan).await?;
            tracing::info!(account = %account.id, from = account.plan.as_str(), to = plan.as_str(), "plan changed");
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn serve(
    cfg: &AppConfig,
    metadata: MetadataStore,
    blobs: Arc<dyn BlobStore>,
) -> Result<ExitCode> {
    let limits = UploadLimits {
        max_file_bytes_trial: cfg.max_file_bytes_trial,
        max_file_bytes_paid: cfg.max_file_bytes_paid,
    };
    let state = state::AppState::new(metadata, blobs, &cfg.base_url, limits);

    // --- Background sweep of idle rate-limit buckets ---
    let shutdown = CancellationToken::new();
    let sweeper = {
        let limiters = [state.account_limiter.clone(), state.ip_limiter.clone()];
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_EVERY);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed: usize = limiters.iter().map(|l| l.sweep(SWEEP_IDLE)).sum();
                        if removed > 0 {
                            tracing::debug!(removed, "swept idle rate-limit buckets");
                        }
                    }
                }
            }
        })
    };

    // --- Build router ---
    let app = routes::routes::routes(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown({
        let shutdown = shutdown.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        }
    })
    .await?;

    shutdown.cancel();
    let _ = sweeper.await;
    Ok(ExitCode::SUCCESS)
}

async fn cleanup(
    cfg: &AppConfig,
    metadata: MetadataStore,
    blobs: Arc<dyn BlobStore>,
    dry_run: bool,
) -> Result<ExitCode> {
    let policy = LifecyclePolicy::from_days(cfg.trial_retention_days, cfg.purge_after_days);
    let worker = LifecycleWorker::new(metadata, blobs, policy);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted; stopping after the current object");
                cancel.cancel();
            }
        }
    });

    let report = worker.run(dry_run, &cancel).await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    match report.error() {
        Some(err) => {
            tracing::error!(error = %err, "lifecycle pass finished with failures");
            Ok(ExitCode::FAILURE)
        }
        None => Ok(ExitCode::SUCCESS),
    }
}
