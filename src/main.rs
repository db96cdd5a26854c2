use anyhow::Result;
use axum::Router;
use object_gateway::{
    backend::{MemoryBackend, ObjectBackend, S3Backend},
    config::{AppConfig, BackendKind},
    db, routes,
    services::{gateway_service::GatewayService, upload_sweeper::spawn_upload_sweeper},
};
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting object-gateway with config: {:?}", cfg);

    // --- Initialize SQLite ledger ---
    tracing::debug!("Connecting using raw URL => {}", cfg.database_url);
    let db = Arc::new(db::connect(&cfg.database_url).await?);
    db::run_migrations(&db).await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Storage backend ---
    let backend: Arc<dyn ObjectBackend> = match cfg.backend {
        BackendKind::S3 => Arc::new(S3Backend::new(&cfg.s3).await),
        BackendKind::Memory => {
            tracing::warn!("Using the in-memory backend; objects are lost on exit");
            Arc::new(MemoryBackend::new(cfg.s3.bucket.clone()))
        }
    };

    // --- Initialize core service ---
    let service = GatewayService::new(backend, db.clone(), cfg.gateway_settings());
    let restored = service.restore_uploads().await?;
    if restored > 0 {
        tracing::info!("Restored {} multipart uploads from the ledger", restored);
    }

    let shutdown = CancellationToken::new();
    let sweeper = spawn_upload_sweeper(
        service.clone(),
        cfg.sweep_interval,
        cfg.session_ttl,
        shutdown.clone(),
    );

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.max_payload_bytes).with_state(service);

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
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    sweeper.await?;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolve on Ctrl-C, cancelling `token` so background tasks stop too.
async fn shutdown_signal(token: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", err);
        token.cancelled().await;
        return;
    }
    tracing::info!("Ctrl-C received, shutting down");
    token.cancel();
}
