use backup_service::config::AppConfig;
use backup_service::db::connection::create_pool;
use backup_service::db::migrate::migrate;
use backup_service::routes;
use backup_service::services::backup_engine::BackupService;
use backup_service::services::command_runner::{ProcessRunner, SystemUsers};
use backup_service::services::concurrency::WorkerGate;
use backup_service::services::secrets::AesGcmCodec;
use backup_service::state::AppState;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .init();

    tracing::info!("Starting backup service on port {}", config.port);

    std::fs::create_dir_all(&config.data_dir)?;

    // Initialize database
    let db_path = config.db_path.to_string_lossy().to_string();
    let pool = create_pool(&db_path)?;
    migrate(&pool)?;

    let codec = AesGcmCodec::from_passphrase(&config.secret_key)?;
    let backups = Arc::new(BackupService::new(
        pool,
        Arc::new(codec),
        Arc::new(ProcessRunner),
        Arc::new(SystemUsers),
        WorkerGate::new(config.max_workers),
    ));

    let cancel = CancellationToken::new();
    backups.start(cancel.clone());

    let state = Arc::new(AppState::new(config.clone(), backups.clone()));
    let app = routes::create_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    tracing::info!("Shutting down...");
    cancel.cancel();
    backups.shutdown().await;
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }

    cancel.cancel();
}
