use anyhow::{Context, Result};
use chunk_share::{
    config::AppConfig,
    db,
    routes::routes::build_app,
    services::{
        block_store::{LocalBlockStore, UrlSigner},
        expiry_worker::ExpiryWorker,
        file_upload_repository::FileUploadRepository,
        metadata_repository::MetadataRepository,
        notifier::SqliteNotifier,
        upload_coordinator::CoordinatorSettings,
    },
    state::AppState,
};
use std::{io::ErrorKind, path::Path, sync::Arc, time::Duration};
use tokio::{fs, net::TcpListener};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;
    tracing::info!(
        "Starting chunk-share on {} (container `{}`, storage {})",
        cfg.addr(),
        cfg.container_name,
        cfg.storage_dir
    );

    // --- Initialize SQLite connection ---
    let db = db::connect(&cfg.database_url).await?;

    // --- Handle migration mode ---
    if migrate {
        db::run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)
            .await
            .with_context(|| format!("creating storage directory {}", cfg.storage_dir))?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize core services ---
    let store = Arc::new(LocalBlockStore::new(
        &cfg.storage_dir,
        UrlSigner::new(&cfg.public_url, &cfg.signing_key),
    ));
    let mut settings = CoordinatorSettings::new(&cfg.container_name);
    settings.lock_stale_after = chrono::Duration::seconds(cfg.lock_stale_secs as i64);
    let state = AppState::new(db.clone(), store.clone(), settings);

    ExpiryWorker::new(
        SqliteNotifier::new(db.clone()),
        MetadataRepository::new(db.clone()),
        FileUploadRepository::new(db.clone()),
        store,
        &cfg.container_name,
        Duration::from_secs(cfg.notifier_poll_secs.max(1)),
    )
    .spawn();

    // --- Build router ---
    let app = build_app(state, cfg.max_chunk_bytes);

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
    axum::serve(listener, app).await?;

    Ok(())
}
