use anyhow::Result;
use axum::Router;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod database;
mod errors;
mod extractors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;

use services::{
    accession_service::AccessionService,
    archive::ArchiveOptions,
    content_store::ContentStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!(
        "Starting accession portal: addr={} media_root={} database_url={} time_zone={} chunk_size={} staff_token={}",
        cfg.addr(),
        cfg.media_root,
        cfg.database_url,
        cfg.time_zone,
        cfg.chunk_size,
        if cfg.staff_token.is_some() { "set" } else { "unset" }
    );

    // --- Ensure media directory exists ---
    if !Path::new(&cfg.media_root).exists() {
        fs::create_dir_all(&cfg.media_root)?;
        tracing::info!("Created media directory at {}", cfg.media_root);
    }

    // --- Initialize SQLite connection ---
    let db = Arc::new(database::connect(&cfg.database_url).await?);

    // --- Handle migration mode ---
    if migrate {
        database::run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    if cfg.staff_token.is_none() {
        tracing::warn!("PORTAL_STAFF_TOKEN is not set; staff routes will redirect to login");
    }

    // --- Initialize core service ---
    let options = ArchiveOptions {
        chunk_size: cfg.chunk_size,
        time_zone: cfg.time_zone,
        ..ArchiveOptions::default()
    };
    let accessions = AccessionService::new(db, ContentStore::new(&cfg.media_root), options);
    let state = state::AppState::new(accessions, cfg.staff_token.clone());

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(state);

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
