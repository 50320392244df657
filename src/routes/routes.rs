//! Defines routes for the accession portal.
//!
//! ## Structure
//! - **Probes**
//!   - `GET /healthz`: liveness
//!   - `GET /readyz` : SQLite and media-root checks
//!
//! - **Public**
//!   - `GET /stats`: accession and file counts
//!
//! - **Staff**
//!   - `GET /admin/accessions/{id}/zip`: stream all files of an accession
//!     plus `metadata.txt` as a ZIP archive

use crate::{
    handlers::{
        accession_handlers::{download_archive, stats},
        health_handlers::{healthz, readyz},
    },
    state::AppState,
};
use axum::{Router, routing::get};

/// Build and return the router for every portal route.
///
/// The router carries shared state (`AppState`) to all handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/stats", get(stats))
        .route("/admin/accessions/{id}/zip", get(download_archive))
}
