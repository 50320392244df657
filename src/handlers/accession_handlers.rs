//! HTTP handlers for accession downloads and the public counters.
//! Archive bodies are streamed straight from the assembler; nothing is
//! buffered beyond the chunk in flight.

use crate::{errors::AppError, extractors::auth::StaffUser, state::AppState};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;

/// GET `/admin/accessions/{id}/zip` returns every file of the accession plus
/// `metadata.txt`, as a streamed ZIP.
///
/// Missing accessions and accessions without files are answered with 404
/// before streaming starts. Failures after that can only cut the body short.
pub async fn download_archive(
    _staff: StaffUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, AppError> {
    let archive = state.accessions.prepare_archive(id).await?;
    let stream = archive.inspect(move |chunk| {
        if let Err(err) = chunk {
            tracing::warn!("archive for accession {} aborted: {}", id, err);
        }
    });

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = StatusCode::OK;
    set_archive_headers(response.headers_mut(), id);
    Ok(response)
}

/// GET `/stats` returns the number of accessions and files.
pub async fn stats(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let counts = state.accessions.counts().await?;
    Ok(Json(counts))
}

fn set_archive_headers(headers: &mut HeaderMap, id: i64) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/zip"),
    );

    let disposition = format!("attachment; filename={}.zip", id);
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
}
