//! src/services/accession_service.rs
//!
//! AccessionService: accession and file records in SQLite, file payloads in
//! the [`ContentStore`], and the download pipeline that ties both to the
//! metadata generator and the streaming archive assembler.

use crate::{
    models::{
        accession::{Accession, AccessionRow, AccessionStatus, NewAccession, UnknownCode},
        file::File,
    },
    services::{
        archive::{ArchiveEntry, ArchiveOptions, ArchiveStream},
        content_store::{ContentStore, METADATA_FILENAME},
        metadata::{FileSummary, render_metadata},
    },
};
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::{io, sync::Arc};
use thiserror::Error;
use tracing::{debug, info, warn};

const MAX_FILENAME_LEN: usize = 255;

#[derive(Debug, Error)]
pub enum AccessionError {
    #[error("accession {0} not found")]
    AccessionNotFound(i64),
    #[error("accession {0} has no files")]
    NoFiles(i64),
    #[error("invalid filename `{0}`")]
    InvalidFilename(String),
    #[error(transparent)]
    UnknownCode(#[from] UnknownCode),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type AccessionResult<T> = Result<T, AccessionError>;

/// Totals shown on the public stats page.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Counts {
    pub accession_count: i64,
    pub file_count: i64,
}

const ACCESSION_COLUMNS: &str = "id, date_submitted, date_last_updated, description, first_name, \
     last_name, affiliation, organization_name, email_address, phone_number, admin_notes, \
     accession_status";

const FILE_COLUMNS: &str =
    "id, accession_id, file, file_description, content_type, date_file_submitted";

#[derive(Clone)]
pub struct AccessionService {
    /// Shared SQLite connection pool for accession and file records.
    pub db: Arc<SqlitePool>,

    /// Where uploads and generated documents live.
    pub store: ContentStore,

    /// Applied to every archive and metadata document this service produces.
    pub archive_options: ArchiveOptions,
}

impl AccessionService {
    pub fn new(db: Arc<SqlitePool>, store: ContentStore, archive_options: ArchiveOptions) -> Self {
        Self {
            db,
            store,
            archive_options,
        }
    }

    /// Look up one accession.
    ///
    /// Returns AccessionNotFound if the id does not exist and UnknownCode if a
    /// stored enumeration column holds an unexpected value.
    pub async fn fetch_accession(&self, id: i64) -> AccessionResult<Accession> {
        let row = sqlx::query_as::<_, AccessionRow>(&format!(
            "SELECT {ACCESSION_COLUMNS} FROM accessions WHERE id = ?"
        ))
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => AccessionError::AccessionNotFound(id),
            other => AccessionError::Sqlx(other),
        })?;

        Ok(Accession::try_from(row)?)
    }

    /// Files of an accession in upload order. Unknown ids yield an empty list.
    pub async fn list_files(&self, accession_id: i64) -> AccessionResult<Vec<File>> {
        let files = sqlx::query_as::<_, File>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE accession_id = ? ORDER BY id ASC"
        ))
        .bind(accession_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(files)
    }

    /// Record a new submission with status `New`.
    pub async fn insert_accession(&self, new: NewAccession) -> AccessionResult<Accession> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, AccessionRow>(&format!(
            "INSERT INTO accessions (
                date_submitted, date_last_updated, description, first_name, last_name,
                affiliation, organization_name, email_address, phone_number, admin_notes,
                accession_status
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, '', ?)
            RETURNING {ACCESSION_COLUMNS}"
        ))
        .bind(now)
        .bind(now)
        .bind(&new.description)
        .bind(&new.first_name)
        .bind(&new.last_name)
        .bind(new.affiliation.code())
        .bind(&new.organization_name)
        .bind(&new.email_address)
        .bind(&new.phone_number)
        .bind(AccessionStatus::default().code())
        .fetch_one(&*self.db)
        .await?;

        let accession = Accession::try_from(row)?;
        info!("created accession {}", accession.id);
        Ok(accession)
    }

    /// Attach an uploaded file to an accession.
    ///
    /// - Rejects filenames that are empty or contain path separators
    /// - Picks a free stored name (`name_1.ext`, `name_2.ext`, ...) when the
    ///   accession already holds a file with the same name
    /// - Inserts the row first so the UNIQUE path reserves the name, then
    ///   writes the payload; the row is removed again if the write fails
    pub async fn insert_file(
        &self,
        accession_id: i64,
        filename: &str,
        description: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> AccessionResult<File> {
        ensure_filename_safe(filename)?;
        self.fetch_accession(accession_id).await?;

        let file = self
            .reserve_path(accession_id, filename, description, content_type)
            .await?;

        if let Err(err) = self.store.write_atomic(&file.file, bytes).await {
            match sqlx::query("DELETE FROM files WHERE id = ?")
                .bind(file.id)
                .execute(&*self.db)
                .await
            {
                Ok(_) => debug!("removed file row {} after failed write", file.id),
                Err(db_err) => warn!(
                    "file row {} ({}) left without payload, rollback failed: {}",
                    file.id, file.file, db_err
                ),
            }
            return Err(AccessionError::Io(err));
        }

        debug!("stored {} ({} bytes)", file.file, bytes.len());
        Ok(file)
    }

    /// Change the review status, optionally replacing the admin notes.
    /// Refreshes `date_last_updated`.
    pub async fn update_status(
        &self,
        id: i64,
        status: AccessionStatus,
        admin_notes: Option<&str>,
    ) -> AccessionResult<Accession> {
        let result = sqlx::query(
            "UPDATE accessions
             SET accession_status = ?, admin_notes = COALESCE(?, admin_notes), date_last_updated = ?
             WHERE id = ?",
        )
        .bind(status.code())
        .bind(admin_notes)
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AccessionError::AccessionNotFound(id));
        }
        self.fetch_accession(id).await
    }

    /// Delete an accession, its file rows (cascade) and its stored content.
    pub async fn delete_accession(&self, id: i64) -> AccessionResult<()> {
        let result = sqlx::query("DELETE FROM accessions WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AccessionError::AccessionNotFound(id));
        }

        self.store.remove_dir(&ContentStore::upload_dir(id)).await?;
        self.store.remove_dir(&ContentStore::metadata_dir(id)).await?;
        info!("deleted accession {}", id);
        Ok(())
    }

    pub async fn counts(&self) -> AccessionResult<Counts> {
        let (accession_count, file_count) = sqlx::query_as::<_, (i64, i64)>(
            "SELECT (SELECT COUNT(*) FROM accessions), (SELECT COUNT(*) FROM files)",
        )
        .fetch_one(&*self.db)
        .await?;

        Ok(Counts {
            accession_count,
            file_count,
        })
    }

    /// Render the metadata document for `accession_id` and store it as the
    /// accession's latest copy.
    ///
    /// Returns the rendered bytes, so a caller packaging them works with the
    /// snapshot it rendered even if another request replaces the stored copy.
    pub async fn write_metadata(
        &self,
        accession_id: i64,
        files: &[FileSummary],
    ) -> AccessionResult<Bytes> {
        let accession = self.fetch_accession(accession_id).await?;
        let document = Bytes::from(render_metadata(
            &accession,
            files,
            Utc::now(),
            self.archive_options.time_zone,
        ));

        let path = ContentStore::metadata_path(accession_id);
        self.store.write_atomic(&path, &document).await?;
        Ok(document)
    }

    /// Prepare the download archive for an accession.
    ///
    /// Everything that can fail cleanly happens here, before a single byte is
    /// produced: the file list is loaded (NoFiles if empty, which also covers
    /// unknown ids), the accession is resolved and its metadata document is
    /// rendered. The returned stream places each file under `{id}/` and the
    /// document rendered for this request last, at the archive root.
    pub async fn prepare_archive(&self, accession_id: i64) -> AccessionResult<ArchiveStream> {
        let files = self.list_files(accession_id).await?;
        if files.is_empty() {
            debug!("archive requested for accession {} with no files", accession_id);
            return Err(AccessionError::NoFiles(accession_id));
        }

        let summaries: Vec<FileSummary> = files.iter().map(FileSummary::from).collect();
        let document = self.write_metadata(accession_id, &summaries).await?;

        let mut entries: Vec<ArchiveEntry> = files
            .iter()
            .map(|f| ArchiveEntry::stored(&f.file, format!("{}/{}", accession_id, f.filename())))
            .collect();
        entries.push(ArchiveEntry::inline(document, METADATA_FILENAME));

        info!(
            "streaming archive for accession {} ({} entries)",
            accession_id,
            entries.len()
        );
        Ok(ArchiveStream::new(
            self.store.clone(),
            entries,
            self.archive_options,
        ))
    }

    /// Insert the file row under the first free stored path for `filename`.
    ///
    /// Candidates are tried in order; a UNIQUE violation means another upload
    /// holds that path, so the next suffix is tried.
    async fn reserve_path(
        &self,
        accession_id: i64,
        filename: &str,
        description: &str,
        content_type: &str,
    ) -> AccessionResult<File> {
        let (stem, ext) = match filename.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
            _ => (filename, None),
        };

        let mut suffix = 0u32;
        loop {
            let name = match (suffix, ext) {
                (0, _) => filename.to_string(),
                (n, Some(ext)) => format!("{}_{}.{}", stem, n, ext),
                (n, None) => format!("{}_{}", stem, n),
            };
            let path = ContentStore::upload_path(accession_id, &name);

            let inserted = sqlx::query_as::<_, File>(&format!(
                "INSERT INTO files (accession_id, file, file_description, content_type, date_file_submitted)
                 VALUES (?, ?, ?, ?, ?)
                 RETURNING {FILE_COLUMNS}"
            ))
            .bind(accession_id)
            .bind(&path)
            .bind(description)
            .bind(content_type)
            .bind(Utc::now())
            .fetch_one(&*self.db)
            .await;

            match inserted {
                Ok(file) => return Ok(file),
                Err(err) if is_unique_violation(&err) => {
                    debug!("{} already taken, trying next suffix", path);
                    suffix += 1;
                }
                Err(err) => return Err(AccessionError::Sqlx(err)),
            }
        }
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

fn ensure_filename_safe(filename: &str) -> AccessionResult<()> {
    let invalid = filename.is_empty()
        || filename.len() > MAX_FILENAME_LEN
        || filename == "."
        || filename == ".."
        || filename.starts_with(".tmp-")
        || filename
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control());
    if invalid {
        return Err(AccessionError::InvalidFilename(filename.to_string()));
    }
    Ok(())
}
