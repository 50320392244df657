//! Represents an uploaded file belonging to an accession.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A stored upload.
///
/// The `File` struct holds the content-store path, not the bytes. The path
/// follows `uploads/<accession-id>/<filename>`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct File {
    /// Database identity.
    pub id: i64,

    /// Owning accession.
    pub accession_id: i64,

    /// Path relative to the content-store root.
    pub file: String,

    /// Donor-supplied description.
    pub file_description: String,

    /// MIME type detected at upload.
    pub content_type: String,

    pub date_file_submitted: DateTime<Utc>,
}

impl File {
    /// Final path component of the stored path.
    pub fn filename(&self) -> &str {
        self.file.rsplit('/').next().unwrap_or(&self.file)
    }
}
