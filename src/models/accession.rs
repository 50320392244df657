//! Represents a donor submission, the metadata half of an accession.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};
use thiserror::Error;

/// A stored enumeration code that does not map to any known variant.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown {field} code `{code}`")]
pub struct UnknownCode {
    pub field: &'static str,
    pub code: String,
}

/// Review state of an accession.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AccessionStatus {
    #[default]
    New,
    UnderReview,
    Accepted,
    Rejected,
}

impl AccessionStatus {
    /// Short code persisted in the `accession_status` column.
    pub fn code(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::UnderReview => "REV",
            Self::Accepted => "ACC",
            Self::Rejected => "REJ",
        }
    }

    /// Human-readable label shown to staff.
    pub fn label(self) -> &'static str {
        match self {
            Self::New => "New",
            Self::UnderReview => "Under Review",
            Self::Accepted => "Accepted",
            Self::Rejected => "Rejected",
        }
    }
}

impl FromStr for AccessionStatus {
    type Err = UnknownCode;

    fn from_str(code: &str) -> Result<Self, Self::Err> {
        match code {
            "NEW" => Ok(Self::New),
            "REV" => Ok(Self::UnderReview),
            "ACC" => Ok(Self::Accepted),
            "REJ" => Ok(Self::Rejected),
            other => Err(UnknownCode {
                field: "status",
                code: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for AccessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How the donor is related to the institution.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Affiliation {
    Student,
    Faculty,
    Staff,
    Alumni,
    Other,
}

impl Affiliation {
    pub fn code(self) -> &'static str {
        match self {
            Self::Student => "STU",
            Self::Faculty => "FAC",
            Self::Staff => "STA",
            Self::Alumni => "ALU",
            Self::Other => "OTH",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Student => "Student",
            Self::Faculty => "Faculty",
            Self::Staff => "Staff",
            Self::Alumni => "Alumni",
            Self::Other => "Other",
        }
    }
}

impl FromStr for Affiliation {
    type Err = UnknownCode;

    fn from_str(code: &str) -> Result<Self, Self::Err> {
        match code {
            "STU" => Ok(Self::Student),
            "FAC" => Ok(Self::Faculty),
            "STA" => Ok(Self::Staff),
            "ALU" => Ok(Self::Alumni),
            "OTH" => Ok(Self::Other),
            other => Err(UnknownCode {
                field: "affiliation",
                code: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Affiliation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Raw `accessions` row as stored in SQLite, enumeration columns still coded.
#[derive(Clone, FromRow, Debug)]
pub struct AccessionRow {
    pub id: i64,
    pub date_submitted: DateTime<Utc>,
    pub date_last_updated: DateTime<Utc>,
    pub description: String,
    pub first_name: String,
    pub last_name: String,
    pub affiliation: String,
    pub organization_name: String,
    pub email_address: String,
    pub phone_number: String,
    pub admin_notes: String,
    pub accession_status: String,
}

/// A single donor submission.
///
/// Owns zero or more [`File`](super::file::File) records; deleting the
/// accession cascades to its files.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Accession {
    /// Database identity, also the name of the upload directory.
    pub id: i64,

    /// When the donor submitted. Never changes after insert.
    pub date_submitted: DateTime<Utc>,

    /// Refreshed on every mutation.
    pub date_last_updated: DateTime<Utc>,

    /// Free-text description supplied by the donor.
    pub description: String,

    pub first_name: String,
    pub last_name: String,
    pub affiliation: Affiliation,
    pub organization_name: String,
    pub email_address: String,
    pub phone_number: String,

    /// Staff-only notes.
    pub admin_notes: String,

    pub status: AccessionStatus,
}

impl Accession {
    /// `first last`, as shown in the metadata document.
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

impl TryFrom<AccessionRow> for Accession {
    type Error = UnknownCode;

    fn try_from(row: AccessionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            date_submitted: row.date_submitted,
            date_last_updated: row.date_last_updated,
            description: row.description,
            first_name: row.first_name,
            last_name: row.last_name,
            affiliation: row.affiliation.parse()?,
            organization_name: row.organization_name,
            email_address: row.email_address,
            phone_number: row.phone_number,
            admin_notes: row.admin_notes,
            status: row.accession_status.parse()?,
        })
    }
}

/// Donor-supplied fields for a new accession.
#[derive(Deserialize, Clone, Debug)]
pub struct NewAccession {
    pub first_name: String,
    pub last_name: String,
    pub affiliation: Affiliation,
    #[serde(default)]
    pub organization_name: String,
    pub email_address: String,
    #[serde(default)]
    pub phone_number: String,
    #[serde(default)]
    pub description: String,
}
