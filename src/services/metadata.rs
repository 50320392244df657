//! Plain-text summary of an accession, shipped as `metadata.txt` in every
//! download archive.

use crate::models::{accession::Accession, file::File};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;

/// strftime pattern for every timestamp in the document.
const DATETIME_FORMAT: &str = "%Y-%m-%d %I:%M %p  %Z";

/// Name and description of one included file, in display order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileSummary {
    pub name: String,
    pub description: String,
}

impl From<&File> for FileSummary {
    fn from(file: &File) -> Self {
        Self {
            name: file.filename().to_string(),
            description: file.file_description.clone(),
        }
    }
}

/// Render `dt` in `tz`, e.g. `2023-08-12 03:30 PM  UTC`.
pub fn format_datetime(dt: DateTime<Utc>, tz: Tz) -> String {
    dt.with_timezone(&tz).format(DATETIME_FORMAT).to_string()
}

/// Render the metadata document.
///
/// Output depends only on the arguments; files appear in the order given.
pub fn render_metadata(
    accession: &Accession,
    files: &[FileSummary],
    generated_at: DateTime<Utc>,
    tz: Tz,
) -> String {
    let related_files = files
        .iter()
        .map(|f| format!("{}\n{}", f.name, f.description))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Accession: {id}\n\
         Download date: {download_date}\n\
         Date submitted: {date_submitted}\n\
         \n\
         Status: {status}\n\
         Date last updated: {date_last_updated}\n\
         \n\
         Donor name: {donor_name}\n\
         Affiliation: {affiliation}\n\
         Email: {email}\n\
         Phone: {phone}\n\
         \n\
         Admin notes: {admin_notes}\n\
         \n\
         Accession description: {description}\n\
         \n\
         Included files:\n\
         {related_files}\n",
        id = accession.id,
        download_date = format_datetime(generated_at, tz),
        date_submitted = format_datetime(accession.date_submitted, tz),
        status = accession.status.label(),
        date_last_updated = format_datetime(accession.date_last_updated, tz),
        donor_name = accession.full_name(),
        affiliation = accession.affiliation.label(),
        email = accession.email_address,
        phone = accession.phone_number,
        admin_notes = accession.admin_notes,
        description = accession.description,
        related_files = related_files,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::accession::{AccessionStatus, Affiliation};
    use chrono::TimeZone;

    fn accession() -> Accession {
        let submitted = Utc.with_ymd_and_hms(2023, 8, 12, 15, 30, 0).unwrap();
        Accession {
            id: 42,
            date_submitted: submitted,
            date_last_updated: Utc.with_ymd_and_hms(2023, 8, 13, 9, 5, 0).unwrap(),
            description: "Photographs from the 1974 homecoming.".into(),
            first_name: "Jane".into(),
            last_name: "Doe".into(),
            affiliation: Affiliation::Alumni,
            organization_name: String::new(),
            email_address: "jane@example.com".into(),
            phone_number: "555-0100".into(),
            admin_notes: "Check rights.".into(),
            status: AccessionStatus::Accepted,
        }
    }

    fn files() -> Vec<FileSummary> {
        vec![
            FileSummary {
                name: "file1.txt".into(),
                description: "First".into(),
            },
            FileSummary {
                name: "file2.txt".into(),
                description: "Second".into(),
            },
        ]
    }

    #[test]
    fn formats_datetimes_in_zone() {
        let dt = Utc.with_ymd_and_hms(2023, 8, 12, 15, 30, 0).unwrap();
        assert_eq!(format_datetime(dt, Tz::UTC), "2023-08-12 03:30 PM  UTC");
        assert_eq!(
            format_datetime(dt, chrono_tz::America::Chicago),
            "2023-08-12 10:30 AM  CDT"
        );
    }

    #[test]
    fn renders_fixed_template() {
        let generated_at = Utc.with_ymd_and_hms(2024, 1, 2, 0, 7, 0).unwrap();
        let doc = render_metadata(&accession(), &files(), generated_at, Tz::UTC);

        let expected = "Accession: 42\n\
Download date: 2024-01-02 12:07 AM  UTC\n\
Date submitted: 2023-08-12 03:30 PM  UTC\n\
\n\
Status: Accepted\n\
Date last updated: 2023-08-13 09:05 AM  UTC\n\
\n\
Donor name: Jane Doe\n\
Affiliation: Alumni\n\
Email: jane@example.com\n\
Phone: 555-0100\n\
\n\
Admin notes: Check rights.\n\
\n\
Accession description: Photographs from the 1974 homecoming.\n\
\n\
Included files:\n\
file1.txt\n\
First\n\
file2.txt\n\
Second\n";
        assert_eq!(doc, expected);
    }

    #[test]
    fn output_is_deterministic_and_keeps_caller_order() {
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let mut reversed = files();
        reversed.reverse();

        let a = render_metadata(&accession(), &files(), at, Tz::UTC);
        let b = render_metadata(&accession(), &files(), at, Tz::UTC);
        assert_eq!(a, b);

        let c = render_metadata(&accession(), &reversed, at, Tz::UTC);
        assert!(c.find("file2.txt").unwrap() < c.find("file1.txt").unwrap());
    }

    #[test]
    fn no_files_leaves_empty_list() {
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let doc = render_metadata(&accession(), &[], at, Tz::UTC);
        assert!(doc.ends_with("Included files:\n\n"));
    }
}
