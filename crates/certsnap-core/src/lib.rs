//! Core domain model and report normalization for certsnap.

use chrono::{Months, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "certsnap-core";

/// Value the portal export substitutes for identities it has redacted.
pub const REDACTED_IDENTITY_SENTINEL: &str = "xxxxxx";

/// Date layout used by the portal export for award and expiration columns.
pub const PORTAL_DATE_FORMAT: &str = "%m/%d/%Y";

/// Login credentials handed from the secret store to the portal session.
#[derive(Clone, Deserialize)]
pub struct PortalCredentials {
    #[serde(rename = "Username")]
    pub username: String,
    #[serde(rename = "Password")]
    pub password: String,
}

/// Whether a certification is a first award or a renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecertifiedStatus {
    New,
    Recertified,
}

impl RecertifiedStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecertifiedStatus::New => "New",
            RecertifiedStatus::Recertified => "Recertified",
        }
    }
}

/// One normalized certification row. `(email, certificate_name)` is the
/// storage identity of the record within a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificationRecord {
    pub email: String,
    pub user_name: String,
    pub certificate_name: String,
    pub certificate_level: String,
    pub award_date: NaiveDate,
    pub expiration_date: NaiveDate,
    pub last_certification_date: NaiveDate,
    pub recertification_date: Option<NaiveDate>,
    pub status: RecertifiedStatus,
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("unparsable {column} value {value:?}")]
    MalformedDate { column: &'static str, value: String },
    #[error("malformed export csv: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Deserialize)]
struct RawCertificationRow {
    #[serde(rename = "User Name")]
    user_name: String,
    #[serde(rename = "Work Email")]
    work_email: String,
    #[serde(rename = "Certificate Name")]
    certificate_name: String,
    #[serde(rename = "Certificate Level")]
    certificate_level: String,
    #[serde(rename = "Award Date")]
    award_date: String,
    #[serde(rename = "Expiration Date")]
    expiration_date: String,
}

/// Render a date the way the destination table stores it: `M/D/YYYY`,
/// no zero padding.
pub fn format_short_date(date: NaiveDate) -> String {
    use chrono::Datelike;
    format!("{}/{}/{}", date.month(), date.day(), date.year())
}

fn parse_portal_date(column: &'static str, value: &str) -> Result<NaiveDate, NormalizeError> {
    NaiveDate::parse_from_str(value.trim(), PORTAL_DATE_FORMAT).map_err(|_| {
        NormalizeError::MalformedDate {
            column,
            value: value.to_string(),
        }
    })
}

/// Parse the raw CSV export into normalized records, in row order.
///
/// Columns are matched by header name, so the export may reorder or add
/// columns freely. Rows whose work email carries the redaction sentinel get
/// a synthetic `unknown-<i>` identity; the counter is shared across the
/// whole batch and advances only on redacted rows. Any unparsable date
/// fails the batch.
pub fn normalize_report(raw: &[u8]) -> Result<Vec<CertificationRecord>, NormalizeError> {
    let mut reader = csv::Reader::from_reader(raw);
    let mut records = Vec::new();
    let mut redacted_seen = 0usize;

    for row in reader.deserialize::<RawCertificationRow>() {
        let row = row?;

        let (email, user_name) = if row.work_email == REDACTED_IDENTITY_SENTINEL {
            let synthetic = format!("unknown-{redacted_seen}");
            redacted_seen += 1;
            (synthetic.clone(), synthetic)
        } else {
            (row.work_email, row.user_name)
        };

        let award_date = parse_portal_date("Award Date", &row.award_date)?;
        let expiration_date = parse_portal_date("Expiration Date", &row.expiration_date)?;
        // Exact calendar subtraction; Feb 29 clamps to Feb 28 on non-leap years.
        let last_certification_date = expiration_date
            .checked_sub_months(Months::new(36))
            .ok_or_else(|| NormalizeError::MalformedDate {
                column: "Expiration Date",
                value: row.expiration_date.clone(),
            })?;

        let (status, recertification_date) = if last_certification_date == award_date {
            (RecertifiedStatus::New, None)
        } else {
            (RecertifiedStatus::Recertified, Some(last_certification_date))
        };

        records.push(CertificationRecord {
            email,
            user_name,
            certificate_name: row.certificate_name,
            certificate_level: row.certificate_level,
            award_date,
            expiration_date,
            last_certification_date,
            recertification_date,
            status,
        });
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str =
        "User Name,Work Email,Certificate Name,Certificate Level,Award Date,Expiration Date";

    fn csv_of(rows: &[&str]) -> Vec<u8> {
        let mut text = String::from(HEADER);
        for row in rows {
            text.push('\n');
            text.push_str(row);
        }
        text.into_bytes()
    }

    #[test]
    fn passthrough_preserves_source_identities() {
        let raw = csv_of(&["Jane Doe,jane@example.com,Solutions Architect,Professional,06/15/2019,06/15/2023"]);
        let records = normalize_report(&raw).unwrap();
        assert_eq!(records[0].email, "jane@example.com");
        assert_eq!(records[0].user_name, "Jane Doe");
    }

    #[test]
    fn redacted_rows_share_one_batch_counter() {
        let raw = csv_of(&[
            "xxxxxx,xxxxxx,Cert A,Associate,1/1/2020,1/1/2023",
            "Jane Doe,jane@example.com,Cert B,Associate,1/1/2020,1/1/2023",
            "xxxxxx,xxxxxx,Cert C,Associate,1/1/2020,1/1/2023",
            "xxxxxx,xxxxxx,Cert D,Associate,1/1/2020,1/1/2023",
        ]);
        let records = normalize_report(&raw).unwrap();
        assert_eq!(records[0].email, "unknown-0");
        assert_eq!(records[0].user_name, "unknown-0");
        assert_eq!(records[1].email, "jane@example.com");
        assert_eq!(records[2].email, "unknown-1");
        assert_eq!(records[3].email, "unknown-2");
    }

    #[test]
    fn new_when_last_certification_matches_award() {
        let raw = csv_of(&["xxxxxx,xxxxxx,Cert A,Associate,1/1/2020,1/1/2023"]);
        let records = normalize_report(&raw).unwrap();
        assert_eq!(records[0].email, "unknown-0");
        assert_eq!(records[0].status, RecertifiedStatus::New);
        assert_eq!(records[0].recertification_date, None);
        assert_eq!(
            format_short_date(records[0].last_certification_date),
            "1/1/2020"
        );
    }

    #[test]
    fn recertified_when_expiration_was_extended() {
        let raw = csv_of(&["Jane Doe,jane@example.com,Cert A,Professional,6/15/2019,6/15/2023"]);
        let records = normalize_report(&raw).unwrap();
        assert_eq!(records[0].status, RecertifiedStatus::Recertified);
        assert_eq!(
            records[0].recertification_date,
            Some(NaiveDate::from_ymd_opt(2020, 6, 15).unwrap())
        );
        assert_eq!(
            format_short_date(records[0].last_certification_date),
            "6/15/2020"
        );
    }

    #[test]
    fn three_year_subtraction_clamps_leap_day() {
        let raw = csv_of(&["Jane Doe,jane@example.com,Cert A,Associate,2/28/2021,2/29/2024"]);
        let records = normalize_report(&raw).unwrap();
        assert_eq!(
            records[0].last_certification_date,
            NaiveDate::from_ymd_opt(2021, 2, 28).unwrap()
        );
        assert_eq!(records[0].status, RecertifiedStatus::New);
    }

    #[test]
    fn short_dates_carry_no_leading_zeros() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        assert_eq!(format_short_date(date), "3/4/2024");
    }

    #[test]
    fn zero_padded_input_dates_are_accepted() {
        let raw = csv_of(&["Jane Doe,jane@example.com,Cert A,Associate,03/04/2021,03/04/2024"]);
        let records = normalize_report(&raw).unwrap();
        assert_eq!(format_short_date(records[0].award_date), "3/4/2021");
        assert_eq!(format_short_date(records[0].expiration_date), "3/4/2024");
    }

    #[test]
    fn malformed_date_fails_the_whole_batch() {
        let raw = csv_of(&[
            "Jane Doe,jane@example.com,Cert A,Associate,1/1/2020,1/1/2023",
            "John Doe,john@example.com,Cert B,Associate,not-a-date,1/1/2023",
        ]);
        let err = normalize_report(&raw).unwrap_err();
        assert!(matches!(
            err,
            NormalizeError::MalformedDate {
                column: "Award Date",
                ..
            }
        ));
    }

    #[test]
    fn column_order_is_irrelevant() {
        let raw = b"Expiration Date,Award Date,Certificate Level,Certificate Name,Work Email,User Name\n\
                    1/1/2023,1/1/2020,Associate,Cert A,jane@example.com,Jane Doe"
            .to_vec();
        let records = normalize_report(&raw).unwrap();
        assert_eq!(records[0].certificate_name, "Cert A");
        assert_eq!(records[0].status, RecertifiedStatus::New);
    }

    #[test]
    fn row_order_is_preserved() {
        let raw = csv_of(&[
            "A,a@example.com,Cert A,Associate,1/1/2020,1/1/2023",
            "B,b@example.com,Cert B,Associate,1/1/2020,1/1/2023",
            "C,c@example.com,Cert C,Associate,1/1/2020,1/1/2023",
        ]);
        let records = normalize_report(&raw).unwrap();
        let names: Vec<_> = records.iter().map(|r| r.certificate_name.as_str()).collect();
        assert_eq!(names, ["Cert A", "Cert B", "Cert C"]);
    }
}
