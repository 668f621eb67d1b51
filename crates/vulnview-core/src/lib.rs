//! Core domain model and feed timestamp normalization for vulnview.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "vulnview-core";

/// Canonical persisted CVE representation.
///
/// `cve_id` is the immutable identity key; `last_modified_date` acts as the
/// record's logical version and only ever advances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CveRecord {
    pub id: i64,
    pub cve_id: String,
    pub source_identifier: String,
    pub published_date: DateTime<Utc>,
    pub last_modified_date: DateTime<Utc>,
    pub status: String,
}

/// A CVE as first sighted in the feed, before it has a surrogate key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCve {
    pub cve_id: String,
    pub source_identifier: String,
    pub published_date: DateTime<Utc>,
    pub last_modified_date: DateTime<Utc>,
    pub status: String,
}

/// Listing filters. Each field is optional; present filters conjoin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CveFilter {
    /// Case-insensitive substring match against `cve_id`.
    pub cve_id: Option<String>,
    /// Exact match against the year component of `published_date`.
    pub year: Option<i32>,
    /// `published_date` within the last N days from now.
    pub days: Option<i64>,
}

#[derive(Debug, Error)]
#[error("invalid feed timestamp {raw:?}")]
pub struct TimestampError {
    pub raw: String,
}

/// Normalize an upstream feed timestamp into a UTC instant.
///
/// The feed emits ISO-8601 local-less timestamps with optional fractional
/// seconds and an optional trailing `Z` zone marker. The marker is stripped
/// before parsing and the value is interpreted as UTC.
pub fn parse_feed_timestamp(raw: &str) -> Result<DateTime<Utc>, TimestampError> {
    let trimmed = raw.trim().trim_end_matches(['Z', 'z']);
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| TimestampError {
            raw: raw.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn parses_timestamp_with_fractional_seconds() {
        let ts = parse_feed_timestamp("2023-09-10T15:45:30.123").expect("parse");
        assert_eq!(
            ts,
            Utc.with_ymd_and_hms(2023, 9, 10, 15, 45, 30).unwrap()
                + chrono::Duration::milliseconds(123)
        );
    }

    #[test]
    fn strips_trailing_zone_marker() {
        let ts = parse_feed_timestamp("2021-01-01T12:00:00.000Z").expect("parse");
        assert_eq!(ts, Utc.with_ymd_and_hms(2021, 1, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn parses_timestamp_without_fractional_seconds() {
        let ts = parse_feed_timestamp("2022-05-15T08:30:00").expect("parse");
        assert_eq!(ts.nanosecond(), 0);
        assert_eq!(ts, Utc.with_ymd_and_hms(2022, 5, 15, 8, 30, 0).unwrap());
    }

    #[test]
    fn rejects_garbage_timestamp() {
        let err = parse_feed_timestamp("not-a-date").unwrap_err();
        assert_eq!(err.raw, "not-a-date");
    }

    #[test]
    fn sub_second_precision_orders_strictly() {
        let older = parse_feed_timestamp("2024-03-01T00:00:00.250").expect("parse");
        let newer = parse_feed_timestamp("2024-03-01T00:00:00.750Z").expect("parse");
        assert!(newer > older);
    }
}
