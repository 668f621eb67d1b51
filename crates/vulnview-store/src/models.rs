//! Row models and conversions between SQLite rows and domain types.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use vulnview_core::{CveRecord, NewCve};

use crate::error::StoreError;

#[derive(Debug, Clone, FromRow)]
pub(crate) struct CveRow {
    pub id: i64,
    pub cve_id: String,
    pub source_identifier: String,
    pub published_date: i64,
    pub last_modified_date: i64,
    pub status: String,
}

pub(crate) fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(micros: i64, cve_id: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| StoreError::CorruptRow {
        cve_id: cve_id.to_string(),
    })
}

impl TryFrom<CveRow> for CveRecord {
    type Error = StoreError;

    fn try_from(row: CveRow) -> Result<Self, Self::Error> {
        let published_date = from_micros(row.published_date, &row.cve_id)?;
        let last_modified_date = from_micros(row.last_modified_date, &row.cve_id)?;
        Ok(CveRecord {
            id: row.id,
            cve_id: row.cve_id,
            source_identifier: row.source_identifier,
            published_date,
            last_modified_date,
            status: row.status,
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct NewCveRow {
    pub cve_id: String,
    pub source_identifier: String,
    pub published_date: i64,
    pub last_modified_date: i64,
    pub status: String,
}

impl From<&NewCve> for NewCveRow {
    fn from(cve: &NewCve) -> Self {
        Self {
            cve_id: cve.cve_id.clone(),
            source_identifier: cve.source_identifier.clone(),
            published_date: to_micros(cve.published_date),
            last_modified_date: to_micros(cve.last_modified_date),
            status: cve.status.clone(),
        }
    }
}
