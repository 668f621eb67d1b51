//! Repository for canonical CVE rows.

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::instrument;
use vulnview_core::{CveFilter, CveRecord, NewCve};

use crate::db::Database;
use crate::error::StoreError;
use crate::models::{to_micros, CveRow, NewCveRow};

/// Repository over the `cves` table.
///
/// Updates go through [`CveRepository::update_if_newer`], a single atomic
/// compare-and-swap on `last_modified_date`, so concurrent appliers cannot
/// regress a row even if the scheduler-level overlap guard were bypassed.
#[derive(Debug, Clone)]
pub struct CveRepository {
    pool: SqlitePool,
}

impl From<&Database> for CveRepository {
    fn from(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

impl CveRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find_by_cve_id(&self, cve_id: &str) -> Result<Option<CveRecord>, StoreError> {
        let row: Option<CveRow> = sqlx::query_as(
            r#"
            SELECT id, cve_id, source_identifier, published_date, last_modified_date, status
              FROM cves
             WHERE cve_id = ?
            "#,
        )
        .bind(cve_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(CveRecord::try_from).transpose()
    }

    /// Insert a record on first sighting. A unique-key violation maps to
    /// [`StoreError::DuplicateKey`] so the caller can fall back to the
    /// update path instead of failing the run.
    #[instrument(skip(self, cve), fields(cve_id = %cve.cve_id))]
    pub async fn insert(&self, cve: &NewCve) -> Result<(), StoreError> {
        let row = NewCveRow::from(cve);
        sqlx::query(
            r#"
            INSERT INTO cves (cve_id, source_identifier, published_date, last_modified_date, status)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.cve_id)
        .bind(&row.source_identifier)
        .bind(row.published_date)
        .bind(row.last_modified_date)
        .bind(&row.status)
        .execute(&self.pool)
        .await
        .map_err(|err| match err.as_database_error() {
            Some(db_err) if db_err.is_unique_violation() => {
                StoreError::DuplicateKey(cve.cve_id.clone())
            }
            _ => StoreError::Database(err),
        })?;
        Ok(())
    }

    /// Apply an update only if the incoming timestamp strictly exceeds the
    /// stored one. Returns whether a row changed. `published_date` is never
    /// touched.
    #[instrument(skip(self, status))]
    pub async fn update_if_newer(
        &self,
        cve_id: &str,
        last_modified: DateTime<Utc>,
        status: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE cves
               SET last_modified_date = ?, status = ?
             WHERE cve_id = ? AND last_modified_date < ?
            "#,
        )
        .bind(to_micros(last_modified))
        .bind(status)
        .bind(cve_id)
        .bind(to_micros(last_modified))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Filtered, paginated listing. `page_index` is zero-based. The total
    /// count is computed with the same predicate as the page contents.
    pub async fn list_filtered(
        &self,
        filter: &CveFilter,
        page_size: i64,
        page_index: i64,
    ) -> Result<(Vec<CveRecord>, i64), StoreError> {
        let now = Utc::now();

        let mut count_qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM cves");
        push_predicates(&mut count_qb, filter, now);
        let total: i64 = count_qb.build_query_scalar().fetch_one(&self.pool).await?;

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, cve_id, source_identifier, published_date, last_modified_date, status FROM cves",
        );
        push_predicates(&mut qb, filter, now);
        qb.push(" ORDER BY cve_id LIMIT ")
            .push_bind(page_size.max(0))
            .push(" OFFSET ")
            .push_bind((page_index * page_size).max(0));
        let rows: Vec<CveRow> = qb.build_query_as().fetch_all(&self.pool).await?;

        let records = rows
            .into_iter()
            .map(CveRecord::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((records, total))
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cves")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

/// Append WHERE predicates for every present filter, conjoined with AND.
fn push_predicates(qb: &mut QueryBuilder<Sqlite>, filter: &CveFilter, now: DateTime<Utc>) {
    let mut prefix = " WHERE ";

    if let Some(fragment) = &filter.cve_id {
        // SQLite LIKE is case-insensitive over ASCII, which covers CVE ids.
        qb.push(prefix)
            .push("cve_id LIKE '%' || ")
            .push_bind(fragment.clone())
            .push(" || '%'");
        prefix = " AND ";
    }

    if let Some(year) = filter.year {
        match year_bounds(year) {
            Some((start, end)) => {
                qb.push(prefix)
                    .push("published_date >= ")
                    .push_bind(start)
                    .push(" AND published_date < ")
                    .push_bind(end);
            }
            // A year chrono cannot represent matches nothing.
            None => {
                qb.push(prefix).push("0 = 1");
            }
        }
        prefix = " AND ";
    }

    if let Some(days) = filter.days {
        let cutoff = to_micros(now - Duration::days(days));
        qb.push(prefix).push("published_date >= ").push_bind(cutoff);
    }
}

fn year_bounds(year: i32) -> Option<(i64, i64)> {
    let start = Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).single()?;
    let end = Utc
        .with_ymd_and_hms(year.checked_add(1)?, 1, 1, 0, 0, 0)
        .single()?;
    debug_assert_eq!(start.year(), year);
    Some((to_micros(start), to_micros(end)))
}
