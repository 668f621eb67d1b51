use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A row with the same `cve_id` already exists. The reconciler checks
    /// before inserting, so this only fires on a write race; callers fall
    /// back to the update path.
    #[error("a record with cve_id {0} already exists")]
    DuplicateKey(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("stored timestamp out of range for {cve_id}")]
    CorruptRow { cve_id: String },
}
