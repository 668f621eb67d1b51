//! SQLite-backed record store for vulnview.

pub const CRATE_NAME: &str = "vulnview-store";

mod db;
mod error;
mod models;
mod repo;

pub use db::Database;
pub use error::StoreError;
pub use repo::CveRepository;
