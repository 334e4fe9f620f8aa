// =============================================================================
// Persistent Store — SQLite access for bars and the workflow tables
// =============================================================================
//
// One `Store` value wraps the connection pool and is cloned into every worker
// loop. Schema lives in `migrations/` and is applied at startup. All state
// transitions are row-scoped compare-and-set updates
// (`UPDATE … WHERE id = ? AND status = ?`), which keeps every loop safe to
// run as N > 1 replicas.
// =============================================================================

pub mod bars;
pub mod executions;
pub mod runs;

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

/// Stored datetime format (exchange-local, no offset).
pub const DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";
/// Stored date format.
pub const DATE_FMT: &str = "%Y-%m-%d";

pub(crate) fn format_datetime(dt: NaiveDateTime) -> String {
    dt.format(DATETIME_FMT).to_string()
}

pub(crate) fn parse_datetime(s: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, DATETIME_FMT)
        .with_context(|| format!("invalid stored datetime '{s}'"))
}

pub(crate) fn format_date(d: NaiveDate) -> String {
    d.format(DATE_FMT).to_string()
}

pub(crate) fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FMT).with_context(|| format!("invalid stored date '{s}'"))
}

/// Shared handle to the SQLite store.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Connect to `database_url`, switch to WAL journalling, and apply any
    /// pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .with_context(|| format!("failed to open database at {database_url}"))?;

        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await
            .context("failed to enable WAL journal mode")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to apply migrations")?;

        info!(database_url, "store connected and migrated");
        Ok(Self { pool })
    }

    /// In-memory store for tests. Single connection: each SQLite `:memory:`
    /// connection is its own database.
    #[cfg(test)]
    pub async fn memory() -> Self {
        let options: SqliteConnectOptions = "sqlite::memory:".parse().expect("sqlite options");
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.foreign_keys(false))
            .await
            .expect("in-memory sqlite");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("migrations");
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
