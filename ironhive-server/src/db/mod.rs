//! Metadata store
//!
//! SQLite-backed relational store of every durable entity. The controller
//! exclusively owns this state; agents hold only transient, reconstructable
//! state. Every state transition is a single transaction.

pub mod audit;
pub mod ips;
pub mod migrations;
pub mod networks;
pub mod nodes;
pub mod pools;
pub mod snapshots;
pub mod tasks;
pub mod users;
pub mod vms;
pub mod volumes;

use chrono::{DateTime, Utc};
use ironhive_common::{Error, Result};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::Path;

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (and create, for file URLs) the database
    pub async fn new(database_url: &str) -> Result<Self> {
        if let Some(path) = database_url
            .strip_prefix("sqlite://")
            .map(|p| p.split('?').next().unwrap_or(p))
        {
            if path != ":memory:" && !path.is_empty() {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() {
                        tokio::fs::create_dir_all(parent).await.map_err(|e| {
                            Error::System(format!("failed to create database directory: {}", e))
                        })?;
                    }
                }
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await
            .map_err(|e| Error::Database(format!("connection failed: {}", e)))?;

        tracing::info!("database connection established");
        Ok(Self { pool })
    }

    /// Create the schema if it does not exist yet
    pub async fn migrate(&self) -> Result<()> {
        migrations::run(&self.pool).await?;
        tracing::info!("database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Verify connectivity
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("health check failed: {}", e)))?;
        Ok(())
    }
}

/// Format a timestamp the way every table stores it
pub fn to_db_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

/// Parse a stored timestamp
pub fn from_db_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Database(format!("bad timestamp '{}': {}", raw, e)))
}

/// Parse an optional stored timestamp
pub fn from_db_time_opt(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(from_db_time).transpose()
}

/// Map an sqlx failure into the shared error type
pub fn db_err(context: &str, e: sqlx::Error) -> Error {
    Error::Database(format!("{}: {}", context, e))
}

#[cfg(test)]
pub(crate) async fn test_db() -> Database {
    // A plain ":memory:" database is per-connection; a named shared-cache
    // one is visible to every connection in the pool.
    let url = format!(
        "sqlite:file:testdb-{}?mode=memory&cache=shared",
        uuid::Uuid::new_v4()
    );
    let db = Database::new(&url).await.unwrap();
    db.migrate().await.unwrap();
    db
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrate_and_health() {
        let db = test_db().await;
        db.health_check().await.unwrap();
    }

    #[test]
    fn test_time_round_trip() {
        let now = Utc::now();
        let parsed = from_db_time(&to_db_time(now)).unwrap();
        assert_eq!(parsed.timestamp_millis(), now.timestamp_millis());
    }
}
