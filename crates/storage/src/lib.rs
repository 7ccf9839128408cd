use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::{MigrateError, Migrator},
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use thiserror::Error;

mod registry;
mod scoped;
mod tenant_store;

pub use registry::{NewTenant, RegistryError, TenantRegistryRepository};
pub use scoped::{
    CmsStore, CrmStore, HrStore, InventoryStore, ManufacturingStore, ModuleRecord, ModuleRecords,
    ModuleStore, SalesStore, ScopedStoreFactory, MODULES,
};
pub use tenant_store::{StoreError, TenantConnector, TenantStore};

pub(crate) static MASTER_MIGRATOR: Migrator = sqlx::migrate!("../../migrations/master");
pub(crate) static TENANT_MIGRATOR: Migrator = sqlx::migrate!("../../migrations/tenant");

/// Handle on the master (registry) database.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens the master database, creating the file when it does not exist yet.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Connect)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await.map_err(StorageError::Pragma)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/master`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        MASTER_MIGRATOR
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle on the tenant registry.
    pub fn tenants(&self) -> TenantRegistryRepository {
        TenantRegistryRepository::new(self.pool.clone())
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub(crate) async fn apply_pragmas(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query("PRAGMA foreign_keys = ON;").execute(pool).await?;
    sqlx::query("PRAGMA journal_mode = WAL;").fetch_one(pool).await?;
    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await?;
    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub(crate) fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Builds a `sqlite://` url for a file inside `dir`. Used by tests across the workspace.
pub fn sqlite_file_url(dir: &std::path::Path, file_name: &str) -> String {
    format!("sqlite://{}", dir.join(file_name).display())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    pub async fn master() -> (TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::connect(&sqlite_file_url(dir.path(), "master.db"))
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");
        (dir, db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_apply() {
        let (_dir, db) = test_support::master().await;

        let tables: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'tenants'",
        )
        .fetch_one(db.pool())
        .await
        .expect("fetch tables");
        assert_eq!(tables.0, 1, "expected tenants table to be created");
    }

    #[tokio::test]
    async fn connect_creates_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = sqlite_file_url(dir.path(), "fresh.db");
        Database::connect(&url).await.expect("connect");
        assert!(dir.path().join("fresh.db").exists());
    }
}
