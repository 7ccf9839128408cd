use std::{str::FromStr, time::Duration};

use chrono::Utc;
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Row, SqlitePool,
};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use tenant_router_core::{context, DataStoreTarget, TenantContext, TenantId};

use crate::{apply_pragmas, to_rfc3339, TENANT_MIGRATOR};

const DEFAULT_MAX_CONNECTIONS: u32 = 2;
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens connections to tenant data stores.
///
/// Holds no per-tenant state; every call opens a fresh pool for the given target.
#[derive(Debug, Clone)]
pub struct TenantConnector {
    max_connections: u32,
    acquire_timeout: Duration,
}

impl Default for TenantConnector {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

impl TenantConnector {
    /// Creates the tenant store when missing, applies tenant migrations and
    /// stamps it with the owning tenant id.
    ///
    /// Fails with [`StoreError::TargetMismatch`] when the target is already
    /// stamped for another tenant.
    pub async fn provision(
        &self,
        tenant_id: TenantId,
        target: &DataStoreTarget,
    ) -> Result<(), StoreError> {
        let pool = self.open(target, true).await?;
        let result: Result<(), StoreError> = async {
            TENANT_MIGRATOR
                .run(&pool)
                .await
                .map_err(StoreError::Migration)?;

            match read_stamp(&pool).await? {
                Some(owner) if owner == tenant_id.to_string() => Ok(()),
                Some(owner) => Err(StoreError::TargetMismatch {
                    database: target.database().to_string(),
                    expected: tenant_id,
                    found: Some(owner),
                }),
                None => {
                    sqlx::query("INSERT INTO tenant_meta (tenant_id, provisioned_at) VALUES (?, ?)")
                        .bind(tenant_id.to_string())
                        .bind(to_rfc3339(Utc::now()))
                        .execute(&pool)
                        .await?;
                    info!(stage = "store", database = %target, tenant_id = %tenant_id, "tenant store provisioned");
                    Ok(())
                }
            }
        }
        .await;
        pool.close().await;
        result
    }

    /// Opens an existing tenant store and verifies that it belongs to `tenant_id`.
    pub async fn connect(
        &self,
        tenant_id: TenantId,
        target: &DataStoreTarget,
    ) -> Result<SqlitePool, StoreError> {
        let pool = self.open(target, false).await?;
        let owner = match read_stamp(&pool).await {
            Ok(owner) => owner,
            Err(err) => {
                pool.close().await;
                return Err(err);
            }
        };
        if owner.as_deref() != Some(tenant_id.to_string().as_str()) {
            pool.close().await;
            return Err(StoreError::TargetMismatch {
                database: target.database().to_string(),
                expected: tenant_id,
                found: owner,
            });
        }
        debug!(stage = "store", database = %target, tenant_id = %tenant_id, "tenant store connected");
        Ok(pool)
    }

    async fn open(&self, target: &DataStoreTarget, create: bool) -> Result<SqlitePool, StoreError> {
        let connect_error = |source: sqlx::Error| StoreError::Connect {
            database: target.database().to_string(),
            source,
        };
        let options = SqliteConnectOptions::from_str(target.connection())
            .map_err(connect_error)?
            .create_if_missing(create);
        let pool = SqlitePoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(connect_error)?;

        if let Err(err) = apply_pragmas(&pool).await {
            pool.close().await;
            return Err(StoreError::Pragma(err));
        }
        Ok(pool)
    }
}

async fn read_stamp(pool: &SqlitePool) -> Result<Option<String>, StoreError> {
    let row = sqlx::query("SELECT tenant_id FROM tenant_meta LIMIT 1")
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|row| row.get::<String, _>("tenant_id")))
}

/// Connection handle bound to one tenant and one flow.
///
/// The pool is opened on first use. Every access checks the calling flow: an
/// unset context is [`StoreError::NoTenantContext`], while a flow bound to a
/// different tenant is a broken invariant and panics.
pub struct TenantStore {
    context: TenantContext,
    connector: TenantConnector,
    pool: OnceCell<SqlitePool>,
}

impl TenantStore {
    pub(crate) fn new(context: TenantContext, connector: TenantConnector) -> Self {
        Self {
            context,
            connector,
            pool: OnceCell::new(),
        }
    }

    pub fn context(&self) -> &TenantContext {
        &self.context
    }

    /// Whether a connection has been opened yet.
    pub fn is_connected(&self) -> bool {
        self.pool.initialized()
    }

    /// Returns the tenant pool, connecting on first call.
    pub async fn pool(&self) -> Result<&SqlitePool, StoreError> {
        self.check_flow()?;
        self.pool
            .get_or_try_init(|| {
                self.connector
                    .connect(self.context.tenant_id(), self.context.target())
            })
            .await
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let pool = self.pool().await?;
        sqlx::query("SELECT 1").execute(pool).await?;
        Ok(())
    }

    /// Closes the connection if one was opened.
    pub async fn close(self) {
        if let Some(pool) = self.pool.into_inner() {
            pool.close().await;
        }
    }

    fn check_flow(&self) -> Result<(), StoreError> {
        let current = context::current().ok_or(StoreError::NoTenantContext)?;
        assert!(
            current.tenant_id() == self.context.tenant_id(),
            "cross-tenant store access: store for {} used in a flow bound to {}",
            self.context.slug(),
            current.slug()
        );
        Ok(())
    }
}

/// Errors raised while opening or using tenant stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no tenant context is established for the current flow")]
    NoTenantContext,
    #[error("failed to open tenant store {database}: {source}")]
    Connect {
        database: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to migrate tenant store: {0}")]
    Migration(MigrateError),
    #[error("tenant store {database} is stamped for {found:?}, expected {expected}")]
    TargetMismatch {
        database: String,
        expected: TenantId,
        found: Option<String>,
    },
    #[error("failed to encode record payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite_file_url;
    use tenant_router_core::{TenantRecord, TenantSlug};

    fn record(slug: &str) -> TenantRecord {
        TenantRecord {
            id: TenantId::generate(),
            slug: TenantSlug::parse(slug).expect("slug"),
            name: slug.to_string(),
            custom_domain: None,
            is_active: true,
            connection_override: None,
            version: 1,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn provision_stamps_and_connect_verifies_owner() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = DataStoreTarget::explicit(sqlite_file_url(dir.path(), "acme.db"));
        let connector = TenantConnector::default();
        let acme = record("acme");
        let globex = record("globex");

        connector.provision(acme.id, &target).await.expect("provision");
        connector
            .provision(acme.id, &target)
            .await
            .expect("re-provision is idempotent");

        let pool = connector.connect(acme.id, &target).await.expect("connect");
        pool.close().await;

        let err = connector.connect(globex.id, &target).await.unwrap_err();
        assert!(matches!(err, StoreError::TargetMismatch { found: Some(_), .. }));

        let err = connector.provision(globex.id, &target).await.unwrap_err();
        assert!(matches!(err, StoreError::TargetMismatch { .. }));
    }

    #[tokio::test]
    async fn connect_refuses_missing_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = DataStoreTarget::explicit(sqlite_file_url(dir.path(), "ghost.db"));
        let err = TenantConnector::default()
            .connect(TenantId::generate(), &target)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Connect { .. }));
        assert!(!dir.path().join("ghost.db").exists());
    }

    #[tokio::test]
    async fn store_outside_flow_is_rejected_and_stays_unconnected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = DataStoreTarget::explicit(sqlite_file_url(dir.path(), "acme.db"));
        let acme = record("acme");
        let connector = TenantConnector::default();
        connector.provision(acme.id, &target).await.expect("provision");

        let store = TenantStore::new(TenantContext::new(&acme, target), connector);
        let err = store.ping().await.unwrap_err();
        assert!(matches!(err, StoreError::NoTenantContext));
        assert!(!store.is_connected());
    }

    #[tokio::test]
    #[should_panic(expected = "cross-tenant store access")]
    async fn store_used_under_another_tenant_panics() {
        let dir = tempfile::tempdir().expect("tempdir");
        let acme = record("acme");
        let globex = record("globex");
        let acme_ctx = TenantContext::new(
            &acme,
            DataStoreTarget::explicit(sqlite_file_url(dir.path(), "acme.db")),
        );
        let globex_ctx = TenantContext::new(
            &globex,
            DataStoreTarget::explicit(sqlite_file_url(dir.path(), "globex.db")),
        );

        let store = TenantStore::new(acme_ctx, TenantConnector::default());
        let _ = context::establish(globex_ctx, async { store.ping().await }).await;
    }
}
