use std::future::Future;

use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::debug;

use tenant_router_core::context;

use crate::tenant_store::{StoreError, TenantConnector, TenantStore};
use crate::to_rfc3339;

/// Builds tenant-bound stores for the flow that calls it.
///
/// Stateless apart from the connector settings: it never caches connections
/// per tenant, and it never falls back to a default tenant.
#[derive(Debug, Clone, Default)]
pub struct ScopedStoreFactory {
    connector: TenantConnector,
}

impl ScopedStoreFactory {
    pub fn new(connector: TenantConnector) -> Self {
        Self { connector }
    }

    /// Creates the module store `S` for the tenant bound to the current flow.
    ///
    /// No connection is opened until the store performs its first operation.
    pub fn create<S: ModuleStore>(&self) -> Result<S, StoreError> {
        let store = self.tenant_store()?;
        debug!(stage = "store", tenant = %store.context().slug(), module = S::MODULE, "module store created");
        Ok(S::from_tenant_store(store))
    }

    /// Untyped store for the current flow, used by maintenance probes.
    pub fn tenant_store(&self) -> Result<TenantStore, StoreError> {
        let context = context::current().ok_or(StoreError::NoTenantContext)?;
        Ok(TenantStore::new(context, self.connector.clone()))
    }
}

/// Entry point every business module store implements to be built by
/// [`ScopedStoreFactory::create`].
pub trait ModuleStore: Sized + Send {
    /// Namespace of the module inside a tenant store.
    const MODULE: &'static str;

    fn from_tenant_store(store: TenantStore) -> Self;

    fn tenant_store(&self) -> &TenantStore;

    fn into_tenant_store(self) -> TenantStore;

    fn records(&self) -> ModuleRecords<'_> {
        ModuleRecords::new(self.tenant_store(), Self::MODULE)
    }

    /// Releases the store's connection, if it opened one.
    fn close(self) -> impl Future<Output = ()> + Send {
        self.into_tenant_store().close()
    }
}

macro_rules! module_store {
    ($(#[$meta:meta])* $name:ident => $module:literal) => {
        $(#[$meta])*
        pub struct $name {
            store: TenantStore,
        }

        impl ModuleStore for $name {
            const MODULE: &'static str = $module;

            fn from_tenant_store(store: TenantStore) -> Self {
                Self { store }
            }

            fn tenant_store(&self) -> &TenantStore {
                &self.store
            }

            fn into_tenant_store(self) -> TenantStore {
                self.store
            }
        }
    };
}

module_store!(
    /// Stock, warehouses and lots.
    InventoryStore => "inventory"
);
module_store!(
    /// Customers, leads and opportunities.
    CrmStore => "crm"
);
module_store!(
    /// Employees, payroll and attendance.
    HrStore => "hr"
);
module_store!(
    /// Work orders, bills of materials and machine maintenance.
    ManufacturingStore => "manufacturing"
);
module_store!(
    /// Orders, quotes and contracts.
    SalesStore => "sales"
);
module_store!(
    /// Pages and content blocks.
    CmsStore => "cms"
);

/// Module namespaces known to this build.
pub const MODULES: [&str; 6] = [
    InventoryStore::MODULE,
    CrmStore::MODULE,
    HrStore::MODULE,
    ManufacturingStore::MODULE,
    SalesStore::MODULE,
    CmsStore::MODULE,
];

/// Key/value records of one module inside a tenant store.
pub struct ModuleRecords<'a> {
    store: &'a TenantStore,
    module: &'static str,
}

impl<'a> ModuleRecords<'a> {
    pub fn new(store: &'a TenantStore, module: &'static str) -> Self {
        Self { store, module }
    }

    pub async fn upsert(&self, key: &str, payload: &serde_json::Value) -> Result<(), StoreError> {
        let pool = self.store.pool().await?;
        let payload_json = serde_json::to_string(payload)?;
        sqlx::query(
            "INSERT INTO module_records (module, key, payload_json, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(module, key) DO UPDATE \
             SET payload_json = excluded.payload_json, updated_at = excluded.updated_at",
        )
        .bind(self.module)
        .bind(key)
        .bind(payload_json)
        .bind(to_rfc3339(Utc::now()))
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn fetch(&self, key: &str) -> Result<Option<ModuleRecord>, StoreError> {
        let pool = self.store.pool().await?;
        let row = sqlx::query(
            "SELECT key, payload_json, updated_at FROM module_records WHERE module = ? AND key = ?",
        )
        .bind(self.module)
        .bind(key)
        .fetch_optional(pool)
        .await?;
        row.map(|row| ModuleRecord::from_row(&row)).transpose()
    }

    pub async fn list(&self) -> Result<Vec<ModuleRecord>, StoreError> {
        let pool = self.store.pool().await?;
        let rows = sqlx::query(
            "SELECT key, payload_json, updated_at FROM module_records WHERE module = ? ORDER BY key",
        )
        .bind(self.module)
        .fetch_all(pool)
        .await?;
        rows.iter().map(ModuleRecord::from_row).collect()
    }
}

/// Record stored by a module.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleRecord {
    pub key: String,
    pub payload: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl ModuleRecord {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, StoreError> {
        let payload_json: String = row.try_get("payload_json")?;
        Ok(Self {
            key: row.try_get("key")?,
            payload: serde_json::from_str(&payload_json)?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}
