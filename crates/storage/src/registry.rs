use std::borrow::Cow;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

use tenant_router_core::{normalize_host, slug_from_host, TenantId, TenantRecord, TenantSlug};

use crate::to_rfc3339;

const SELECT_TENANT: &str = "SELECT id, slug, name, custom_domain, is_active, connection_override, version, updated_at FROM tenants";
/// `RETURNING` writes are always drained with `fetch_all`: a statement left
/// mid-step keeps its connection's write transaction open and hides the change
/// from the rest of the pool.
const RETURNING_TENANT: &str =
    "RETURNING id, slug, name, custom_domain, is_active, connection_override, version, updated_at";

/// Authoritative store of tenant identity records in the master database.
#[derive(Clone)]
pub struct TenantRegistryRepository {
    pool: SqlitePool,
}

impl TenantRegistryRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find_by_id(&self, id: &TenantId) -> Result<Option<TenantRecord>, RegistryError> {
        let row = sqlx::query_as::<_, TenantRow>(&format!("{SELECT_TENANT} WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TenantRow::into_record).transpose()
    }

    /// Case-insensitive lookup on the routing slug.
    pub async fn find_by_slug(
        &self,
        slug: &TenantSlug,
    ) -> Result<Option<TenantRecord>, RegistryError> {
        let row = sqlx::query_as::<_, TenantRow>(&format!("{SELECT_TENANT} WHERE slug = ?"))
            .bind(slug.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TenantRow::into_record).transpose()
    }

    pub async fn find_by_domain(&self, domain: &str) -> Result<Option<TenantRecord>, RegistryError> {
        let row =
            sqlx::query_as::<_, TenantRow>(&format!("{SELECT_TENANT} WHERE custom_domain = ?"))
                .bind(normalize_host(domain))
                .fetch_optional(&self.pool)
                .await?;
        row.map(TenantRow::into_record).transpose()
    }

    /// Resolves a request host. A registered custom domain takes priority over
    /// the slug derived from the subdomain, even when both name a tenant.
    pub async fn find_by_host(
        &self,
        host: &str,
        base_domain: Option<&str>,
    ) -> Result<Option<TenantRecord>, RegistryError> {
        if let Some(record) = self.find_by_domain(host).await? {
            return Ok(Some(record));
        }
        match slug_from_host(host, base_domain) {
            Some(slug) => self.find_by_slug(&slug).await,
            None => Ok(None),
        }
    }

    /// Full scan of active tenants, ordered by slug.
    pub async fn list_active(&self) -> Result<Vec<TenantRecord>, RegistryError> {
        let rows = sqlx::query_as::<_, TenantRow>(&format!(
            "{SELECT_TENANT} WHERE is_active = 1 ORDER BY slug"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TenantRow::into_record).collect()
    }

    pub async fn list_all(&self) -> Result<Vec<TenantRecord>, RegistryError> {
        let rows = sqlx::query_as::<_, TenantRow>(&format!("{SELECT_TENANT} ORDER BY slug"))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TenantRow::into_record).collect()
    }

    pub async fn insert(
        &self,
        tenant: &NewTenant<'_>,
        now: DateTime<Utc>,
    ) -> Result<TenantRecord, RegistryError> {
        let created_at = to_rfc3339(now);
        let row = sqlx::query_as::<_, TenantRow>(&format!(
            "INSERT INTO tenants \
             (id, slug, name, custom_domain, is_active, connection_override, version, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?) {RETURNING_TENANT}"
        ))
        .bind(tenant.id.to_string())
        .bind(tenant.slug.as_str())
        .bind(tenant.name.as_ref())
        .bind(tenant.custom_domain.as_deref().map(normalize_host))
        .bind(tenant.is_active)
        .bind(tenant.connection_override.as_deref())
        .bind(&created_at)
        .bind(&created_at)
        .fetch_all(&self.pool)
        .await
        .map_err(map_write_error)?
        .into_iter()
        .next()
        .ok_or_else(|| RegistryError::Conflict("insert returned no row".to_string()))?;
        row.into_record()
    }

    pub async fn set_active(
        &self,
        id: &TenantId,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<TenantRecord, RegistryError> {
        self.update(id, "is_active = ?", Binding::Bool(active), now)
            .await
    }

    pub async fn set_connection_override(
        &self,
        id: &TenantId,
        connection: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<TenantRecord, RegistryError> {
        let value = connection
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        self.update(id, "connection_override = ?", Binding::Text(value), now)
            .await
    }

    /// Changes the routing slug. When the tenant has no explicit connection
    /// yet, `pinned_connection` becomes its override in the same statement so
    /// the tenant keeps the store it was provisioned on.
    pub async fn rename(
        &self,
        id: &TenantId,
        slug: &TenantSlug,
        pinned_connection: &str,
        now: DateTime<Utc>,
    ) -> Result<TenantRecord, RegistryError> {
        let row = sqlx::query_as::<_, TenantRow>(&format!(
            "UPDATE tenants SET slug = ?, \
             connection_override = COALESCE(NULLIF(TRIM(connection_override), ''), ?), \
             version = version + 1, updated_at = ? WHERE id = ? {RETURNING_TENANT}"
        ))
        .bind(slug.as_str())
        .bind(pinned_connection)
        .bind(to_rfc3339(now))
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(map_write_error)?
        .into_iter()
        .next()
        .ok_or(RegistryError::NotFound)?;
        row.into_record()
    }

    pub async fn set_custom_domain(
        &self,
        id: &TenantId,
        domain: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<TenantRecord, RegistryError> {
        let value = domain.map(normalize_host).filter(|value| !value.is_empty());
        self.update(id, "custom_domain = ?", Binding::Text(value), now)
            .await
    }

    async fn update(
        &self,
        id: &TenantId,
        assignment: &'static str,
        value: Binding,
        now: DateTime<Utc>,
    ) -> Result<TenantRecord, RegistryError> {
        let sql = format!(
            "UPDATE tenants SET {assignment}, version = version + 1, updated_at = ? \
             WHERE id = ? {RETURNING_TENANT}"
        );
        let query = sqlx::query_as::<_, TenantRow>(&sql);
        let query = match value {
            Binding::Bool(flag) => query.bind(flag),
            Binding::Text(text) => query.bind(text),
        };
        let row = query
            .bind(to_rfc3339(now))
            .bind(id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(map_write_error)?
            .into_iter()
            .next()
            .ok_or(RegistryError::NotFound)?;
        row.into_record()
    }
}

enum Binding {
    Bool(bool),
    Text(Option<String>),
}

/// Data required to register a tenant.
#[derive(Debug, Clone)]
pub struct NewTenant<'a> {
    pub id: TenantId,
    pub slug: &'a TenantSlug,
    pub name: Cow<'a, str>,
    pub custom_domain: Option<Cow<'a, str>>,
    pub connection_override: Option<Cow<'a, str>>,
    pub is_active: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct TenantRow {
    id: String,
    slug: String,
    name: String,
    custom_domain: Option<String>,
    is_active: bool,
    connection_override: Option<String>,
    version: i64,
    updated_at: DateTime<Utc>,
}

impl TenantRow {
    fn into_record(self) -> Result<TenantRecord, RegistryError> {
        let id = Uuid::parse_str(&self.id).map_err(|err| RegistryError::Corrupt {
            id: self.id.clone(),
            reason: err.to_string(),
        })?;
        let slug = TenantSlug::parse(&self.slug).map_err(|err| RegistryError::Corrupt {
            id: self.id.clone(),
            reason: err.to_string(),
        })?;
        Ok(TenantRecord {
            id: TenantId::from_uuid(id),
            slug,
            name: self.name,
            custom_domain: self.custom_domain,
            is_active: self.is_active,
            connection_override: self.connection_override,
            version: self.version.max(0) as u64,
            updated_at: self.updated_at,
        })
    }
}

/// Errors raised by registry reads and writes.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("tenant not found")]
    NotFound,
    #[error("tenant registry conflict: {0}")]
    Conflict(String),
    #[error("tenant row {id} is corrupt: {reason}")]
    Corrupt { id: String, reason: String },
    #[error("tenant registry unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl RegistryError {
    /// Transient infrastructure failures; the only class worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<sqlx::Error> for RegistryError {
    fn from(err: sqlx::Error) -> Self {
        if is_transient(&err) {
            Self::Unavailable(err)
        } else {
            Self::Database(err)
        }
    }
}

fn map_write_error(err: sqlx::Error) -> RegistryError {
    if let sqlx::Error::Database(db_err) = &err {
        // 2067 = SQLITE_CONSTRAINT_UNIQUE, 1555 = SQLITE_CONSTRAINT_PRIMARYKEY
        if matches!(db_err.code().as_deref(), Some("2067") | Some("1555")) {
            return RegistryError::Conflict(db_err.message().to_string());
        }
    }
    RegistryError::from(err)
}

fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db_err) => matches!(db_err.code().as_deref(), Some("5") | Some("6")),
        _ => false,
    }
}
