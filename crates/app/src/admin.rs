use std::borrow::Cow;

use axum::{
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{info, warn};

use tenant_router_core::{normalize_host, DataStoreTarget, TenantId, TenantRecord, TenantSlug};
use tenant_router_storage::{NewTenant, RegistryError, StoreError, TenantConnector};

use crate::directory::{Invalidation, TenantDirectory};
use crate::identity::bearer_token;
use crate::problem::ProblemResponse;
use crate::router::AppState;

const MAX_DOMAIN_LEN: usize = 253;

/// Tenant lifecycle operations.
///
/// Every mutation commits to the registry, then invalidates the directory
/// before returning, so the caller's next lookup sees the new record.
#[derive(Clone)]
pub struct TenantAdmin {
    directory: TenantDirectory,
    connector: TenantConnector,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Registration {
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub custom_domain: Option<String>,
    #[serde(default)]
    pub connection_override: Option<String>,
}

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("tenant not found")]
    NotFound,
    #[error("invalid slug {value:?}: {reason}")]
    InvalidSlug { value: String, reason: String },
    #[error("invalid custom domain {0:?}")]
    InvalidDomain(String),
    #[error("{0}")]
    Conflict(String),
    #[error("data store {database} is already used by tenant {owner}")]
    TargetInUse { database: String, owner: TenantSlug },
    #[error("failed to provision tenant store: {0}")]
    Provision(#[from] StoreError),
    #[error(transparent)]
    Registry(RegistryError),
}

impl From<RegistryError> for AdminError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound => Self::NotFound,
            RegistryError::Conflict(reason) => Self::Conflict(reason),
            other => Self::Registry(other),
        }
    }
}

impl TenantAdmin {
    pub fn new(directory: TenantDirectory, connector: TenantConnector) -> Self {
        Self {
            directory,
            connector,
        }
    }

    pub async fn list(&self) -> Result<Vec<TenantRecord>, AdminError> {
        Ok(self.directory.registry().list_all().await?)
    }

    pub async fn get(&self, id: &TenantId) -> Result<TenantRecord, AdminError> {
        self.directory
            .registry()
            .find_by_id(id)
            .await?
            .ok_or(AdminError::NotFound)
    }

    /// Registers a tenant and provisions its store.
    ///
    /// The row is written inactive first and only activated once its store
    /// exists, so no flow can resolve a tenant without a store. A failed
    /// provisioning leaves the tenant inactive; activating it retries.
    pub async fn register(&self, registration: Registration) -> Result<TenantRecord, AdminError> {
        let slug = parse_slug(&registration.slug)?;
        let custom_domain = registration
            .custom_domain
            .as_deref()
            .map(validate_domain)
            .transpose()?;
        let connection_override = registration
            .connection_override
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());

        let registry = self.directory.registry();
        if registry.find_by_slug(&slug).await?.is_some() {
            return Err(AdminError::Conflict(format!("slug {slug} is already registered")));
        }
        let candidate = TenantRecord {
            id: TenantId::generate(),
            slug,
            name: registration.name.trim().to_string(),
            custom_domain,
            is_active: false,
            connection_override: connection_override.map(str::to_string),
            version: 0,
            updated_at: Utc::now(),
        };
        let target = self.directory.template().derive(&candidate);
        self.ensure_target_free(&target, candidate.id).await?;

        let pending = registry
            .insert(
                &NewTenant {
                    id: candidate.id,
                    slug: &candidate.slug,
                    name: Cow::Borrowed(candidate.name.as_str()),
                    custom_domain: candidate.custom_domain.as_deref().map(Cow::Borrowed),
                    connection_override: candidate.connection_override.as_deref().map(Cow::Borrowed),
                    is_active: false,
                },
                Utc::now(),
            )
            .await?;
        self.connector.provision(pending.id, &target).await?;
        let record = registry.set_active(&pending.id, true, Utc::now()).await?;

        self.directory.invalidate(&Invalidation::Slug(record.slug.clone()));
        if let Some(domain) = &record.custom_domain {
            self.directory.invalidate(&Invalidation::Host(domain.clone()));
        }
        info!(stage = "admin", tenant = %record.slug, tenant_id = %record.id, database = %target, "tenant registered");
        Ok(record)
    }

    pub async fn set_active(&self, id: &TenantId, active: bool) -> Result<TenantRecord, AdminError> {
        if active {
            let current = self.get(id).await?;
            let target = self.directory.template().derive(&current);
            self.ensure_target_free(&target, current.id).await?;
            self.connector.provision(current.id, &target).await?;
        }
        let record = self
            .directory
            .registry()
            .set_active(id, active, Utc::now())
            .await?;
        self.directory.invalidate(&Invalidation::Id(record.id));
        info!(stage = "admin", tenant = %record.slug, active, version = record.version, "tenant activation changed");
        Ok(record)
    }

    /// Points the tenant at another store, or back at its derived one when
    /// `connection` is blank. The new store is provisioned before the switch.
    pub async fn set_connection_override(
        &self,
        id: &TenantId,
        connection: Option<&str>,
    ) -> Result<TenantRecord, AdminError> {
        let mut candidate = self.get(id).await?;
        candidate.connection_override = connection
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        let target = self.directory.template().derive(&candidate);
        if candidate.is_active {
            self.ensure_target_free(&target, candidate.id).await?;
        }
        self.connector.provision(candidate.id, &target).await?;

        let record = self
            .directory
            .registry()
            .set_connection_override(id, candidate.connection_override.as_deref(), Utc::now())
            .await?;
        self.directory.invalidate(&Invalidation::Id(record.id));
        info!(stage = "admin", tenant = %record.slug, database = %target, version = record.version, "tenant connection changed");
        Ok(record)
    }

    /// Renames the routing slug. A tenant on its derived store is pinned to
    /// that store, so its data does not move with the name.
    pub async fn rename(&self, id: &TenantId, slug: &str) -> Result<TenantRecord, AdminError> {
        let slug = parse_slug(slug)?;
        let current = self.get(id).await?;
        let pinned = self.directory.template().derive(&current);

        let record = self
            .directory
            .registry()
            .rename(id, &slug, pinned.connection(), Utc::now())
            .await?;
        self.directory.invalidate(&Invalidation::Id(record.id));
        self.directory.invalidate(&Invalidation::Slug(slug));
        info!(stage = "admin", from = %current.slug, to = %record.slug, version = record.version, "tenant renamed");
        Ok(record)
    }

    pub async fn set_custom_domain(
        &self,
        id: &TenantId,
        domain: Option<&str>,
    ) -> Result<TenantRecord, AdminError> {
        let domain = domain
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(validate_domain)
            .transpose()?;
        let record = self
            .directory
            .registry()
            .set_custom_domain(id, domain.as_deref(), Utc::now())
            .await?;
        self.directory.invalidate(&Invalidation::Id(record.id));
        if let Some(domain) = domain {
            self.directory.invalidate(&Invalidation::Host(domain));
        }
        info!(stage = "admin", tenant = %record.slug, domain = ?record.custom_domain, "tenant custom domain changed");
        Ok(record)
    }

    /// Two active tenants never share a store.
    async fn ensure_target_free(
        &self,
        target: &DataStoreTarget,
        tenant_id: TenantId,
    ) -> Result<(), AdminError> {
        let template = self.directory.template();
        let active = self.directory.registry().list_active().await?;
        match active
            .iter()
            .filter(|other| other.id != tenant_id)
            .find(|other| template.derive(other).connection() == target.connection())
        {
            Some(owner) => {
                warn!(stage = "admin", database = %target, owner = %owner.slug, "data store already in use");
                Err(AdminError::TargetInUse {
                    database: target.database().to_string(),
                    owner: owner.slug.clone(),
                })
            }
            None => Ok(()),
        }
    }
}

fn parse_slug(value: &str) -> Result<TenantSlug, AdminError> {
    TenantSlug::parse(value).map_err(|err| AdminError::InvalidSlug {
        value: value.to_string(),
        reason: err.to_string(),
    })
}

fn validate_domain(raw: &str) -> Result<String, AdminError> {
    let domain = normalize_host(raw);
    let valid = domain.len() <= MAX_DOMAIN_LEN
        && domain.contains('.')
        && domain.split('.').all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        });
    if valid {
        Ok(domain)
    } else {
        Err(AdminError::InvalidDomain(raw.to_string()))
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/tenants", get(list_tenants).post(register_tenant))
        .route("/tenants/:id", get(get_tenant))
        .route("/tenants/:id/activate", post(activate_tenant))
        .route("/tenants/:id/deactivate", post(deactivate_tenant))
        .route("/tenants/:id/connection", put(put_connection))
        .route("/tenants/:id/slug", put(put_slug))
        .route("/tenants/:id/domain", put(put_domain))
}

/// Bearer check for the admin surface; open when no admin token is configured.
pub async fn require_admin(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(expected) = state.admin_token() {
        let provided = bearer_token(request.headers()).unwrap_or_default();
        if !bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
            warn!(stage = "admin", "admin request rejected");
            return ProblemResponse::new(
                StatusCode::UNAUTHORIZED,
                "admin_unauthorized",
                "missing or invalid admin token",
            )
            .into_response();
        }
    }
    next.run(request).await
}

#[derive(Debug, Deserialize)]
struct ConnectionBody {
    #[serde(default)]
    connection_override: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SlugBody {
    slug: String,
}

#[derive(Debug, Deserialize)]
struct DomainBody {
    #[serde(default)]
    custom_domain: Option<String>,
}

fn tenant_id(raw: &str) -> Result<TenantId, ProblemResponse> {
    raw.parse().map_err(|_| {
        ProblemResponse::new(
            StatusCode::BAD_REQUEST,
            "invalid_tenant_id",
            format!("{raw:?} is not a tenant id"),
        )
    })
}

async fn list_tenants(State(state): State<AppState>) -> Result<Json<Vec<TenantRecord>>, ProblemResponse> {
    Ok(Json(state.admin().list().await?))
}

async fn get_tenant(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TenantRecord>, ProblemResponse> {
    Ok(Json(state.admin().get(&tenant_id(&id)?).await?))
}

async fn register_tenant(
    State(state): State<AppState>,
    Json(registration): Json<Registration>,
) -> Result<(StatusCode, Json<TenantRecord>), ProblemResponse> {
    let record = state.admin().register(registration).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn activate_tenant(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TenantRecord>, ProblemResponse> {
    Ok(Json(state.admin().set_active(&tenant_id(&id)?, true).await?))
}

async fn deactivate_tenant(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TenantRecord>, ProblemResponse> {
    Ok(Json(state.admin().set_active(&tenant_id(&id)?, false).await?))
}

async fn put_connection(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ConnectionBody>,
) -> Result<Json<TenantRecord>, ProblemResponse> {
    let record = state
        .admin()
        .set_connection_override(&tenant_id(&id)?, body.connection_override.as_deref())
        .await?;
    Ok(Json(record))
}

async fn put_slug(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SlugBody>,
) -> Result<Json<TenantRecord>, ProblemResponse> {
    Ok(Json(state.admin().rename(&tenant_id(&id)?, &body.slug).await?))
}

async fn put_domain(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<DomainBody>,
) -> Result<Json<TenantRecord>, ProblemResponse> {
    let record = state
        .admin()
        .set_custom_domain(&tenant_id(&id)?, body.custom_domain.as_deref())
        .await?;
    Ok(Json(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{LookupKey, ResolveError};
    use crate::test_support::{harness, slug};

    #[tokio::test]
    async fn deactivate_and_reactivate_take_effect_immediately() {
        let h = harness().await;
        let acme = h.register("acme").await;
        let key = LookupKey::Slug(slug("acme"));
        assert_eq!(
            h.directory.resolve(&key).await.expect("resolve").target().database(),
            "db_acme"
        );

        h.admin.set_active(&acme.id, false).await.expect("deactivate");
        assert!(matches!(
            h.directory.resolve(&key).await,
            Err(ResolveError::TenantInactive(_))
        ));

        h.admin.set_active(&acme.id, true).await.expect("reactivate");
        let context = h.directory.resolve(&key).await.expect("resolve");
        assert_eq!(context.target().database(), "db_acme");
    }

    #[tokio::test]
    async fn override_is_provisioned_and_visible_after_return() {
        let h = harness().await;
        let acme = h.register("acme").await;
        h.directory
            .get(&LookupKey::Id(acme.id))
            .await
            .expect("warm cache");

        let moved = h.store_url("acme-dedicated");
        let record = h
            .admin
            .set_connection_override(&acme.id, Some(&moved))
            .await
            .expect("override");
        assert_eq!(record.connection_override.as_deref(), Some(moved.as_str()));
        assert!(h.dir.path().join("acme-dedicated.db").exists());

        let resolved = h.directory.get(&LookupKey::Id(acme.id)).await.expect("lookup");
        assert_eq!(resolved.target.connection(), moved);
    }

    #[tokio::test]
    async fn active_tenants_never_share_a_store() {
        let h = harness().await;
        let acme = h.register("acme").await;
        let globex = h.register("globex").await;
        let acme_store = h.directory.template().derive(&acme);

        let err = h
            .admin
            .set_connection_override(&globex.id, Some(acme_store.connection()))
            .await
            .unwrap_err();
        assert!(matches!(err, AdminError::TargetInUse { ref owner, .. } if owner.as_str() == "acme"));
    }

    #[tokio::test]
    async fn rename_keeps_the_store_and_retires_the_old_slug() {
        let h = harness().await;
        let acme = h.register("acme").await;
        let old_key = LookupKey::Slug(slug("acme"));
        let before = h.directory.resolve(&old_key).await.expect("resolve");

        h.admin.rename(&acme.id, "acme-corp").await.expect("rename");

        assert!(matches!(
            h.directory.resolve(&old_key).await,
            Err(ResolveError::TenantNotFound(_))
        ));
        let after = h
            .directory
            .resolve(&LookupKey::Slug(slug("acme-corp")))
            .await
            .expect("resolve");
        assert_eq!(after.tenant_id(), acme.id);
        assert_eq!(after.target().connection(), before.target().connection());
    }

    #[tokio::test]
    async fn custom_domain_replaces_cached_subdomain_resolution() {
        let h = harness().await;
        h.register("acme").await;
        let globex = h.register("globex").await;
        let host = LookupKey::host("acme.example.com");
        assert_eq!(
            h.directory.resolve(&host).await.expect("resolve").slug().as_str(),
            "acme"
        );

        h.admin
            .set_custom_domain(&globex.id, Some("ACME.example.com"))
            .await
            .expect("domain");
        assert_eq!(
            h.directory.resolve(&host).await.expect("resolve").slug().as_str(),
            "globex"
        );
    }

    #[tokio::test]
    async fn registration_rejects_bad_input() {
        let h = harness().await;
        h.register("acme").await;

        let duplicate = h
            .admin
            .register(Registration {
                slug: "ACME".to_string(),
                name: "Acme again".to_string(),
                custom_domain: None,
                connection_override: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(duplicate, AdminError::Conflict(_)));

        let bad_domain = h
            .admin
            .register(Registration {
                slug: "globex".to_string(),
                name: "Globex".to_string(),
                custom_domain: Some("not a domain".to_string()),
                connection_override: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(bad_domain, AdminError::InvalidDomain(_)));

        assert!(matches!(
            h.admin.set_active(&TenantId::generate(), true).await,
            Err(AdminError::NotFound)
        ));
    }
}
